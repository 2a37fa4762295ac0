use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dispatch::{DeliveryJob, DispatchHandle};
use crate::domain::Notification;
use crate::errors::FeederResult;
use crate::storage::Store;

/// Most pending entries re-queued per sink at startup
pub const RECOVERY_LIMIT: usize = 1000;

/// Queue stored entries that never reached a resolved delivery, e.g.
/// because the process stopped with jobs still queued. Returns the number
/// of jobs queued across all sinks.
pub async fn requeue_undelivered(
    store: &Store,
    dispatch: &DispatchHandle,
    limit: usize,
    cancel: &CancellationToken,
) -> FeederResult<usize> {
    let mut queued = 0;

    for sink_id in dispatch.sink_ids() {
        let sink = sink_id.clone();
        let pending = store
            .run("undelivered_for_sink", move |s| {
                s.entries.undelivered_for_sink(&sink, limit)
            })
            .await?;
        if pending.is_empty() {
            continue;
        }

        info!(sink = %sink_id, pending = pending.len(), "Re-queueing undelivered entries");
        for item in pending {
            let job = DeliveryJob {
                entry_id: item.entry.id,
                notification: Notification::new(&item.source_title, &item.entry.entry),
            };
            dispatch.enqueue(&sink_id, job, cancel).await?;
            queued += 1;
        }
    }

    Ok(queued)
}
