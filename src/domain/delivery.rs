use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal outcome of dispatching one entry to one sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "delivered" => Ok(DeliveryStatus::Delivered),
            "failed" => Ok(DeliveryStatus::Failed),
            _ => Err(format!("Unknown delivery status: {}", s)),
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub entry_id: i64,
    pub sink_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn delivered(entry_id: i64, sink_id: impl Into<String>, attempts: u32) -> Self {
        Self {
            entry_id,
            sink_id: sink_id.into(),
            status: DeliveryStatus::Delivered,
            attempts,
            last_error: None,
            delivered_at: Utc::now(),
        }
    }

    pub fn failed(
        entry_id: i64,
        sink_id: impl Into<String>,
        attempts: u32,
        error: impl Into<String>,
    ) -> Self {
        Self {
            entry_id,
            sink_id: sink_id.into(),
            status: DeliveryStatus::Failed,
            attempts,
            last_error: Some(error.into()),
            delivered_at: Utc::now(),
        }
    }
}

/// Per-sink delivery counts, as shown by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeliverySummary {
    pub sink_id: String,
    pub delivered: u64,
    pub failed: u64,
}
