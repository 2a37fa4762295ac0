use clap::{Parser, Subcommand};

use crate::domain::MAX_POLL_INTERVAL_SECS;

#[derive(Parser)]
#[command(name = "feedrelay")]
#[command(about = "Polls RSS, Atom and JSON feeds and relays new entries to chat channels")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a feed, or a page that advertises one
    Add {
        /// Feed or site URL to add
        url: String,

        /// Poll interval for this source, in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..=MAX_POLL_INTERVAL_SECS))]
        interval: Option<u64>,

        /// Channel to deliver to; repeat for several (default: every configured sink)
        #[arg(long = "sink")]
        sinks: Vec<String>,
    },

    /// Disable a source (interactive selection when no id is given)
    Remove {
        /// Source id as shown by `list`
        id: Option<i64>,
    },

    /// Re-enable a disabled source and reset its failure count
    Enable {
        /// Source id as shown by `list`
        id: i64,
    },

    /// List all sources
    List,

    /// Show disabled sources and delivery counts per sink
    Status,

    /// Import sources from OPML file
    Import {
        /// Path to OPML file
        path: String,
    },

    /// Export sources to OPML format
    Export {
        /// Output file path (prints to stdout if not specified)
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Poll sources and deliver new entries until interrupted
    Run {
        /// Poll every source once, deliver what was found, then exit
        #[arg(long)]
        once: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_with_sinks_and_interval() {
        let cli = Cli::try_parse_from([
            "feedrelay",
            "add",
            "https://example.com",
            "--interval",
            "600",
            "--sink",
            "news",
            "--sink",
            "alerts",
        ])
        .unwrap();

        match cli.command {
            Commands::Add {
                url,
                interval,
                sinks,
            } => {
                assert_eq!(url, "https://example.com");
                assert_eq!(interval, Some(600));
                assert_eq!(sinks, vec!["news", "alerts"]);
            }
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_add_rejects_out_of_range_interval() {
        for interval in ["0", "9223372036854775807"] {
            let result =
                Cli::try_parse_from(["feedrelay", "add", "https://example.com", "--interval", interval]);
            assert!(result.is_err(), "accepted --interval {}", interval);
        }
    }

    #[test]
    fn test_remove_id_is_optional() {
        let cli = Cli::try_parse_from(["feedrelay", "remove"]).unwrap();
        assert!(matches!(cli.command, Commands::Remove { id: None }));

        let cli = Cli::try_parse_from(["feedrelay", "remove", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Remove { id: Some(3) }));
    }
}
