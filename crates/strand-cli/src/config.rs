use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "strand", about = "Inspect and feed a Strand log store")]
pub struct Cli {
    /// Store directory (holds `log/` and `indexes.redb`)
    #[arg(long, global = true, default_value = "./strand-data")]
    pub dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Append a message and update the indexes
    Append {
        /// Author feed id
        #[arg(long)]
        author: String,
        /// Message type
        #[arg(long = "type")]
        kind: String,
        /// Message content as JSON (plain text is stored as a string)
        #[arg(long)]
        content: String,
    },
    /// Print the message at a seq
    Get {
        seq: i64,
    },
    /// Print a range of messages
    Query {
        /// Only seqs greater than this
        #[arg(long)]
        gt: Option<i64>,
        /// Only seqs less than this
        #[arg(long)]
        lt: Option<i64>,
        /// Maximum number of messages
        #[arg(long)]
        limit: Option<i64>,
        /// Newest first
        #[arg(long)]
        reverse: bool,
    },
    /// Follow new messages until interrupted
    Tail {
        /// Start from the first message instead of the current end
        #[arg(long)]
        all: bool,
    },
    /// Redact the message at a seq
    Null {
        seq: i64,
    },
    /// Print each index's resume position
    IndexSeq,
    /// Run a subset query, e.g. '{"op":"author","feed":"@alice"}'
    Subset {
        query: String,
        /// Newest first
        #[arg(long)]
        descending: bool,
        /// Maximum number of messages
        #[arg(long)]
        limit: Option<usize>,
    },
}
