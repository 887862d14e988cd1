//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use mediarelay_core::Script;

/// Relay media items from a content source to a resumable upload sink.
///
/// Each locator is resolved, downloaded in parallel segments, given a title,
/// description and category, then uploaded in resumable chunks. Items run in
/// the order given. Locators come from arguments, else `MEDIARELAY_LOCATORS`
/// (comma-separated), else one per line on stdin.
#[derive(Parser, Debug)]
#[command(name = "mediarelay")]
#[command(author, version, about)]
pub struct Args {
    /// Source locators to transfer, in order
    pub locators: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/mediarelay/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Concurrent segment workers per item (1-64)
    #[arg(short = 'w', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub workers: Option<u8>,

    /// Segment size in KiB
    #[arg(long, value_name = "KIB", value_parser = clap::value_parser!(u64).range(1..))]
    pub segment_size_kib: Option<u64>,

    /// Upload chunk size in KiB
    #[arg(long, value_name = "KIB", value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size_kib: Option<u64>,

    /// Fetch attempts per segment before the item fails (1-20)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub segment_attempts: Option<u32>,

    /// Attempts per upload request before the item fails (1-20)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub upload_attempts: Option<u32>,

    /// Give up on an item after this many seconds
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub item_timeout: Option<u64>,

    /// Directory for temporary assembly files
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,

    /// Visibility of uploaded objects (e.g. private, unlisted, public)
    #[arg(long, value_name = "STATUS")]
    pub privacy: Option<String>,

    /// Script not allowed in titles; repeat for several (e.g. sinhala, tamil)
    #[arg(long = "forbid-script", value_name = "SCRIPT")]
    pub forbid_scripts: Vec<Script>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Print the batch report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}
