//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Fetch URLs concurrently through a rotating list of proxies.
///
/// Every URL is fetched on one multiplexed libcurl engine. Failures on a
/// proxy move on to the next one; when all proxies have been tried the
/// URL is reported as failed.
#[derive(Parser, Debug)]
#[command(name = "muxfetch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch (read from stdin when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Proxy to rotate through (repeatable, overrides config file proxies)
    #[arg(short = 'x', long = "proxy", value_name = "URL")]
    pub proxies: Vec<String>,

    /// Config file path (default: $XDG_CONFIG_HOME/muxfetch/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Attempts per proxy (1-100)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=100))]
    pub retries: Option<u32>,

    /// Connect timeout in seconds (1-3600)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub connect_timeout: Option<u64>,

    /// Response body cap in bytes
    #[arg(long, value_name = "BYTES", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_size: Option<u64>,

    /// Pause after all proxies were tried, in seconds (0-3600)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(0..=3600))]
    pub cycle_wait: Option<u64>,

    /// Give up on a URL after this many seconds of retrying
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub deadline: Option<u64>,

    /// Treat the response as an HTML page (retry partial pages, detect bans)
    #[arg(long)]
    pub page: bool,

    /// Write each response body to stdout
    #[arg(short = 'o', long)]
    pub output: bool,
}
