//! Constants for the http module (timeouts, size cap, retry budget, default headers).

use std::time::Duration;

/// Default connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Hard cap on a captured response body (100 MB).
///
/// Anything larger is treated as an abusive payload and the transfer is aborted.
pub const MAX_RESPONSE_SIZE: usize = 100_000_000;

/// Default number of attempts per proxy in the failover loop.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Default pause after every proxy in the list has been tried once.
pub const PROXY_CYCLE_WAIT: Duration = Duration::from_secs(20);

/// Browser-like request headers sent unless overridden.
///
/// No `Accept-Encoding`: libcurl advertises the encodings
/// it can actually decode.
pub const DEFAULT_HEADERS: &[(&str, &str)] = &[
    (
        "Accept",
        "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
    ),
    ("Accept-Language", "en-US,en;q=0.5"),
    ("Connection", "keep-alive"),
    ("Sec-Fetch-Dest", "document"),
    ("Sec-Fetch-Mode", "navigate"),
    ("Sec-Fetch-Site", "cross-site"),
    ("Upgrade-Insecure-Requests", "1"),
    (
        "User-Agent",
        "Mozilla/5.0 (Windows NT 10.0; rv:109.0) Gecko/20100101 Firefox/115.0",
    ),
];
