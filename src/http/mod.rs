//! Multiplexed HTTP client engine on top of libcurl's multi interface.
//!
//! Many transfers run concurrently on one thread: libcurl decides which
//! sockets to watch and when to time out, a reactor bridge turns that into
//! tokio readiness waits and timers, and each request resolves a future when
//! its transfer finishes. Handles are pooled and reset between requests.
//!
//! # Features
//!
//! - Single-threaded, `LocalSet`-driven engine with no global state
//! - Unbounded handle pool that never grows past peak concurrency
//! - Redirect-aware header parsing with folded lines and prior hops kept
//! - Hard response size cap (100 MB by default)
//! - Proxy rotation and a retry-and-failover loop with typed outcomes
//!
//! # Example
//!
//! ```no_run
//! use muxfetch::http::{Engine, Session, SessionConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let local = tokio::task::LocalSet::new();
//! local
//!     .run_until(async {
//!         let session = Session::new(Engine::new()?, SessionConfig::default());
//!         let response = session.get("https://example.com/").await?;
//!         println!("{} {} bytes", response.status, response.body.len());
//!         Ok::<_, Box<dyn std::error::Error>>(())
//!     })
//!     .await
//! # }
//! ```

mod collector;
pub mod constants;
mod engine;
mod error;
pub mod header;
mod multi;
mod pool;
mod reactor;
mod request;
mod response;
mod retry;
mod session;

pub use engine::Engine;
pub use error::{FetchError, HttpError};
pub use header::{HeaderList, HeaderParser, HeaderState, Hop, MalformedHeaderLine};
pub use pool::PoolStats;
pub use request::{Body, Method, Request, RequestOptions, ResponseFuture};
pub use response::Response;
pub use retry::{Attempt, FailureType, RetryPolicy, classify_error, with_failover};
pub use session::{Client, Session, SessionConfig};
