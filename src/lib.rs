//! muxfetch library
//!
//! An asynchronous HTTP client engine that drives many concurrent requests
//! over pooled libcurl handles, multiplexed on a single-threaded tokio
//! reactor, with proxy failover and bounded response capture.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`http`] - Transfer engine, requests, sessions and the failover loop
//! - [`fetch`] - Page and resource fetchers built on the failover loop
//!
//! The engine is `!Send` and must run inside a tokio
//! [`LocalSet`](tokio::task::LocalSet).

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod fetch;
pub mod http;

// Re-export commonly used types
pub use fetch::{Page, PageRules, ResourceCheck, ResourceFetch, fetch_page, fetch_resource};
pub use http::{
    Attempt, Body, Client, Engine, FailureType, FetchError, HttpError, Method, PoolStats, Request,
    RequestOptions, Response, RetryPolicy, Session, SessionConfig, classify_error, with_failover,
};
