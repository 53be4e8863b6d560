//! One HTTP request bound to one pooled handle.
//!
//! A [`Request`] moves through `Created → Registered → Closed`. Building it
//! takes a handle from the engine's pool and applies every transfer option;
//! [`Request::perform`] registers the handle and returns a [`ResponseFuture`]
//! that resolves exactly once. [`Request::close`] (also run on drop) puts the
//! handle back, detaching it first if the transfer is still running.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use curl::easy::{Easy2, HttpVersion, List};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use url::form_urlencoded;

use super::collector::Collector;
use super::constants::{CONNECT_TIMEOUT_SECS, DEFAULT_HEADERS, MAX_RESPONSE_SIZE};
use super::engine::Engine;
use super::error::HttpError;
use super::response::Response;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// GET
    Get,
    /// HEAD; no body is transferred.
    Head,
    /// POST with the body from [`RequestOptions::body`].
    Post,
}

/// Request payload for [`Method::Post`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Bytes sent as-is.
    Raw(Vec<u8>),
    /// Pairs sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
}

impl Body {
    fn encode(&self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) => bytes.clone(),
            Self::Form(pairs) => form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish()
                .into_bytes(),
        }
    }
}

/// Per-request transfer options.
///
/// Every field is optional so option sets can be layered with
/// [`RequestOptions::merge`]; unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Request headers, in send order. Names compare case-insensitively.
    pub headers: Vec<(String, String)>,
    /// Proxy URL, e.g. `http://10.0.0.1:3128` or `socks5h://host:1080`.
    pub proxy: Option<String>,
    /// Connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Body byte cap.
    pub max_response_size: Option<usize>,
    /// Route libcurl's verbose output to `trace` logs.
    pub verbose: bool,
    /// POST payload.
    pub body: Option<Body>,
}

impl RequestOptions {
    /// The engine-level defaults: browser headers, 30 s connect timeout,
    /// 100 MB body cap.
    #[must_use]
    pub fn engine_defaults() -> Self {
        Self {
            headers: DEFAULT_HEADERS
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                .collect(),
            connect_timeout: Some(Duration::from_secs(CONNECT_TIMEOUT_SECS)),
            max_response_size: Some(MAX_RESPONSE_SIZE),
            ..Self::default()
        }
    }

    /// Sets (or replaces) one header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        set_header(&mut self.headers, name.into(), value.into());
        self
    }

    /// Sets the proxy.
    #[must_use]
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Sets the body byte cap.
    #[must_use]
    pub fn max_response_size(mut self, limit: usize) -> Self {
        self.max_response_size = Some(limit);
        self
    }

    /// Enables libcurl verbose tracing.
    #[must_use]
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Sets the POST payload.
    #[must_use]
    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Layers `overlay` on top of `self`.
    ///
    /// Headers merge key-wise: a header already present is replaced in place,
    /// new ones are appended. Scalar options set in `overlay` win.
    pub fn merge(&mut self, overlay: &Self) {
        for (name, value) in &overlay.headers {
            set_header(&mut self.headers, name.clone(), value.clone());
        }
        if overlay.proxy.is_some() {
            self.proxy.clone_from(&overlay.proxy);
        }
        if overlay.connect_timeout.is_some() {
            self.connect_timeout = overlay.connect_timeout;
        }
        if overlay.max_response_size.is_some() {
            self.max_response_size = overlay.max_response_size;
        }
        self.verbose |= overlay.verbose;
        if overlay.body.is_some() {
            self.body.clone_from(&overlay.body);
        }
    }

    /// Looks a header up by name, case-insensitively.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn set_header(headers: &mut Vec<(String, String)>, name: String, value: String) {
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
        Some(slot) => slot.1 = value,
        None => headers.push((name, value)),
    }
}

/// Applies every option to a freshly reset handle.
fn configure(
    easy: &mut Easy2<Collector>,
    method: Method,
    url: &str,
    options: &RequestOptions,
) -> Result<(), curl::Error> {
    easy.get_mut()
        .prepare(url, options.max_response_size.unwrap_or(MAX_RESPONSE_SIZE));
    easy.url(url)?;
    // Not every libcurl build has HTTP/2.
    if let Err(error) = easy.http_version(HttpVersion::V2TLS) {
        trace!(%error, "HTTP/2 unavailable, using libcurl default");
    }
    easy.accept_encoding("")?;
    easy.follow_location(true)?;

    let mut headers = List::new();
    for (name, value) in &options.headers {
        headers.append(&format!("{name}: {value}"))?;
    }
    easy.http_headers(headers)?;

    if let Some(proxy) = &options.proxy {
        easy.proxy(proxy)?;
    }
    easy.connect_timeout(
        options
            .connect_timeout
            .unwrap_or(Duration::from_secs(CONNECT_TIMEOUT_SECS)),
    )?;
    easy.verbose(options.verbose)?;

    match method {
        Method::Get => easy.get(true)?,
        Method::Head => easy.nobody(true)?,
        Method::Post => {
            easy.post(true)?;
            let payload = options.body.as_ref().map(Body::encode).unwrap_or_default();
            easy.post_fields_copy(&payload)?;
        }
    }
    Ok(())
}

enum State {
    Created(Easy2<Collector>),
    Registered(usize),
    Closed,
}

/// A single HTTP request owning one pooled handle until closed.
pub struct Request {
    engine: Engine,
    url: String,
    method: Method,
    state: State,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state {
            State::Created(_) => "created",
            State::Registered(_) => "registered",
            State::Closed => "closed",
        };
        f.debug_struct("Request")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("state", &state)
            .finish()
    }
}

impl Request {
    pub(crate) fn new(
        engine: Engine,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Self, HttpError> {
        let mut easy = engine.acquire();
        if let Err(error) = configure(&mut easy, method, url, options) {
            engine.release(easy);
            return Err(HttpError::setup(url, error));
        }
        Ok(Self {
            engine,
            url: url.to_string(),
            method,
            state: State::Created(easy),
        })
    }

    /// The requested URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request method.
    #[must_use]
    pub fn method(&self) -> Method {
        self.method
    }

    /// True once `perform` has handed the handle to the engine.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        matches!(self.state, State::Registered(_))
    }

    /// True once the request has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Starts the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::AlreadyPerforming`] if the request was already
    /// performed or closed, or [`HttpError::Engine`] if the multi handle
    /// refuses the transfer.
    pub fn perform(&mut self) -> Result<ResponseFuture, HttpError> {
        let easy = match std::mem::replace(&mut self.state, State::Closed) {
            State::Created(easy) => easy,
            other => {
                self.state = other;
                return Err(HttpError::already_performing(&self.url));
            }
        };
        let (notify, rx) = oneshot::channel();
        let token = self.engine.register(easy, &self.url, notify)?;
        self.state = State::Registered(token);
        Ok(ResponseFuture {
            url: self.url.clone(),
            rx,
            guard: TransferGuard {
                engine: self.engine.clone(),
                token,
            },
        })
    }

    /// Releases the handle. Safe to call any number of times.
    ///
    /// A still-running transfer is detached first; its future then resolves
    /// with [`HttpError::Abandoned`].
    pub fn close(&mut self) {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Created(easy) => self.engine.release(easy),
            State::Registered(token) => self.engine.abandon(token),
            State::Closed => return,
        }
        debug!(url = %self.url, "request closed");
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        self.close();
    }
}

/// Detaches the transfer if the future is dropped before it resolves.
struct TransferGuard {
    engine: Engine,
    token: usize,
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        self.engine.abandon(self.token);
    }
}

/// Resolves once with the transfer's outcome.
///
/// Dropping it before completion cancels the transfer and returns the handle
/// to the pool.
pub struct ResponseFuture {
    url: String,
    rx: oneshot::Receiver<Result<Response, HttpError>>,
    guard: TransferGuard,
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("url", &self.url)
            .field("token", &self.guard.token)
            .finish()
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response, HttpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(HttpError::abandoned(&this.url))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // ==================== Option Merging ====================

    #[test]
    fn test_engine_defaults_have_browser_headers() {
        let options = RequestOptions::engine_defaults();
        assert!(options.header_value("user-agent").unwrap().contains("Firefox"));
        assert!(options.header_value("accept-encoding").is_none());
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(30)));
        assert_eq!(options.max_response_size, Some(100_000_000));
    }

    #[test]
    fn test_merge_replaces_headers_case_insensitively_in_place() {
        let mut base = RequestOptions::default()
            .header("Accept", "text/html")
            .header("X-First", "1");
        let overlay = RequestOptions::default()
            .header("accept", "application/json")
            .header("X-New", "2");
        base.merge(&overlay);

        assert_eq!(
            base.headers,
            vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("X-First".to_string(), "1".to_string()),
                ("X-New".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn test_merge_overlay_scalars_win_only_when_set() {
        let mut base = RequestOptions::default()
            .proxy("http://a:1")
            .connect_timeout(Duration::from_secs(5));
        base.merge(&RequestOptions::default().max_response_size(10));

        assert_eq!(base.proxy.as_deref(), Some("http://a:1"));
        assert_eq!(base.connect_timeout, Some(Duration::from_secs(5)));
        assert_eq!(base.max_response_size, Some(10));

        base.merge(&RequestOptions::default().proxy("http://b:2"));
        assert_eq!(base.proxy.as_deref(), Some("http://b:2"));
    }

    // ==================== Bodies ====================

    #[test]
    fn test_form_body_is_url_encoded() {
        let body = Body::Form(vec![
            ("q".to_string(), "a b&c".to_string()),
            ("page".to_string(), "2".to_string()),
        ]);
        assert_eq!(body.encode(), b"q=a+b%26c&page=2");
    }

    #[test]
    fn test_raw_body_is_sent_verbatim() {
        assert_eq!(Body::Raw(b"{\"a\":1}".to_vec()).encode(), b"{\"a\":1}");
    }

    // ==================== Lifecycle ====================

    #[test]
    fn test_close_is_idempotent_and_returns_handle_once() {
        let engine = Engine::new().unwrap();
        let mut request = engine
            .request(Method::Get, "http://127.0.0.1:9/", &RequestOptions::default())
            .unwrap();
        assert_eq!(engine.pool_stats().idle, 0);

        request.close();
        request.close();
        request.close();
        drop(request);

        assert_eq!(engine.pool_stats().created, 1);
        assert_eq!(engine.pool_stats().idle, 1);
    }

    #[test]
    fn test_perform_after_close_is_programming_error() {
        let engine = Engine::new().unwrap();
        let mut request = engine
            .request(Method::Head, "http://127.0.0.1:9/", &RequestOptions::default())
            .unwrap();
        request.close();

        let error = request.perform().unwrap_err();
        assert!(error.is_programming_error());
        assert!(request.is_closed());
    }
}
