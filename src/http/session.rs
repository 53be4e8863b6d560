//! Sessions: layered default options plus a rotating proxy cursor.

use std::cell::RefCell;
use std::ops::Range;
use std::rc::Rc;
use std::time::Duration;

use tracing::{debug, info};

use super::constants::PROXY_CYCLE_WAIT;
use super::engine::Engine;
use super::error::HttpError;
use super::request::{Body, Method, Request, RequestOptions};
use super::response::Response;

/// Session-level configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Options layered over the engine defaults for every request.
    pub defaults: RequestOptions,
    /// Proxies to rotate through. Empty means direct connections.
    pub proxies: Vec<String>,
    /// Pause after a full pass over the proxy list.
    pub proxy_cycle_wait: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            defaults: RequestOptions::default(),
            proxies: Vec::new(),
            proxy_cycle_wait: PROXY_CYCLE_WAIT,
        }
    }
}

#[derive(Debug, Default)]
struct Rotation {
    cursor: usize,
    cycles: u32,
    /// Cycle wait owed by a pass that ended on wraparound.
    deferred_wait: Option<Duration>,
}

/// Request defaults plus proxy rotation state, reused across many requests.
///
/// Option precedence, lowest first: engine defaults, session defaults,
/// per-call options, then the current proxy.
///
/// Clones share the proxy cursor, so concurrent fetches through clones of
/// one session see each other's rotations.
#[derive(Debug, Clone)]
pub struct Session {
    engine: Engine,
    defaults: RequestOptions,
    proxies: Rc<[String]>,
    cycle_wait: Duration,
    rotation: Rc<RefCell<Rotation>>,
}

impl Session {
    /// Creates a session on `engine`.
    #[must_use]
    pub fn new(engine: Engine, config: SessionConfig) -> Self {
        let mut defaults = RequestOptions::engine_defaults();
        defaults.merge(&config.defaults);
        Self {
            engine,
            defaults,
            proxies: Rc::from(config.proxies),
            cycle_wait: config.proxy_cycle_wait,
            rotation: Rc::default(),
        }
    }

    /// The engine requests run on.
    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Merged default options, without the proxy.
    #[must_use]
    pub fn defaults(&self) -> &RequestOptions {
        &self.defaults
    }

    /// Proxies in rotation order.
    #[must_use]
    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    /// The proxy requests currently go through, if any.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxies.get(self.cursor()).map(String::as_str)
    }

    /// Index of the current proxy. Always within `0..proxies().len()` when
    /// proxies are configured.
    #[must_use]
    pub fn cursor(&self) -> usize {
        self.rotation.borrow().cursor
    }

    /// How many times rotation has wrapped back to the first proxy.
    #[must_use]
    pub fn cycles(&self) -> u32 {
        self.rotation.borrow().cycles
    }

    /// Pause applied after a full pass over the proxy list.
    #[must_use]
    pub fn cycle_wait(&self) -> Duration {
        self.cycle_wait
    }

    /// One index per proxy, or a single direct attempt when none are set.
    #[must_use]
    pub fn ways_out(&self) -> Range<usize> {
        0..self.proxies.len().max(1)
    }

    /// Snapshot of the session bound to the current proxy.
    #[must_use]
    pub fn client(&self) -> Client {
        let slot = self.cursor();
        Client {
            engine: self.engine.clone(),
            defaults: self.defaults.clone(),
            proxy: self.proxies.get(slot).cloned(),
            slot,
        }
    }

    /// Builds a request with the session's options and current proxy.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Setup`] if libcurl rejects one of the options.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Request, HttpError> {
        self.client().request(method, url, options)
    }

    /// Performs one request through the current proxy. No retries.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        self.client().fetch(method, url, options).await
    }

    /// GET through the current proxy.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.client().get(url).await
    }

    /// HEAD through the current proxy.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.client().head(url).await
    }

    /// POST through the current proxy.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn post(&self, url: &str, body: Body) -> Result<Response, HttpError> {
        self.client().post(url, body).await
    }

    /// Advances to the next proxy.
    ///
    /// On wraparound to the first proxy, sleeps for `wait` before returning.
    pub async fn rotate(&mut self, wait: Option<Duration>) {
        let from = self.cursor();
        if self.step(from) {
            self.cycle_pause(wait).await;
        }
    }

    /// Moves past the proxy `client` is pinned to and reports whether the
    /// cursor wrapped. Sleeps for `wait` on wraparound.
    ///
    /// Does nothing if a clone of this session already moved past it.
    pub async fn rotate_past(&self, client: &Client, wait: Option<Duration>) -> bool {
        let wrapped = self.step(client.slot);
        if wrapped {
            self.cycle_pause(wait).await;
        }
        wrapped
    }

    /// Owes `wait` to the next pass instead of sleeping now.
    pub fn defer_cycle_wait(&self, wait: Option<Duration>) {
        if let Some(wait) = wait.filter(|wait| !wait.is_zero()) {
            debug!(wait_secs = wait.as_secs_f64(), "cycle wait deferred to next pass");
            self.rotation.borrow_mut().deferred_wait = Some(wait);
        }
    }

    /// Serves a cycle wait deferred by an earlier pass, if any.
    pub async fn serve_deferred_wait(&self) {
        let owed = self.rotation.borrow_mut().deferred_wait.take();
        if owed.is_some() {
            self.cycle_pause(owed).await;
        }
    }

    /// Advances the cursor if it still points at `from`. True on wraparound.
    fn step(&self, from: usize) -> bool {
        if self.proxies.is_empty() {
            return false;
        }
        let mut rotation = self.rotation.borrow_mut();
        if rotation.cursor != from {
            debug!(stale = from, cursor = rotation.cursor, "proxy already rotated away");
            return false;
        }
        rotation.cursor = (from + 1) % self.proxies.len();
        info!(
            from = %self.proxies[from],
            to = %self.proxies[rotation.cursor],
            "rotating proxy"
        );
        if rotation.cursor != 0 {
            return false;
        }
        rotation.cycles += 1;
        true
    }

    async fn cycle_pause(&self, wait: Option<Duration>) {
        match wait {
            Some(wait) if !wait.is_zero() => {
                info!(
                    cycles = self.cycles(),
                    wait_secs = wait.as_secs_f64(),
                    "all proxies tried, waiting before next pass"
                );
                tokio::time::sleep(wait).await;
            }
            _ => debug!(cycles = self.cycles(), "all proxies tried"),
        }
    }
}

/// A session snapshot pinned to one proxy.
///
/// Handed to each failover attempt so the attempt can run requests while
/// the loop keeps the session itself for rotation.
#[derive(Debug, Clone)]
pub struct Client {
    engine: Engine,
    defaults: RequestOptions,
    proxy: Option<String>,
    slot: usize,
}

impl Client {
    /// The proxy this client is pinned to.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Effective options for one call.
    #[must_use]
    pub fn options(&self, overlay: &RequestOptions) -> RequestOptions {
        let mut options = self.defaults.clone();
        options.merge(overlay);
        if self.proxy.is_some() {
            options.proxy.clone_from(&self.proxy);
        }
        options
    }

    /// Builds a request; see [`Session::request`].
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Setup`] if libcurl rejects one of the options.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Request, HttpError> {
        self.engine.request(method, url, &self.options(options))
    }

    /// Performs one request. No retries.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        self.engine.fetch(method, url, &self.options(options)).await
    }

    /// GET.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        self.fetch(Method::Get, url, &RequestOptions::default()).await
    }

    /// HEAD.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn head(&self, url: &str) -> Result<Response, HttpError> {
        self.fetch(Method::Head, url, &RequestOptions::default()).await
    }

    /// POST.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    pub async fn post(&self, url: &str, body: Body) -> Result<Response, HttpError> {
        self.fetch(Method::Post, url, &RequestOptions::default().body(body))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn session(proxies: &[&str]) -> Session {
        let config = SessionConfig {
            proxies: proxies.iter().map(|p| (*p).to_string()).collect(),
            ..SessionConfig::default()
        };
        Session::new(Engine::new().unwrap(), config)
    }

    // ==================== Rotation ====================

    #[test]
    fn test_rotate_without_proxies_is_noop() {
        let mut session = session(&[]);
        assert_eq!(session.ways_out(), 0..1);
        tokio_test::block_on(session.rotate(Some(Duration::from_secs(3600))));
        assert_eq!(session.cursor(), 0);
        assert_eq!(session.cycles(), 0);
        assert_eq!(session.proxy(), None);
    }

    #[tokio::test]
    async fn test_rotate_wraps_once_per_full_cycle() {
        let mut session = session(&["http://a:1", "http://b:2", "http://c:3"]);
        assert_eq!(session.ways_out(), 0..3);

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(session.proxy().unwrap().to_string());
            session.rotate(None).await;
        }
        assert_eq!(
            seen,
            ["http://a:1", "http://b:2", "http://c:3", "http://a:1", "http://b:2", "http://c:3"]
        );
        assert_eq!(session.cursor(), 0);
        assert_eq!(session.cycles(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotate_waits_only_on_wraparound() {
        let mut session = session(&["http://a:1", "http://b:2"]);
        let wait = Duration::from_secs(20);

        let start = tokio::time::Instant::now();
        session.rotate(Some(wait)).await;
        assert!(start.elapsed() < wait);

        session.rotate(Some(wait)).await;
        assert!(start.elapsed() >= wait);
        assert_eq!(session.cursor(), 0);
    }

    #[tokio::test]
    async fn test_clones_share_cursor_and_skip_stale_rotation() {
        let session = session(&["http://a:1", "http://b:2", "http://c:3"]);
        let other = session.clone();
        let first = session.client();
        let second = other.client();

        assert!(!session.rotate_past(&first, None).await);
        assert!(!other.rotate_past(&second, None).await);

        assert_eq!(session.cursor(), 1);
        assert_eq!(other.proxy(), Some("http://b:2"));
        assert_eq!(other.client().proxy(), Some("http://b:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_wait_is_served_once() {
        let session = session(&["http://a:1"]);
        session.defer_cycle_wait(Some(Duration::from_secs(20)));
        session.defer_cycle_wait(Some(Duration::ZERO));

        let start = tokio::time::Instant::now();
        session.serve_deferred_wait().await;
        assert!(start.elapsed() >= Duration::from_secs(20));

        let again = tokio::time::Instant::now();
        session.clone().serve_deferred_wait().await;
        assert_eq!(again.elapsed(), Duration::ZERO);
    }

    // ==================== Option Precedence ====================

    #[test]
    fn test_session_defaults_layer_over_engine_defaults() {
        let config = SessionConfig {
            defaults: RequestOptions::default()
                .header("user-agent", "muxfetch-test")
                .connect_timeout(Duration::from_secs(3)),
            ..SessionConfig::default()
        };
        let session = Session::new(Engine::new().unwrap(), config);

        let defaults = session.defaults();
        assert_eq!(defaults.header_value("User-Agent"), Some("muxfetch-test"));
        assert!(defaults.header_value("Accept-Language").is_some());
        assert_eq!(defaults.connect_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_current_proxy_overrides_per_call_proxy() {
        let session = session(&["http://pool:8080"]);
        let options = session
            .client()
            .options(&RequestOptions::default().proxy("http://caller:1").header("X-Call", "1"));
        assert_eq!(options.proxy.as_deref(), Some("http://pool:8080"));
        assert_eq!(options.header_value("x-call"), Some("1"));
    }

    #[test]
    fn test_per_call_proxy_kept_without_session_proxies() {
        let session = session(&[]);
        let options = session
            .client()
            .options(&RequestOptions::default().proxy("http://caller:1"));
        assert_eq!(options.proxy.as_deref(), Some("http://caller:1"));
    }
}
