//! The engine value tying the multi handle, the reactor bridge and the
//! handle pool together.
//!
//! All three live in one explicitly constructed [`Engine`] instead of
//! process-wide tables. The engine is single-threaded: it is `!Send`, and
//! must be driven from inside a tokio [`LocalSet`](tokio::task::LocalSet)
//! because the bridge spawns local tasks for socket watches and timers.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use curl::easy::Easy2;
use tracing::{debug, instrument, warn};

use super::collector::Collector;
use super::error::HttpError;
use super::multi::{Completion, Detached, Notify, Orchestrator};
use super::pool::{HandlePool, PoolStats};
use super::reactor::{ReactorBridge, Readiness, Socket, SocketDriver};
use super::request::{Method, Request, RequestOptions};
use super::response::Response;

/// Multiplexed HTTP transfer engine.
///
/// Cheap to clone; clones share the same multi handle and pool.
#[derive(Clone)]
pub struct Engine {
    inner: Rc<EngineInner>,
}

struct EngineInner {
    orchestrator: RefCell<Orchestrator>,
    bridge: RefCell<ReactorBridge>,
    pool: RefCell<HandlePool<Easy2<Collector>>>,
    driver: Weak<dyn SocketDriver>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("in_flight", &self.in_flight())
            .field("pool", &self.pool_stats())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine with an empty handle pool.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Engine`] if libcurl refuses the reactor callbacks.
    pub fn new() -> Result<Self, HttpError> {
        let bridge = ReactorBridge::new();
        let orchestrator = Orchestrator::new(bridge.sender())?;
        let inner = Rc::new_cyclic(|weak: &Weak<EngineInner>| {
            let driver: Weak<dyn SocketDriver> = weak.clone();
            EngineInner {
                orchestrator: RefCell::new(orchestrator),
                bridge: RefCell::new(bridge),
                pool: RefCell::new(HandlePool::default()),
                driver,
            }
        });
        Ok(Self { inner })
    }

    /// Builds a request bound to a pooled handle. Nothing is sent until
    /// [`Request::perform`] is called.
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
        Request::new(self.clone(), method, url, options)
    }

    /// Performs one transfer and waits for it. No retries.
    ///
    /// # Errors
    ///
    /// Returns the [`HttpError`] the transfer failed with.
    #[instrument(skip(self, options))]
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        options: &RequestOptions,
    ) -> Result<Response, HttpError> {
        let mut request = self.request(method, url, options)?;
        let result = match request.perform() {
            Ok(transfer) => transfer.await,
            Err(error) => Err(error),
        };
        request.close();
        result
    }

    /// Number of transfers currently registered with the multi handle.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.orchestrator.borrow().len()
    }

    /// Handle pool counters.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.borrow().stats()
    }

    /// Number of descriptors the reactor is watching.
    #[must_use]
    pub fn watched_sockets(&self) -> usize {
        self.inner.bridge.borrow().watched()
    }

    pub(crate) fn acquire(&self) -> Easy2<Collector> {
        self.inner.pool.borrow_mut().acquire()
    }

    pub(crate) fn release(&self, mut easy: Easy2<Collector>) {
        easy.get_mut().clear();
        self.inner.pool.borrow_mut().release(easy);
    }

    /// Hands a configured handle to the multi handle.
    pub(crate) fn register(
        &self,
        easy: Easy2<Collector>,
        url: &str,
        notify: Notify,
    ) -> Result<usize, HttpError> {
        let added = self.inner.orchestrator.borrow_mut().add(easy, url, notify);
        self.inner.pump();
        added
    }

    /// Detaches a transfer that no longer has a consumer and pools its handle.
    ///
    /// Unknown tokens are ignored, so this is safe to call repeatedly and
    /// after the transfer has already completed.
    pub(crate) fn abandon(&self, token: usize) {
        let detached = self.inner.orchestrator.borrow_mut().detach(token);
        self.inner.pump();
        if let Some(Detached { url, easy, .. }) = detached {
            debug!(token, url = %url, "transfer abandoned");
            if let Some(easy) = easy {
                self.release(easy);
            }
        }
    }
}

impl EngineInner {
    /// Applies reactor events queued by libcurl callbacks.
    fn pump(&self) {
        let events = self.bridge.borrow().drain();
        if events.is_empty() {
            return;
        }
        let mut bridge = self.bridge.borrow_mut();
        for event in events {
            bridge.apply(event, &self.driver);
        }
    }

    fn settle(&self, outcome: Result<Vec<Completion>, HttpError>) {
        let completions = match outcome {
            Ok(completions) => completions,
            Err(error) => {
                warn!(%error, "multi handle action failed");
                return;
            }
        };
        for Completion { token, result } in completions {
            let detached = self.orchestrator.borrow_mut().detach(token);
            self.pump();
            let Some(Detached { url, easy, notify }) = detached else {
                continue;
            };
            let Some(mut easy) = easy else {
                let _ = notify.send(Err(HttpError::abandoned(&url)));
                continue;
            };

            let response = conclude(&url, &mut easy, result);
            easy.get_mut().clear();
            self.pool.borrow_mut().release(easy);

            if notify.is_closed() {
                debug!(token, url = %url, "consumer gone before completion");
                continue;
            }
            match &response {
                Ok(response) => {
                    debug!(token, url = %url, status = response.status, bytes = response.body.len(), "transfer complete");
                }
                Err(error) => debug!(token, url = %url, %error, "transfer failed"),
            }
            let _ = notify.send(response);
        }
    }
}

/// Turns libcurl's verdict into the transfer outcome.
fn conclude(
    url: &str,
    easy: &mut Easy2<Collector>,
    result: Result<(), curl::Error>,
) -> Result<Response, HttpError> {
    match result {
        Ok(()) => {
            let effective_url = easy
                .effective_url()
                .ok()
                .flatten()
                .map_or_else(|| url.to_string(), str::to_string);
            Ok(easy.get_mut().take_response(effective_url))
        }
        Err(_) if easy.get_ref().overflowed() => {
            Err(HttpError::too_large(url, easy.get_ref().limit()))
        }
        Err(error) => Err(HttpError::from_curl(url, &error)),
    }
}

impl SocketDriver for EngineInner {
    fn socket_ready(&self, socket: Socket, readiness: Readiness) {
        let outcome = self
            .orchestrator
            .borrow_mut()
            .socket_action(socket, readiness);
        self.pump();
        self.settle(outcome);
    }

    fn timer_fired(&self) {
        let outcome = self.orchestrator.borrow_mut().timeout_action();
        self.pump();
        self.settle(outcome);
    }
}
