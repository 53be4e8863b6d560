//! Transfer orchestrator wrapping the libcurl multi handle.
//!
//! Owns the table of in-flight transfers keyed by the token stored on each
//! easy handle. Every socket or timeout action reports how many transfers
//! are still running; when that is fewer than the table holds, the finished
//! ones are drained from libcurl's message queue and handed back to the
//! engine, which settles them only after libcurl has returned.

use std::collections::HashMap;
use std::sync::mpsc;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Events, Multi};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::collector::Collector;
use super::error::HttpError;
use super::reactor::{Readiness, ReactorEvent, Socket};
use super::response::Response;

/// Channel through which a transfer's outcome reaches its awaiting request.
pub(crate) type Notify = oneshot::Sender<Result<Response, HttpError>>;

struct InFlight {
    url: String,
    handle: Easy2Handle<Collector>,
    notify: Notify,
}

/// A transfer libcurl reported as finished.
#[derive(Debug)]
pub(crate) struct Completion {
    pub(crate) token: usize,
    pub(crate) result: Result<(), curl::Error>,
}

/// A transfer taken out of the multi handle.
pub(crate) struct Detached {
    pub(crate) url: String,
    /// `None` if libcurl refused to give the handle back.
    pub(crate) easy: Option<Easy2<Collector>>,
    pub(crate) notify: Notify,
}

pub(crate) struct Orchestrator {
    multi: Multi,
    transfers: HashMap<usize, InFlight>,
    next_token: usize,
}

impl Orchestrator {
    /// Creates the multi handle, routing its callbacks into `events`.
    pub(crate) fn new(events: mpsc::Sender<ReactorEvent>) -> Result<Self, HttpError> {
        let mut multi = Multi::new();

        let sockets = events.clone();
        multi.socket_function(move |socket, what, _token| {
            let event = if what.remove() {
                ReactorEvent::Unwatch { socket }
            } else {
                ReactorEvent::Watch {
                    socket,
                    readiness: Readiness {
                        readable: what.input(),
                        writable: what.output(),
                    },
                }
            };
            let _ = sockets.send(event);
        })?;

        multi.timer_function(move |delay| events.send(ReactorEvent::Timer(delay)).is_ok())?;

        Ok(Self {
            multi,
            transfers: HashMap::new(),
            next_token: 0,
        })
    }

    /// Number of transfers in the table.
    pub(crate) fn len(&self) -> usize {
        self.transfers.len()
    }

    /// Registers a configured handle, returning its token.
    pub(crate) fn add(
        &mut self,
        easy: Easy2<Collector>,
        url: &str,
        notify: Notify,
    ) -> Result<usize, HttpError> {
        let mut handle = self.multi.add2(easy)?;
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        if let Err(error) = handle.set_token(token) {
            let _ = self.multi.remove2(handle);
            return Err(HttpError::setup(url, error));
        }
        self.transfers.insert(
            token,
            InFlight {
                url: url.to_string(),
                handle,
                notify,
            },
        );
        debug!(token, url, in_flight = self.transfers.len(), "transfer registered");
        Ok(token)
    }

    /// Runs one socket action for a ready descriptor.
    pub(crate) fn socket_action(
        &mut self,
        socket: Socket,
        readiness: Readiness,
    ) -> Result<Vec<Completion>, HttpError> {
        let mut events = Events::new();
        events.input(readiness.readable).output(readiness.writable);
        let running = self.multi.action(socket, &events)?;
        Ok(self.completions(running))
    }

    /// Runs one timeout action.
    pub(crate) fn timeout_action(&mut self) -> Result<Vec<Completion>, HttpError> {
        let running = self.multi.timeout()?;
        Ok(self.completions(running))
    }

    fn completions(&self, running: u32) -> Vec<Completion> {
        let mut done = Vec::new();
        if (running as usize) >= self.transfers.len() {
            return done;
        }
        // `messages` keeps reading until libcurl's queue is empty.
        self.multi.messages(|message| {
            let Ok(token) = message.token() else {
                return;
            };
            if let Some(result) = message.result() {
                done.push(Completion { token, result });
            }
        });
        done
    }

    /// Removes a transfer from the table and the multi handle.
    ///
    /// Returns `None` if the token is not registered, which makes repeated
    /// teardown harmless.
    pub(crate) fn detach(&mut self, token: usize) -> Option<Detached> {
        let InFlight {
            url,
            handle,
            notify,
        } = self.transfers.remove(&token)?;
        let easy = match self.multi.remove2(handle) {
            Ok(easy) => Some(easy),
            Err(error) => {
                warn!(token, url = %url, %error, "failed to detach handle from multi");
                None
            }
        };
        Some(Detached { url, easy, notify })
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        // Handles must leave the multi handle before its callbacks go away.
        for (_, in_flight) in self.transfers.drain() {
            let _ = self.multi.remove2(in_flight.handle);
        }
    }
}
