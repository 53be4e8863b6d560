//! Bridge between libcurl's readiness/timer callbacks and the tokio scheduler.
//!
//! libcurl tells us which descriptors to watch and when to call it back on a
//! timeout. Those callbacks run inside libcurl, so they only enqueue a
//! [`ReactorEvent`]. The engine drains the queue after every call into
//! libcurl and hands each event to [`ReactorBridge::apply`], which turns it
//! into local tasks: one per watched socket, plus at most one timer.
//!
//! Watches are owned by the bridge map, never by their tasks. Dropping a
//! watch deregisters the descriptor immediately, so a descriptor number
//! reused by libcurl for a new connection can be registered again within
//! the same drain.

use std::collections::HashMap;
use std::future::poll_fn;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Descriptor type libcurl hands to the socket callback.
pub(crate) type Socket = curl::multi::Socket;

/// Which directions a socket should be watched for, or was found ready for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

impl Readiness {
    pub(crate) fn any(self) -> bool {
        self.readable || self.writable
    }

    fn interest(self) -> Option<Interest> {
        match (self.readable, self.writable) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Request recorded by a libcurl callback, applied once libcurl has returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReactorEvent {
    /// Watch `socket` for the given directions, replacing any previous watch.
    Watch { socket: Socket, readiness: Readiness },
    /// Stop watching `socket`; libcurl is about to close it.
    Unwatch { socket: Socket },
    /// Call back after the delay, replacing the pending timer. `None` clears it.
    Timer(Option<Duration>),
}

/// Receiver of readiness and timeout notifications, i.e. the engine.
pub(crate) trait SocketDriver {
    /// Runs one socket action for a descriptor that became ready.
    fn socket_ready(&self, socket: Socket, readiness: Readiness);

    /// Runs one timeout action.
    fn timer_fired(&self);
}

/// Borrowed descriptor; libcurl owns and closes the socket.
#[derive(Debug)]
struct SocketFd(RawFd);

impl AsRawFd for SocketFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Watch {
    readiness: Readiness,
    // Sole strong reference: dropping the watch deregisters the descriptor.
    _fd: Rc<AsyncFd<SocketFd>>,
    task: JoinHandle<()>,
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Descriptor watches and the single deadline timer.
pub(crate) struct ReactorBridge {
    sender: mpsc::Sender<ReactorEvent>,
    events: mpsc::Receiver<ReactorEvent>,
    watches: HashMap<Socket, Watch>,
    timer: Option<JoinHandle<()>>,
}

impl ReactorBridge {
    pub(crate) fn new() -> Self {
        let (sender, events) = mpsc::channel();
        Self {
            sender,
            events,
            watches: HashMap::new(),
            timer: None,
        }
    }

    /// Queue handle for libcurl callbacks.
    pub(crate) fn sender(&self) -> mpsc::Sender<ReactorEvent> {
        self.sender.clone()
    }

    /// Takes every event queued since the last drain, oldest first.
    pub(crate) fn drain(&self) -> Vec<ReactorEvent> {
        self.events.try_iter().collect()
    }

    /// Number of descriptors currently watched.
    pub(crate) fn watched(&self) -> usize {
        self.watches.len()
    }

    /// True while a deadline timer is pending.
    #[cfg(test)]
    pub(crate) fn timer_armed(&self) -> bool {
        self.timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Applies one event. Must run inside a `LocalSet`.
    pub(crate) fn apply(&mut self, event: ReactorEvent, driver: &Weak<dyn SocketDriver>) {
        match event {
            ReactorEvent::Watch { socket, readiness } => {
                if let Err(error) = self.watch(socket, readiness, driver) {
                    warn!(socket, %error, "failed to register socket with the reactor");
                }
            }
            ReactorEvent::Unwatch { socket } => self.unwatch(socket),
            ReactorEvent::Timer(delay) => self.set_timer(delay, driver),
        }
    }

    fn watch(
        &mut self,
        socket: Socket,
        readiness: Readiness,
        driver: &Weak<dyn SocketDriver>,
    ) -> io::Result<()> {
        if self
            .watches
            .get(&socket)
            .is_some_and(|w| w.readiness == readiness)
        {
            return Ok(());
        }
        // Deregister before registering the same descriptor again.
        self.watches.remove(&socket);

        let Some(interest) = readiness.interest() else {
            return Ok(());
        };
        let fd = Rc::new(AsyncFd::try_with_interest(SocketFd(socket), interest)?);
        let task = tokio::task::spawn_local(watch_socket(
            socket,
            Rc::downgrade(&fd),
            readiness,
            driver.clone(),
        ));
        trace!(socket, ?readiness, "watching socket");
        self.watches.insert(
            socket,
            Watch {
                readiness,
                _fd: fd,
                task,
            },
        );
        Ok(())
    }

    fn unwatch(&mut self, socket: Socket) {
        if self.watches.remove(&socket).is_some() {
            trace!(socket, "unwatched socket");
        }
    }

    fn set_timer(&mut self, delay: Option<Duration>, driver: &Weak<dyn SocketDriver>) {
        if let Some(previous) = self.timer.take() {
            previous.abort();
        }
        let Some(delay) = delay else {
            return;
        };
        let driver = driver.clone();
        self.timer = Some(tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            if let Some(driver) = driver.upgrade() {
                driver.timer_fired();
            }
        }));
    }
}

impl Drop for ReactorBridge {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

async fn watch_socket(
    socket: Socket,
    fd: Weak<AsyncFd<SocketFd>>,
    interest: Readiness,
    driver: Weak<dyn SocketDriver>,
) {
    while let Some(ready) = poll_fn(|cx| poll_socket(&fd, interest, cx)).await {
        let Some(driver) = driver.upgrade() else {
            break;
        };
        driver.socket_ready(socket, ready);
    }
}

fn poll_socket(
    fd: &Weak<AsyncFd<SocketFd>>,
    interest: Readiness,
    cx: &mut Context<'_>,
) -> Poll<Option<Readiness>> {
    let Some(fd) = fd.upgrade() else {
        return Poll::Ready(None);
    };
    let mut ready = Readiness::default();
    if interest.readable {
        match fd.poll_read_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                ready.readable = true;
            }
            // Let libcurl find the error on its next read.
            Poll::Ready(Err(_)) => ready.readable = true,
            Poll::Pending => {}
        }
    }
    if interest.writable {
        match fd.poll_write_ready(cx) {
            Poll::Ready(Ok(mut guard)) => {
                guard.clear_ready();
                ready.writable = true;
            }
            Poll::Ready(Err(_)) => ready.writable = true,
            Poll::Pending => {}
        }
    }
    if ready.any() {
        Poll::Ready(Some(ready))
    } else {
        Poll::Pending
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    use tokio::task::LocalSet;

    use super::*;

    #[derive(Default)]
    struct RecordingDriver {
        ready: RefCell<Vec<(Socket, Readiness)>>,
        timeouts: RefCell<usize>,
    }

    impl SocketDriver for RecordingDriver {
        fn socket_ready(&self, socket: Socket, readiness: Readiness) {
            self.ready.borrow_mut().push((socket, readiness));
        }

        fn timer_fired(&self) {
            *self.timeouts.borrow_mut() += 1;
        }
    }

    fn driver_pair() -> (Rc<RecordingDriver>, Weak<dyn SocketDriver>) {
        let driver = Rc::new(RecordingDriver::default());
        let weak: Weak<dyn SocketDriver> = Rc::downgrade(&driver) as Weak<dyn SocketDriver>;
        (driver, weak)
    }

    const READ: Readiness = Readiness {
        readable: true,
        writable: false,
    };

    // ==================== Timer ====================

    #[tokio::test]
    async fn test_new_deadline_replaces_previous_timer() {
        LocalSet::new()
            .run_until(async {
                let (driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                bridge.apply(ReactorEvent::Timer(Some(Duration::from_millis(40))), &weak);
                bridge.apply(ReactorEvent::Timer(Some(Duration::from_millis(5))), &weak);
                assert!(bridge.timer_armed());

                tokio::time::sleep(Duration::from_millis(120)).await;
                assert_eq!(*driver.timeouts.borrow(), 1);
                assert!(!bridge.timer_armed());
            })
            .await;
    }

    #[tokio::test]
    async fn test_none_deadline_clears_timer() {
        LocalSet::new()
            .run_until(async {
                let (driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                bridge.apply(ReactorEvent::Timer(Some(Duration::from_millis(5))), &weak);
                bridge.apply(ReactorEvent::Timer(None), &weak);
                assert!(!bridge.timer_armed());

                tokio::time::sleep(Duration::from_millis(50)).await;
                assert_eq!(*driver.timeouts.borrow(), 0);
            })
            .await;
    }

    // ==================== Sockets ====================

    #[tokio::test]
    async fn test_readable_socket_notifies_driver() {
        LocalSet::new()
            .run_until(async {
                let (driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                let (watched, mut peer) = UnixStream::pair().unwrap();
                watched.set_nonblocking(true).unwrap();
                let fd = watched.as_raw_fd();

                bridge.apply(
                    ReactorEvent::Watch {
                        socket: fd,
                        readiness: READ,
                    },
                    &weak,
                );
                assert_eq!(bridge.watched(), 1);

                peer.write_all(b"x").unwrap();
                for _ in 0..50 {
                    if !driver.ready.borrow().is_empty() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                let ready = driver.ready.borrow();
                assert!(!ready.is_empty(), "driver should see readiness");
                assert_eq!(ready[0].0, fd);
                assert!(ready[0].1.readable);
            })
            .await;
    }

    #[tokio::test]
    async fn test_unregistrable_descriptor_is_not_watched() {
        LocalSet::new()
            .run_until(async {
                let (_driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                bridge.apply(
                    ReactorEvent::Watch {
                        socket: -1,
                        readiness: READ,
                    },
                    &weak,
                );
                assert_eq!(bridge.watched(), 0);
                assert!(bridge.watch(-1, READ, &weak).is_err());
            })
            .await;
    }

    #[tokio::test]
    async fn test_unwatch_removes_registration() {
        LocalSet::new()
            .run_until(async {
                let (driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                let (watched, mut peer) = UnixStream::pair().unwrap();
                watched.set_nonblocking(true).unwrap();
                let fd = watched.as_raw_fd();

                bridge.apply(
                    ReactorEvent::Watch {
                        socket: fd,
                        readiness: READ,
                    },
                    &weak,
                );
                bridge.apply(ReactorEvent::Unwatch { socket: fd }, &weak);
                assert_eq!(bridge.watched(), 0);

                peer.write_all(b"x").unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                assert!(driver.ready.borrow().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn test_rewatch_same_descriptor_with_new_interest() {
        LocalSet::new()
            .run_until(async {
                let (driver, weak) = driver_pair();
                let mut bridge = ReactorBridge::new();
                let (watched, _peer) = UnixStream::pair().unwrap();
                watched.set_nonblocking(true).unwrap();
                let fd = watched.as_raw_fd();

                bridge.apply(
                    ReactorEvent::Watch {
                        socket: fd,
                        readiness: READ,
                    },
                    &weak,
                );
                bridge.apply(
                    ReactorEvent::Watch {
                        socket: fd,
                        readiness: Readiness {
                            readable: false,
                            writable: true,
                        },
                    },
                    &weak,
                );
                assert_eq!(bridge.watched(), 1);

                // An idle unix socket is immediately writable.
                for _ in 0..50 {
                    if !driver.ready.borrow().is_empty() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                assert!(driver.ready.borrow().iter().any(|(_, r)| r.writable));
            })
            .await;
    }

    #[test]
    fn test_drain_returns_events_in_order() {
        let bridge = ReactorBridge::new();
        let sender = bridge.sender();
        sender.send(ReactorEvent::Timer(None)).unwrap();
        sender.send(ReactorEvent::Unwatch { socket: 7 }).unwrap();
        assert_eq!(
            bridge.drain(),
            vec![ReactorEvent::Timer(None), ReactorEvent::Unwatch { socket: 7 }]
        );
        assert!(bridge.drain().is_empty());
    }
}
