//! Single-threaded cooperative event loop.
//!
//! Everything that touches RTSP connections, sessions and frame hand-off runs
//! on the thread that calls [`EventLoop::run_until`]. Other threads interact
//! with it in exactly two ways:
//!
//! - firing a [`WakeupToken`] ("something may be ready, go look"), and
//! - requesting shutdown through a [`StopHandle`].
//!
//! Each iteration polls the registered [`IoSource`]s without blocking,
//! dispatches the handlers of every fired token, then sleeps until a token
//! fires, a stop is requested, or the poll interval elapses.
//!
//! ```text
//! producer thread                     event-loop thread
//! ───────────────                     ─────────────────
//! queue.lock(); push; unlock
//! token.fire() ──── notify ────────▶  fired.swap(false) → handler()
//!                                      queue.lock(); pop; unlock
//! ```
//!
//! Fires collapse: a token that is fired several times before the loop gets
//! to it runs its handler once. The flag is cleared *before* the handler
//! runs, so a fire that races with the handler schedules another dispatch.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Something the event loop polls for ready I/O once per iteration.
///
/// Implementations must never block: use non-blocking sockets and return as
/// soon as nothing more is ready.
pub trait IoSource {
    fn poll_io(&mut self);
}

/// Wakes the loop thread out of its idle wait.
#[derive(Debug, Default)]
struct Notifier {
    pending: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    fn notify(&self) {
        let mut pending = self.pending.lock();
        *pending = true;
        self.cond.notify_one();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cond.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// Cross-thread "check for work" signal registered with an [`EventLoop`].
///
/// Cheap to clone and safe to fire from any thread, in any loop state.
/// A token carries no payload.
#[derive(Debug, Clone)]
pub struct WakeupToken {
    id: u64,
    fired: Arc<AtomicBool>,
    notifier: Arc<Notifier>,
}

impl WakeupToken {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Schedule this token's handler on the loop thread.
    ///
    /// Fires on a released token are silently ignored by the loop.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notifier.notify();
        }
    }
}

/// Process-wide run flag. The only transition is running → stop-requested.
#[derive(Debug, Default)]
pub struct RunState {
    stop_requested: AtomicBool,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call performed the transition.
    pub fn request_stop(&self) -> bool {
        !self.stop_requested.swap(true, Ordering::SeqCst)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

/// Thread-safe handle that stops a running [`EventLoop::run_until`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    state: Arc<RunState>,
    notifier: Arc<Notifier>,
}

impl StopHandle {
    /// Request stop and wake the loop so it notices on its next iteration.
    pub fn stop(&self) {
        if self.state.request_stop() {
            tracing::debug!("stop requested");
        }
        self.notifier.notify();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.state.is_stop_requested()
    }
}

type Handler = Rc<RefCell<dyn FnMut()>>;

struct Registration {
    fired: Arc<AtomicBool>,
    handler: Handler,
}

struct Inner {
    notifier: Arc<Notifier>,
    handlers: RefCell<HashMap<u64, Registration>>,
    io_sources: RefCell<Vec<Weak<RefCell<dyn IoSource>>>>,
    next_id: Cell<u64>,
    poll_interval: Duration,
}

/// Handle to the cooperative scheduler. Clones share the same loop.
///
/// Not `Send`: the loop and everything registered with it live on one thread.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<Inner>,
}

impl EventLoop {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            inner: Rc::new(Inner {
                notifier: Arc::new(Notifier::default()),
                handlers: RefCell::new(HashMap::new()),
                io_sources: RefCell::new(Vec::new()),
                next_id: Cell::new(1),
                poll_interval,
            }),
        }
    }

    /// Register a handler and return the token that triggers it.
    pub fn create_wakeup_token<F>(&self, handler: F) -> WakeupToken
    where
        F: FnMut() + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let fired = Arc::new(AtomicBool::new(false));
        let handler = Rc::new(RefCell::new(handler));
        let handler: Handler = handler;
        self.inner.handlers.borrow_mut().insert(
            id,
            Registration {
                fired: fired.clone(),
                handler,
            },
        );
        tracing::trace!(token = id, "wakeup token created");

        WakeupToken {
            id,
            fired,
            notifier: self.inner.notifier.clone(),
        }
    }

    /// Unregister a token's handler. Later fires become no-ops.
    pub fn release_wakeup_token(&self, token: &WakeupToken) {
        if self.inner.handlers.borrow_mut().remove(&token.id).is_some() {
            tracing::trace!(token = token.id, "wakeup token released");
        }
    }

    /// Number of live wakeup tokens.
    pub fn token_count(&self) -> usize {
        self.inner.handlers.borrow().len()
    }

    /// Register a source polled once per iteration. The loop holds only a
    /// weak reference; dropping the source unregisters it.
    pub fn add_io_source<S>(&self, source: &Rc<RefCell<S>>)
    where
        S: IoSource + 'static,
    {
        let weak = Rc::downgrade(source);
        let weak: Weak<RefCell<dyn IoSource>> = weak;
        self.inner.io_sources.borrow_mut().push(weak);
    }

    /// Create a handle that stops [`run_until`](Self::run_until) for `state`.
    pub fn stop_handle(&self, state: &Arc<RunState>) -> StopHandle {
        StopHandle {
            state: state.clone(),
            notifier: self.inner.notifier.clone(),
        }
    }

    /// Run one iteration without waiting. Returns the number of handlers
    /// dispatched.
    pub fn run_once(&self) -> usize {
        self.poll_io();
        self.dispatch_fired()
    }

    /// Run until `state` transitions to stop-requested.
    ///
    /// The flag is checked once per iteration, so a stop requested from
    /// another thread ends the loop within one iteration.
    pub fn run_until(&self, state: &RunState) {
        tracing::debug!("event loop started");
        let mut iterations: u64 = 0;

        while !state.is_stop_requested() {
            self.run_once();
            if state.is_stop_requested() {
                break;
            }
            self.inner.notifier.wait(self.inner.poll_interval);
            iterations += 1;
        }

        tracing::debug!(iterations, "event loop exited");
    }

    /// Drop every handler and I/O source still registered.
    pub fn reclaim(&self) {
        let handlers = std::mem::take(&mut *self.inner.handlers.borrow_mut());
        let sources = std::mem::take(&mut *self.inner.io_sources.borrow_mut());
        tracing::debug!(
            handlers = handlers.len(),
            io_sources = sources.len(),
            "event loop environment reclaimed"
        );
    }

    fn poll_io(&self) {
        let sources: Vec<Rc<RefCell<dyn IoSource>>> = {
            let mut registered = self.inner.io_sources.borrow_mut();
            registered.retain(|weak| weak.strong_count() > 0);
            registered.iter().filter_map(Weak::upgrade).collect()
        };

        for source in sources {
            // Already borrowed means we were re-entered from inside that source.
            if let Ok(mut source) = source.try_borrow_mut() {
                source.poll_io();
            }
        }
    }

    fn dispatch_fired(&self) -> usize {
        let ready: Vec<(u64, Handler)> = self
            .inner
            .handlers
            .borrow()
            .iter()
            .filter(|(_, reg)| reg.fired.swap(false, Ordering::AcqRel))
            .map(|(id, reg)| (*id, reg.handler.clone()))
            .collect();

        let mut dispatched = 0;
        for (id, handler) in ready {
            // An earlier handler in this batch may have released this token.
            if !self.inner.handlers.borrow().contains_key(&id) {
                continue;
            }
            if let Ok(mut handler) = handler.try_borrow_mut() {
                (&mut *handler)();
                dispatched += 1;
            }
        }
        dispatched
    }
}
