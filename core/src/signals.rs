//! Process-wide named signals with queued delivery.
//!
//! Raising a signal fans one datum out to every signal set whose mask
//! matches. Each set queues deliveries and dispatches to at most one awaiter
//! at a time. The datum's cleanup closure runs exactly once, after the last
//! interested set has consumed it, or immediately when no set matches.

use std::any::Any;
use std::collections::VecDeque;
use std::ops::BitOr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::ContextPtr;
use crate::errors::{Error, ErrorKind, Result};
use crate::objects::{ExposedObject, ObjectKind, ObjectRegistry};

/// Bitmask of signals.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Signals(u32);

impl Signals {
    pub const NONE: Signals = Signals(0);
    pub const INT: Signals = Signals(1 << 0);
    pub const TERM: Signals = Signals(1 << 1);
    pub const USR1: Signals = Signals(1 << 2);
    pub const USR2: Signals = Signals(1 << 3);
    pub const USR3: Signals = Signals(1 << 4);
    pub const USR4: Signals = Signals(1 << 5);
    pub const USR5: Signals = Signals(1 << 6);
    pub const USR6: Signals = Signals(1 << 7);
    pub const USR7: Signals = Signals(1 << 8);
    pub const USR8: Signals = Signals(1 << 9);
    pub const ALL: Signals = Signals((1 << 10) - 1);

    pub fn contains(self, other: Signals) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Signals) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for Signals {
    type Output = Signals;

    fn bitor(self, rhs: Signals) -> Signals {
        Signals(self.0 | rhs.0)
    }
}

/// Opaque argument attached to a raised signal.
pub type Sigarg = Arc<dyn Any + Send + Sync>;

pub type CleanupFn = Box<dyn FnOnce() + Send + 'static>;

/// `(result, signal, sigarg)` of one delivered signal.
pub type AwaitHandler = Box<dyn FnOnce(Result<()>, Signals, Option<Sigarg>) + Send + 'static>;

struct SignalData {
    signal: Signals,
    sigarg: Option<Sigarg>,
    outstanding: AtomicUsize,
    cleanup: Mutex<Option<CleanupFn>>,
}

impl SignalData {
    /// Marks one delivery as consumed; runs the cleanup after the last one.
    fn consume(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(cleanup) = self.cleanup.lock().expect("Mutex poisoned").take() {
                cleanup();
            }
        }
    }
}

struct SetState {
    queue: VecDeque<Arc<SignalData>>,
    await_handler: Option<AwaitHandler>,
}

/// A set of signals a user can await.
pub struct SignalSet {
    context: ContextPtr,
    signals: Signals,
    state: Mutex<SetState>,
}

pub type SignalSetPtr = Arc<SignalSet>;

impl SignalSet {
    pub fn create(context: ContextPtr, signals: Signals) -> SignalSetPtr {
        Arc::new(SignalSet {
            context,
            signals,
            state: Mutex::new(SetState {
                queue: VecDeque::new(),
                await_handler: None,
            }),
        })
    }

    pub fn signals(&self) -> Signals {
        self.signals
    }

    /// Awaits the next matching signal.
    ///
    /// Re-issuing supersedes the previous await, whose handler fires
    /// `Canceled`; the return value tells whether that happened.
    pub fn await_async(&self, handler: AwaitHandler) -> bool {
        self.replace_handler(Some(handler))
    }

    /// Cancels an outstanding await; its handler fires `Canceled`.
    pub fn cancel_await(&self) -> bool {
        self.replace_handler(None)
    }

    fn replace_handler(&self, handler: Option<AwaitHandler>) -> bool {
        let mut state = self.state.lock().expect("Mutex poisoned");

        let canceled = match state.await_handler.take() {
            Some(old) => {
                self.context
                    .post(move || old(Err(Error::new(ErrorKind::Canceled)), Signals::NONE, None));
                true
            }
            None => false,
        };

        state.await_handler = handler;

        if !state.queue.is_empty() {
            self.deliver_next_signal(&mut state);
        }

        canceled
    }

    fn on_signal_raised(&self, data: Arc<SignalData>) {
        debug_assert!(self.signals.intersects(data.signal));

        let mut state = self.state.lock().expect("Mutex poisoned");
        state.queue.push_back(data);
        self.deliver_next_signal(&mut state);
    }

    fn deliver_next_signal(&self, state: &mut SetState) {
        debug_assert!(!state.queue.is_empty());

        let Some(handler) = state.await_handler.take() else {
            return;
        };

        let data = state.queue.pop_front().expect("queue checked above");
        self.context.post(move || {
            handler(Ok(()), data.signal, data.sigarg.clone());
            data.consume();
        });
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        let mut state = self.state.lock().expect("Mutex poisoned");

        for data in state.queue.drain(..) {
            self.context.post(move || data.consume());
        }

        if let Some(handler) = state.await_handler.take() {
            self.context
                .post(move || handler(Err(Error::new(ErrorKind::Canceled)), Signals::NONE, None));
        }
    }
}

impl ExposedObject for SignalSet {
    fn kind(&self) -> ObjectKind {
        ObjectKind::SignalSet
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Delivers `signal` to every registered signal set whose mask matches.
///
/// `cleanup` runs after the last matching set has consumed the datum, or
/// right away when no set matches.
pub fn raise_signal(signal: Signals, sigarg: Option<Sigarg>, cleanup: Option<CleanupFn>) {
    debug_assert!(signal != Signals::NONE);

    let sets = ObjectRegistry::get_matching::<SignalSet, _>(|set| set.signals.intersects(signal));

    if sets.is_empty() {
        if let Some(cleanup) = cleanup {
            cleanup();
        }
        return;
    }

    let data = Arc::new(SignalData {
        signal,
        sigarg,
        outstanding: AtomicUsize::new(sets.len()),
        cleanup: Mutex::new(cleanup),
    });

    for set in sets {
        set.on_signal_raised(Arc::clone(&data));
    }
}
