//! Single-shot timer.

use std::any::Any;
use std::sync::{Arc, Mutex, Weak};

use yogi_primitives::Duration;

use crate::context::{Context, ContextPtr};
use crate::errors::{Error, ErrorKind, Result};
use crate::objects::{ExposedObject, ObjectKind};

pub type TimerHandler = Box<dyn FnOnce(Result<()>) + Send + 'static>;

struct TimerState {
    generation: u64,
    armed: Option<TimerHandler>,
}

/// A single-shot timer bound to a context.
pub struct Timer {
    context: ContextPtr,
    state: Arc<Mutex<TimerState>>,
}

pub type TimerPtr = Arc<Timer>;

impl Timer {
    pub fn create(context: ContextPtr) -> TimerPtr {
        Arc::new(Timer {
            context,
            state: Arc::new(Mutex::new(TimerState {
                generation: 0,
                armed: None,
            })),
        })
    }

    pub fn context(&self) -> &ContextPtr {
        &self.context
    }

    /// Arms the timer; `handler` fires with `Ok` after `duration`.
    ///
    /// Re-arming replaces any in-flight arming, whose handler fires
    /// `Canceled` first. An infinite duration never fires.
    pub fn start_async(&self, duration: Duration, handler: TimerHandler) {
        let generation;

        {
            let mut state = self.state.lock().expect("Mutex poisoned");
            state.generation += 1;
            generation = state.generation;

            if let Some(previous) = state.armed.take() {
                self.context
                    .post(move || previous(Err(Error::new(ErrorKind::Canceled))));
            }

            state.armed = Some(handler);
        }

        let state = Arc::clone(&self.state);
        let weak_context: Weak<Context> = Arc::downgrade(&self.context);

        self.context.spawn(async move {
            match duration.to_std() {
                Some(dur) => tokio::time::sleep(dur).await,
                None => std::future::pending::<()>().await,
            }

            let handler = {
                let mut state = state.lock().expect("Mutex poisoned");
                if state.generation != generation {
                    return;
                }
                state.armed.take()
            };

            if let (Some(handler), Some(context)) = (handler, weak_context.upgrade()) {
                context.post(move || handler(Ok(())));
            }
        });
    }

    /// Cancels an armed timer; its handler fires `Canceled`.
    ///
    /// Fails with `TimerExpired` if the timer is not running.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.state.lock().expect("Mutex poisoned");
        state.generation += 1;

        match state.armed.take() {
            Some(handler) => {
                self.context
                    .post(move || handler(Err(Error::new(ErrorKind::Canceled))));
                Ok(())
            }
            None => Err(Error::new(ErrorKind::TimerExpired)),
        }
    }
}

impl ExposedObject for Timer {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Timer
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
