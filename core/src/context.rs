//! The execution substrate.
//!
//! A [`Context`] is a single-threaded cooperative reactor: one current-thread
//! tokio runtime plus a queue of posted handlers. Socket and timer futures of
//! objects attached to the context run on that runtime, and every
//! user-visible completion handler is dispatched through [`Context::post`],
//! so handlers only ever execute inside one of the `run*`/`poll*` calls (or
//! the background thread), never on the thread that initiated an
//! asynchronous operation.

use std::any::Any;
use std::future::Future;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tokio::sync::mpsc;
use tokio::sync::Notify;
use yogi_primitives::Duration;

use crate::errors::{Error, ErrorKind, Result};
use crate::objects::{ExposedObject, ObjectKind};

type Task = Box<dyn FnOnce() + Send + 'static>;

// How many cooperative yields poll() grants the runtime so that completed
// I/O can enqueue its handlers before the queue is drained.
const POLL_YIELD_BUDGET: usize = 16;

enum RunMode {
    Poll { one: bool },
    Run { duration: Duration, one: bool },
}

struct Inner {
    rt: tokio::runtime::Runtime,
    task_tx: mpsc::UnboundedSender<Task>,
    task_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>,
    running: Mutex<bool>,
    running_cv: Condvar,
    stop: Notify,
    stopped: AtomicBool,
}

/// A single-threaded cooperative task runner.
pub struct Context {
    inner: Arc<Inner>,
}

pub type ContextPtr = Arc<Context>;

impl Context {
    pub fn create() -> Result<ContextPtr> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::with_details(ErrorKind::Unknown, e.to_string()))?;

        let (task_tx, task_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Context {
            inner: Arc::new(Inner {
                rt,
                task_tx,
                task_rx: tokio::sync::Mutex::new(task_rx),
                running: Mutex::new(false),
                running_cv: Condvar::new(),
                stop: Notify::new(),
                stopped: AtomicBool::new(false),
            }),
        }))
    }

    /// Runs ready handlers without blocking; returns how many were executed.
    pub fn poll(&self) -> Result<usize> {
        self.run_impl(RunMode::Poll { one: false })
    }

    /// Runs at most one ready handler without blocking.
    pub fn poll_one(&self) -> Result<usize> {
        self.run_impl(RunMode::Poll { one: true })
    }

    /// Runs handlers for at most `duration` (infinity allowed).
    pub fn run(&self, duration: Duration) -> Result<usize> {
        self.run_impl(RunMode::Run { duration, one: false })
    }

    /// Runs at most one handler, waiting for at most `duration`.
    pub fn run_one(&self, duration: Duration) -> Result<usize> {
        self.run_impl(RunMode::Run { duration, one: true })
    }

    /// Spawns a worker thread that runs the context until it is stopped.
    pub fn run_in_background(&self) -> Result<()> {
        self.set_running_flag_and_reset()?;

        let inner = Arc::clone(&self.inner);
        std::thread::Builder::new()
            .name("yogi-context".to_owned())
            .spawn(move || {
                run_events(
                    &inner,
                    RunMode::Run {
                        duration: Duration::inf(),
                        one: false,
                    },
                );
                clear_running_flag(&inner);
            })
            .map_err(|e| Error::with_details(ErrorKind::Unknown, e.to_string()))?;

        Ok(())
    }

    /// Stops the context; the active `run*` call returns as soon as the
    /// currently executing handler is done.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.stop.notify_waiters();
    }

    /// Blocks until the context is running; `false` on timeout.
    pub fn wait_for_running(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, true)
    }

    /// Blocks until the context is stopped; `false` on timeout.
    pub fn wait_for_stopped(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, false)
    }

    /// Schedules `task` for execution at the next dispatch point.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        // The receiver lives as long as the context, so this cannot fail.
        let _ = self.inner.task_tx.send(Box::new(task));
    }

    /// Spawns a future onto the context's runtime.
    ///
    /// The future only makes progress while the context is being run.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.rt.spawn(future)
    }

    /// Enters the runtime so that sockets can be registered with its I/O
    /// driver from outside of a task.
    pub fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
        self.inner.rt.enter()
    }

    fn run_impl(&self, mode: RunMode) -> Result<usize> {
        self.set_running_flag_and_reset()?;
        let count = run_events(&self.inner, mode);
        clear_running_flag(&self.inner);
        Ok(count)
    }

    fn set_running_flag_and_reset(&self) -> Result<()> {
        let mut running = self.inner.running.lock().expect("Mutex poisoned");
        if *running {
            return Err(Error::new(ErrorKind::Busy));
        }

        *running = true;
        self.inner.stopped.store(false, Ordering::Release);
        self.inner.running_cv.notify_all();
        Ok(())
    }

    fn wait_for_state(&self, timeout: Duration, wanted: bool) -> bool {
        let guard = self.inner.running.lock().expect("Mutex poisoned");

        match timeout.to_std() {
            None => {
                let _guard = self
                    .inner
                    .running_cv
                    .wait_while(guard, |running| *running != wanted)
                    .expect("Mutex poisoned");
                true
            }
            Some(dur) => {
                let (_guard, result) = self
                    .inner
                    .running_cv
                    .wait_timeout_while(guard, dur, |running| *running != wanted)
                    .expect("Mutex poisoned");
                !result.timed_out()
            }
        }
    }
}

fn clear_running_flag(inner: &Inner) {
    let mut running = inner.running.lock().expect("Mutex poisoned");
    *running = false;
    inner.running_cv.notify_all();
}

fn run_events(inner: &Inner, mode: RunMode) -> usize {
    inner.rt.block_on(async {
        let mut rx = inner.task_rx.lock().await;
        let mut count = 0usize;

        match mode {
            RunMode::Poll { one } => loop {
                for _ in 0..POLL_YIELD_BUDGET {
                    tokio::task::yield_now().await;
                }

                match rx.try_recv() {
                    Ok(task) => {
                        task();
                        count += 1;
                        if one {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            },
            RunMode::Run { duration, one } => {
                let deadline = duration
                    .to_std()
                    .map(|dur| tokio::time::Instant::now() + dur);

                loop {
                    let mut stop_fut = pin!(inner.stop.notified());
                    stop_fut.as_mut().enable();

                    if inner.stopped.load(Ordering::Acquire) {
                        break;
                    }

                    let expired = tokio::select! {
                        biased;
                        _ = &mut stop_fut => break,
                        task = rx.recv() => {
                            match task {
                                Some(task) => {
                                    task();
                                    count += 1;
                                    false
                                }
                                None => break,
                            }
                        }
                        _ = sleep_until_deadline(deadline) => true,
                    };

                    if expired || (one && count > 0) {
                        break;
                    }

                    if let Some(deadline) = deadline {
                        if tokio::time::Instant::now() >= deadline {
                            break;
                        }
                    }
                }
            }
        }

        count
    })
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
        self.wait_for_stopped(Duration::inf());
    }
}

impl ExposedObject for Context {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Context
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn poll_runs_posted_handlers() {
        let context = Context::create().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            context.post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(context.poll().unwrap(), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(context.poll().unwrap(), 0);
    }

    #[test]
    fn poll_one_runs_a_single_handler() {
        let context = Context::create().unwrap();
        context.post(|| {});
        context.post(|| {});

        assert_eq!(context.poll_one().unwrap(), 1);
        assert_eq!(context.poll().unwrap(), 1);
    }

    #[test]
    fn handlers_posted_by_handlers_run_in_the_same_poll() {
        let context = Context::create().unwrap();

        let ctx = Arc::clone(&context);
        context.post(move || {
            ctx.post(|| {});
        });

        assert_eq!(context.poll().unwrap(), 2);
    }

    #[test]
    fn run_returns_after_the_deadline() {
        let context = Context::create().unwrap();
        let start = std::time::Instant::now();
        assert_eq!(context.run(Duration::from_millis(50)).unwrap(), 0);
        assert!(start.elapsed() >= std::time::Duration::from_millis(45));
    }

    #[test]
    fn run_one_returns_after_one_handler() {
        let context = Context::create().unwrap();
        context.post(|| {});
        context.post(|| {});

        assert_eq!(context.run_one(Duration::inf()).unwrap(), 1);
        assert_eq!(context.run_one(Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(context.run_one(Duration::from_millis(10)).unwrap(), 0);
    }

    #[test]
    fn reentry_reports_busy() {
        let context = Context::create().unwrap();

        let ctx = Arc::clone(&context);
        context.post(move || {
            assert_eq!(ctx.poll().unwrap_err().kind(), ErrorKind::Busy);
        });

        assert_eq!(context.poll().unwrap(), 1);
    }

    #[test]
    fn stop_wakes_an_infinite_run() {
        let context = Context::create().unwrap();

        let ctx = Arc::clone(&context);
        let thread = std::thread::spawn(move || ctx.run(Duration::inf()).unwrap());

        assert!(context.wait_for_running(Duration::from_secs(5)));
        context.stop();
        assert!(context.wait_for_stopped(Duration::from_secs(5)));
        thread.join().unwrap();
    }

    #[test]
    fn background_run_and_busy() {
        let context = Context::create().unwrap();
        context.run_in_background().unwrap();
        assert!(context.wait_for_running(Duration::from_secs(5)));

        assert_eq!(context.poll().unwrap_err().kind(), ErrorKind::Busy);
        assert_eq!(
            context.run_in_background().unwrap_err().kind(),
            ErrorKind::Busy
        );

        let counter = Arc::new(AtomicUsize::new(0));
        let handler_counter = Arc::clone(&counter);
        context.post(move || {
            handler_counter.fetch_add(1, Ordering::SeqCst);
        });

        while counter.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        context.stop();
        assert!(context.wait_for_stopped(Duration::from_secs(5)));
        context.poll().unwrap();
    }

    #[test]
    fn spawned_futures_progress_during_run() {
        let context = Context::create().unwrap();
        let done = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&done);
        let ctx = Arc::clone(&context);
        context.spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            ctx.post(move || flag.store(true, Ordering::SeqCst));
        });

        context.run(Duration::from_millis(500)).unwrap();
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_for_running_times_out_when_idle() {
        let context = Context::create().unwrap();
        assert!(!context.wait_for_running(Duration::from_millis(10)));
        assert!(context.wait_for_stopped(Duration::from_millis(10)));
    }
}
