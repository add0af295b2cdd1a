//! Single-threaded cooperative task dispatcher.
//!
//! Mirrors the reference implementation's "loop": one dedicated OS thread
//! runs a current-thread Tokio runtime, so every task submitted to this
//! dispatcher executes serially with respect to every other task on the
//! same dispatcher, with no locking required on the hot path. Foreign
//! threads (the `webrtc` crate's own tasks, a WebSocket reader task) only
//! ever call [`Dispatcher::submit`] or [`Dispatcher::spawn`]; they never
//! touch core state directly. This is the idiomatic analogue of
//! `umbra-core`'s `tokio::select!`-driven `run_event_loop`, generalized
//! from a single `mpsc` command enum to arbitrary boxed closures, since
//! Rust closures make the reference implementation's
//! `pomelo_webrtc_variant_t` argument union unnecessary.
//!
//! [`Dispatcher::schedule`]/[`schedule_once`](Dispatcher::schedule_once)
//! are callable from any thread, not just the loop thread: the ticker
//! itself is registered via the same command channel as everything else,
//! and `tokio::spawn`ing it from inside the loop's own `block_on` pins the
//! ticker task to this dispatcher's current-thread runtime regardless of
//! which thread asked for it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Task),
    StartTicker(Box<dyn FnOnce() + Send + 'static>),
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleHandle(u64);

/// Thread-safe handle to the loop. Cloning is cheap (it's a handful of
/// `Arc`s); every clone talks to the same underlying thread.
pub struct Dispatcher {
    sender: mpsc::UnboundedSender<Command>,
    running: Arc<AtomicBool>,
    schedules: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    next_schedule_id: AtomicU64,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns the dedicated loop thread and returns a handle to it.
    pub fn start() -> Arc<Dispatcher> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Command>();
        let running = Arc::new(AtomicBool::new(true));

        let thread_running = running.clone();
        let join = thread::Builder::new()
            .name("bridge-loop".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build loop runtime");

                runtime.block_on(async move {
                    while let Some(command) = receiver.recv().await {
                        match command {
                            Command::Run(task) => task(),
                            Command::StartTicker(setup) => setup(),
                            Command::Stop => break,
                        }
                    }
                    thread_running.store(false, Ordering::SeqCst);
                });
            })
            .expect("failed to spawn loop thread");

        Arc::new(Dispatcher {
            sender,
            running,
            schedules: Mutex::new(HashMap::new()),
            next_schedule_id: AtomicU64::new(0),
            thread: Mutex::new(Some(join)),
        })
    }

    /// Thread-safe. Pushes `task` onto the loop; returns `false` (a null
    /// handle, in spec terms) if the dispatcher has already begun shutdown.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        self.sender.send(Command::Run(Box::new(task))).is_ok()
    }

    /// Thread-safe. Repeats `callback` every `interval_ms`, on the loop
    /// thread, until [`Dispatcher::unschedule`] is called; a tick in flight
    /// when unschedule fires is allowed to complete (cancellation is
    /// checked before, not during, each invocation).
    pub fn schedule(&self, interval_ms: u64, mut callback: impl FnMut() + Send + 'static) -> ScheduleHandle {
        let id = self.next_schedule_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.schedules.lock().insert(id, cancelled.clone());

        let ticker_cancelled = cancelled.clone();
        let setup: Box<dyn FnOnce() + Send> = Box::new(move || {
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
                loop {
                    interval.tick().await;
                    if ticker_cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                    callback();
                }
            });
        });
        let _ = self.sender.send(Command::StartTicker(setup));

        ScheduleHandle(id)
    }

    /// Thread-safe. Fires `callback` exactly once after `delay_ms`, on the
    /// loop thread, unless cancelled first via [`Dispatcher::unschedule`].
    /// Used for the session's AUTH/negotiate deadlines, which the
    /// reference implementation schedules as one-shot tasks rather than
    /// intervals.
    pub fn schedule_once(&self, delay_ms: u64, callback: impl FnOnce() + Send + 'static) -> ScheduleHandle {
        let id = self.next_schedule_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.schedules.lock().insert(id, cancelled.clone());

        let ticker_cancelled = cancelled.clone();
        let setup: Box<dyn FnOnce() + Send> = Box::new(move || {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                if !ticker_cancelled.load(Ordering::SeqCst) {
                    callback();
                }
            });
        });
        let _ = self.sender.send(Command::StartTicker(setup));

        ScheduleHandle(id)
    }

    /// Idempotent after the first call.
    pub fn unschedule(&self, handle: ScheduleHandle) {
        if let Some(flag) = self.schedules.lock().remove(&handle.0) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Thread-safe. Runs `work` on the blocking thread pool, then invokes
    /// `callback` back on the loop — unless the loop has shut down by the
    /// time `work` completes, in which case the callback is silently
    /// dropped (it cannot observe core state after shutdown anyway).
    pub fn spawn<W, C>(&self, work: W, callback: C)
    where
        W: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let sender = self.sender.clone();
        let running = self.running.clone();
        tokio::task::spawn_blocking(move || {
            work();
            if running.load(Ordering::SeqCst) {
                let _ = sender.send(Command::Run(Box::new(callback)));
            }
        });
    }

    /// Thread-safe. Causes the loop to drain its current queue and exit,
    /// then joins the worker thread. Idempotent.
    pub fn shutdown(&self) {
        if self
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // already shutting down
        }
        let _ = self.sender.send(Command::Stop);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration as StdDuration;

    #[test]
    fn submit_runs_on_loop_thread() {
        let dispatcher = Dispatcher::start();
        let (tx, rx) = std_mpsc::channel();
        assert!(dispatcher.submit(move || {
            tx.send(42).unwrap();
        }));
        assert_eq!(rx.recv_timeout(StdDuration::from_secs(1)).unwrap(), 42);
        dispatcher.shutdown();
    }

    #[test]
    fn submit_after_shutdown_returns_false() {
        let dispatcher = Dispatcher::start();
        dispatcher.shutdown();
        assert!(!dispatcher.submit(|| {}));
    }

    #[test]
    fn spawn_runs_work_then_callback_on_loop() {
        let dispatcher = Dispatcher::start();
        let (tx, rx) = std_mpsc::channel();
        dispatcher.spawn(
            || {
                // pretend to do blocking work
            },
            move || {
                tx.send(()).unwrap();
            },
        );
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).is_ok());
        dispatcher.shutdown();
    }

    #[test]
    fn schedule_once_fires_after_delay() {
        let dispatcher = Dispatcher::start();
        let (tx, rx) = std_mpsc::channel();
        dispatcher.schedule_once(10, move || {
            tx.send(()).unwrap();
        });
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).is_ok());
        dispatcher.shutdown();
    }

    #[test]
    fn unschedule_before_fire_prevents_callback() {
        let dispatcher = Dispatcher::start();
        let (tx, rx) = std_mpsc::channel();
        let handle = dispatcher.schedule_once(200, move || {
            tx.send(()).unwrap();
        });
        dispatcher.unschedule(handle);
        assert!(rx.recv_timeout(StdDuration::from_millis(400)).is_err());
        dispatcher.shutdown();
    }

    #[test]
    fn schedule_repeats_until_unscheduled() {
        let dispatcher = Dispatcher::start();
        let (tx, rx) = std_mpsc::channel();
        let handle = dispatcher.schedule(10, move || {
            let _ = tx.send(());
        });
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).is_ok());
        assert!(rx.recv_timeout(StdDuration::from_secs(1)).is_ok());
        dispatcher.unschedule(handle);
        dispatcher.shutdown();
    }
}
