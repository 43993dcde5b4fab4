//! Monotonic millisecond clock and cooperative worker-thread primitives.
//!
//! The library is built around preemptive OS threads coordinated with
//! mutexes and condition variables rather than an async runtime.
//! `StopToken` stands in for a cooperative cancellation flag: every blocking wait checks it
//! before and after sleeping, and suspension points that would otherwise
//! block forever return `Error::StopRequested` once it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, ThreadError};

/// Returns a monotonic millisecond timestamp. Not wall-clock time; only
/// differences between two calls are meaningful.
pub fn now_ms() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// A cooperative stop signal shared between a worker thread and whoever
/// manages its lifecycle. Cloning shares the same underlying flag/condvar.
#[derive(Clone)]
pub struct StopToken {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Default for StopToken {
    fn default() -> Self {
        Self::new()
    }
}

impl StopToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                mutex: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Signals every waiter on this token to wake immediately.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock().unwrap();
        self.inner.cond.notify_all();
    }

    /// Sleeps up to `timeout`, waking early if `stop()` is called.
    /// Returns `Err(Error::StopRequested)` if the token fired during the
    /// wait (checked both before and after, matching the "check stop, then
    /// wait <= 20ms, repeat" convention.
    pub fn sleep(&self, timeout: Duration) -> Result<(), Error> {
        if self.is_stopped() {
            return Err(Error::StopRequested);
        }
        let guard = self.inner.mutex.lock().unwrap();
        let (_guard, _result) = self.inner.cond.wait_timeout(guard, timeout).unwrap();
        if self.is_stopped() {
            return Err(Error::StopRequested);
        }
        Ok(())
    }

    /// Sleeps in bounded ~20ms slices until `total` has elapsed or a stop
    /// is requested, whichever comes first.
    pub fn sleep_cooperative(&self, total: Duration) -> Result<(), Error> {
        const SLICE: Duration = Duration::from_millis(20);
        let deadline = Instant::now() + total;
        loop {
            if self.is_stopped() {
                return Err(Error::StopRequested);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            self.sleep(remaining.min(SLICE))?;
        }
    }
}

/// A generic worker thread with a cooperative stop handle. `run` is invoked
/// on the spawned thread and receives a `StopToken` it should check at every
/// suspension point; returning `Err(Error::StopRequested)` from `run` is the
/// normal, clean shutdown path (mirrors the source's exception-based unwind,
/// made explicit).
pub struct WorkerThread {
    stop: StopToken,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawns `run` on a new OS thread. `name` is used only for diagnostics.
    pub fn start<F>(name: &'static str, run: F) -> Result<Self, Error>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let stop = StopToken::new();
        let stop_for_thread = stop.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(stop_for_thread))
            .map_err(|_| Error::Thread(ThreadError::Start))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    /// Requests the thread stop and waits up to `timeout` for it to exit.
    /// A thread calling `stop()` on itself is a programming error in this
    /// model (would deadlock on `join`); callers are expected to only stop
    /// threads they spawned, from a different thread.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), Error> {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let start = Instant::now();
            while !handle.is_finished() {
                if start.elapsed() > timeout {
                    return Err(Error::Thread(ThreadError::Timeout));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn stop_token_wakes_sleepers() {
        let token = StopToken::new();
        let token2 = token.clone();
        let handle = std::thread::spawn(move || token2.sleep(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        token.stop();
        let result = handle.join().unwrap();
        assert_eq!(result, Err(Error::StopRequested));
    }

    #[test]
    fn worker_thread_stops_cleanly() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter2 = counter.clone();
        let mut worker = WorkerThread::start("test-worker", move |stop| {
            while stop.sleep(Duration::from_millis(5)).is_ok() {
                counter2.fetch_add(1, Ordering::SeqCst);
            }
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        worker.stop(Duration::from_secs(1)).unwrap();
        assert!(counter.load(Ordering::SeqCst) > 0);
    }
}
