//! # Timer
//!
//! Min-heap scheduler for one-shot and repeating callbacks.
//!
//! Items live in an arena; callers hold a [`TimerId`] made of the slot and a
//! generation counter, so cancelling or resetting an item that already fired
//! (or was cancelled and its slot reused) is a harmless no-op.
//!
//! Each `Timer` owns one OS thread that sleeps until the heap head is due,
//! pops it, and runs the callback outside the heap lock inside a panic
//! boundary. Callbacks run sequentially and should stay short; anything slow
//! belongs on a task it spawns. Because the driver is a plain thread a timer
//! works from synchronous code and across tokio runtimes.
//!
//! ## Example
//! ```rust
//! use framelink::timer::Timer;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let timer = Timer::new("example");
//! let hits = Arc::new(AtomicUsize::new(0));
//! let h = hits.clone();
//! timer.schedule(Duration::ZERO, Duration::from_millis(1), 3, move || {
//!     h.fetch_add(1, Ordering::SeqCst);
//! });
//! std::thread::sleep(Duration::from_millis(100));
//! assert_eq!(hits.load(Ordering::SeqCst), 3);
//! ```

mod heap;

use crate::error::{NetError, Result};
use crate::utils::panic_message;
use heap::{Entry, IndexedHeap};
use once_cell::sync::Lazy;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Handle to a scheduled item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    slot: usize,
    generation: u64,
}

enum Callback {
    Once(Box<dyn FnOnce() + Send>),
    Repeat(Box<dyn FnMut() + Send>),
}

struct Item {
    /// Taken out while a repeating callback runs
    callback: Option<Callback>,
    interval: Duration,
    /// Firings left, `None` repeats forever
    remaining: Option<u64>,
}

#[derive(Default)]
struct Slot {
    generation: u64,
    item: Option<Item>,
}

#[derive(Default)]
struct State {
    slots: Vec<Slot>,
    free: Vec<usize>,
    heap: IndexedHeap,
    next_seq: u64,
    stopped: bool,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert(&mut self, expiry: Instant, item: Item) -> TimerId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                self.slots.len() - 1
            }
        };
        self.slots[slot].item = Some(item);
        let seq = self.next_seq();
        self.heap.push(Entry { expiry, seq, slot });
        TimerId {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    fn is_live(&self, id: TimerId) -> bool {
        self.slots
            .get(id.slot)
            .is_some_and(|s| s.generation == id.generation && s.item.is_some())
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot].item = None;
        self.slots[slot].generation += 1;
        self.free.push(slot);
    }
}

struct Shared {
    tag: String,
    state: Mutex<State>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Callbacks never run under this lock, so poisoning carries no torn state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cancel(&self, id: TimerId) -> bool {
        let mut state = self.lock();
        if !state.is_live(id) {
            return false;
        }
        state.heap.remove(id.slot);
        state.release(id.slot);
        drop(state);
        self.wake.notify_one();
        true
    }

    fn run(self: Arc<Self>) {
        let mut state = self.lock();
        loop {
            if state.stopped {
                break;
            }
            let now = Instant::now();
            let due = match state.heap.peek().map(|head| head.expiry) {
                None => {
                    state = self.wake.wait(state).unwrap_or_else(|e| e.into_inner());
                    continue;
                }
                Some(expiry) if expiry > now => {
                    let wait = expiry - now;
                    state = self
                        .wake
                        .wait_timeout(state, wait)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                    continue;
                }
                Some(_) => state.heap.pop(),
            };
            let Some(entry) = due else { continue };

            let slot = entry.slot;
            let generation = state.slots[slot].generation;
            let Some(item) = state.slots[slot].item.as_mut() else {
                continue;
            };
            let callback = item.callback.take();
            let again = match item.remaining.as_mut() {
                None => true,
                Some(left) => {
                    *left = left.saturating_sub(1);
                    *left > 0
                }
            };
            let interval = item.interval;

            if again && matches!(callback, Some(Callback::Repeat(_))) {
                let seq = state.next_seq();
                state.heap.push(Entry {
                    expiry: now + interval,
                    seq,
                    slot,
                });
            } else {
                state.release(slot);
            }
            drop(state);

            let callback = callback.and_then(|cb| self.fire(cb));

            state = self.lock();
            if let Some(cb) = callback {
                let current = &mut state.slots[slot];
                if current.generation == generation {
                    if let Some(item) = current.item.as_mut() {
                        item.callback = Some(cb);
                    }
                }
            }
        }
        state.heap.clear();
        state.slots.clear();
        state.free.clear();
        drop(state);
        debug!(tag = %self.tag, "timer stopped");
    }

    /// Run one callback, handing a repeating one back for the next firing.
    fn fire(&self, cb: Callback) -> Option<Callback> {
        match cb {
            Callback::Once(f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
                    error!(tag = %self.tag, panic = %panic_message(&*panic), "timer callback panicked");
                }
                None
            }
            Callback::Repeat(mut f) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(&mut f)) {
                    error!(tag = %self.tag, panic = %panic_message(&*panic), "timer callback panicked");
                }
                Some(Callback::Repeat(f))
            }
        }
    }
}

/// Min-heap timer driven by a dedicated thread.
pub struct Timer {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Timer {
    /// Create a timer and start its driver thread.
    ///
    /// # Panics
    /// If the OS refuses to spawn a thread, like `std::thread::spawn`. Use
    /// [`Timer::try_new`] to handle that case.
    pub fn new(tag: &str) -> Self {
        match Self::try_new(tag) {
            Ok(timer) => timer,
            Err(e) => panic!("failed to start timer '{tag}': {e}"),
        }
    }

    pub fn try_new(tag: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            tag: tag.to_string(),
            state: Mutex::new(State::default()),
            wake: Condvar::new(),
        });
        let worker = shared.clone();
        let handle = std::thread::Builder::new()
            .name(format!("timer-{tag}"))
            .spawn(move || worker.run())
            .map_err(NetError::Transport)?;
        Ok(Self {
            shared,
            driver: Mutex::new(Some(handle)),
        })
    }

    pub fn tag(&self) -> &str {
        &self.shared.tag
    }

    /// Run `cb` once after `delay`.
    pub fn once<F>(&self, delay: Duration, cb: F) -> TimerId
    where
        F: FnOnce() + Send + 'static,
    {
        self.insert(
            delay,
            Item {
                callback: Some(Callback::Once(Box::new(cb))),
                interval: Duration::ZERO,
                remaining: Some(1),
            },
        )
    }

    /// Run `cb` after `delay`, then every `interval`.
    ///
    /// `repeat` is the total number of firings; zero or negative repeats
    /// until cancelled. The next expiry is taken from the firing time, so a
    /// slow callback delays but never bunches later firings.
    pub fn schedule<F>(&self, delay: Duration, interval: Duration, repeat: i64, cb: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let remaining = (repeat > 0).then_some(repeat as u64);
        self.insert(
            delay,
            Item {
                callback: Some(Callback::Repeat(Box::new(cb))),
                interval,
                remaining,
            },
        )
    }

    fn insert(&self, delay: Duration, item: Item) -> TimerId {
        let expiry = Instant::now() + delay;
        let mut state = self.shared.lock();
        if state.stopped {
            debug!(tag = %self.shared.tag, "schedule on stopped timer dropped");
            // Dropping the item drops its callback, which releases any alarm waiting on it
            return TimerId {
                slot: usize::MAX,
                generation: 0,
            };
        }
        let id = state.insert(expiry, item);
        let wake = state.heap.peek().map(|e| e.slot) == Some(id.slot);
        drop(state);
        if wake {
            self.shared.wake.notify_one();
        }
        id
    }

    /// Remove a pending item. Stale ids are logged and ignored.
    pub fn cancel(&self, id: TimerId) {
        if !self.shared.cancel(id) {
            debug!(tag = %self.shared.tag, ?id, "cancel on stale timer id");
        }
    }

    /// Move a pending item to fire `delay` from now. Stale ids are logged and ignored.
    pub fn reset(&self, id: TimerId, delay: Duration) {
        let expiry = Instant::now() + delay;
        let mut state = self.shared.lock();
        if !state.is_live(id) {
            debug!(tag = %self.shared.tag, ?id, "reset on stale timer id");
            return;
        }
        let seq = state.next_seq();
        state.heap.update(id.slot, expiry, seq);
        drop(state);
        self.shared.wake.notify_one();
    }

    /// Future resolving after `delay`; dropping it cancels the item.
    pub fn after(&self, delay: Duration) -> Alarm {
        let (tx, rx) = oneshot::channel();
        let id = self.once(delay, move || {
            let _ = tx.send(());
        });
        Alarm {
            rx,
            id,
            timer: Arc::downgrade(&self.shared),
            done: false,
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.shared.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the driver and drop every pending item. Idempotent.
    ///
    /// Safe to call from inside a callback; the driver exits after it returns.
    pub fn stop(&self) {
        {
            let mut state = self.shared.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
        }
        self.shared.wake.notify_all();

        let handle = self
            .driver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
                error!(tag = %self.shared.tag, "timer driver exited with a panic");
            }
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer").field("tag", &self.shared.tag).finish()
    }
}

/// Awaitable one-shot item created by [`Timer::after`].
///
/// Resolves when the delay elapses, or immediately if the timer is stopped.
#[must_use = "an alarm does nothing unless awaited"]
pub struct Alarm {
    rx: oneshot::Receiver<()>,
    id: TimerId,
    timer: Weak<Shared>,
    done: bool,
}

impl Future for Alarm {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(_) => {
                self.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        if !self.done {
            if let Some(shared) = self.timer.upgrade() {
                shared.cancel(self.id);
            }
        }
    }
}

static DEFAULT_TIMER: Lazy<Arc<Timer>> = Lazy::new(|| Arc::new(Timer::new("default")));

/// Process-wide timer.
///
/// Created on first use and never torn down; its driver thread lives until
/// the process exits. Prefer passing an explicit `Arc<Timer>` where the
/// lifecycle matters, e.g. in tests that stop their timer.
pub fn default_timer() -> Arc<Timer> {
    DEFAULT_TIMER.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_fires_in_expiry_order() {
        let timer = Timer::new("order");
        let log = Arc::new(Mutex::new(Vec::new()));
        for (ms, tag) in [(60u64, 'c'), (20, 'a'), (40, 'b')] {
            let log = log.clone();
            timer.once(Duration::from_millis(ms), move || log.lock().unwrap().push(tag));
        }
        assert!(wait_until(Duration::from_secs(2), || log.lock().unwrap().len() == 3));
        assert_eq!(*log.lock().unwrap(), vec!['a', 'b', 'c']);
    }

    #[test]
    fn test_cancel_and_stale_cancel() {
        let timer = Timer::new("cancel");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = timer.once(Duration::from_millis(30), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.len(), 1);
        timer.cancel(id);
        assert_eq!(timer.len(), 0);
        timer.cancel(id);

        // Reuse the slot, then cancel with the stale id: the new item survives
        let h = hits.clone();
        let fresh = timer.once(Duration::from_millis(10), move || {
            h.fetch_add(10, Ordering::SeqCst);
        });
        assert_ne!(fresh, id);
        timer.cancel(id);
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 10));
    }

    #[test]
    fn test_reset_postpones() {
        let timer = Timer::new("reset");
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = timer.once(Duration::from_millis(30), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.reset(id, Duration::from_millis(300));
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(wait_until(Duration::from_secs(2), || hits.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_repeat_count_and_forever() {
        let timer = Timer::new("repeat");
        let counted = Arc::new(AtomicUsize::new(0));
        let c = counted.clone();
        timer.schedule(Duration::ZERO, Duration::from_millis(5), 4, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let forever = Arc::new(AtomicUsize::new(0));
        let f = forever.clone();
        let id = timer.schedule(Duration::ZERO, Duration::from_millis(5), 0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(wait_until(Duration::from_secs(2), || forever.load(Ordering::SeqCst) >= 10));
        assert_eq!(counted.load(Ordering::SeqCst), 4);
        timer.cancel(id);
        let seen = forever.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert!(forever.load(Ordering::SeqCst) <= seen + 1);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_panicking_callback_keeps_driver_alive() {
        let timer = Timer::new("panic");
        timer.once(Duration::ZERO, || panic!("boom"));
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        timer.once(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wait_until(Duration::from_secs(1), || hits.load(Ordering::SeqCst) == 1));
    }

    #[tokio::test]
    async fn test_alarm_resolves_and_drop_cancels() {
        let timer = Timer::new("alarm");
        let start = Instant::now();
        timer.after(Duration::from_millis(20)).await;
        assert!(start.elapsed() >= Duration::from_millis(20));

        let alarm = timer.after(Duration::from_secs(30));
        assert_eq!(timer.len(), 1);
        drop(alarm);
        assert_eq!(timer.len(), 0);
    }

    #[tokio::test]
    async fn test_alarm_on_stopped_timer_resolves() {
        let timer = Timer::new("stopped");
        timer.stop();
        tokio::time::timeout(Duration::from_secs(1), timer.after(Duration::from_secs(30)))
            .await
            .ok();
        assert!(timer.is_empty());
    }

    #[test]
    fn test_default_timer_is_shared() {
        assert!(Arc::ptr_eq(&default_timer(), &default_timer()));
    }
}
