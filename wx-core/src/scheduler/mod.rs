//! Scheduled-event manager: a binary min-heap of (expiry, id, callback)
//! with O(log n) schedule/cancel and a single scheduler loop that wakes
//! exactly when the earliest event is due. Ported from the teacher's
//! priority-job-queue idiom (a `BinaryHeap` behind a lock, with a channel
//! used purely as a wakeup signal) and generalized with an id-keyed index
//! so a pending event can be replaced or cancelled in place.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub type Callback = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct Entry {
    id: String,
    callback: Option<Callback>,
}

/// Min-heap ordering on `Instant`: invert the natural `Ord` so the
/// smallest expiry sorts first in a `std`-style max-heap-by-default
/// `Vec` comparison.
struct HeapItem {
    expiry: Instant,
    slot: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.expiry == other.expiry
    }
}
impl Eq for HeapItem {}
impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.expiry.cmp(&self.expiry)
    }
}

/// Indexed binary heap: a `Vec<HeapItem>` plus a side map from slab slot
/// to heap position, so `cancel` finds and removes an arbitrary element
/// in O(log n) instead of the O(n) scan a plain `std::collections::BinaryHeap`
/// would force.
struct IndexedHeap {
    heap: Vec<HeapItem>,
    entries: Slab<Entry>,
    id_to_slot: HashMap<String, usize>,
    slot_to_heap_pos: HashMap<usize, usize>,
}

impl IndexedHeap {
    fn new() -> Self {
        Self {
            heap: Vec::new(),
            entries: Slab::new(),
            id_to_slot: HashMap::new(),
            slot_to_heap_pos: HashMap::new(),
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.slot_to_heap_pos.insert(self.heap[a].slot, a);
        self.slot_to_heap_pos.insert(self.heap[b].slot, b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i] < self.heap[parent] {
                self.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = 2 * i + 2;
            let mut smallest = i;
            if left < self.heap.len() && self.heap[left] < self.heap[smallest] {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right] < self.heap[smallest] {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    /// Replace any existing event with the same id, then insert. Returns
    /// true if the new event became (or remains) the heap minimum.
    fn schedule(&mut self, id: String, expiry: Instant, callback: Callback) -> bool {
        self.cancel(&id);

        let slot = self.entries.insert(Entry { id: id.clone(), callback: Some(callback) });
        let pos = self.heap.len();
        self.heap.push(HeapItem { expiry, slot });
        self.slot_to_heap_pos.insert(slot, pos);
        self.id_to_slot.insert(id, slot);
        self.sift_up(pos);

        self.slot_to_heap_pos.get(&slot).copied() == Some(0)
    }

    fn cancel(&mut self, id: &str) -> bool {
        let Some(slot) = self.id_to_slot.remove(id) else {
            return false;
        };
        let Some(&pos) = self.slot_to_heap_pos.get(&slot) else {
            return false;
        };
        self.remove_at(pos);
        self.entries.remove(slot);
        true
    }

    fn remove_at(&mut self, pos: usize) {
        let last = self.heap.len() - 1;
        self.slot_to_heap_pos.remove(&self.heap[pos].slot);
        if pos != last {
            self.heap.swap(pos, last);
            self.slot_to_heap_pos.insert(self.heap[pos].slot, pos);
        }
        self.heap.pop();
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
    }

    fn peek_expiry(&self) -> Option<Instant> {
        self.heap.first().map(|item| item.expiry)
    }

    /// Pop every event whose expiry is `<= now`, in expiry order.
    fn drain_due(&mut self, now: Instant) -> Vec<(String, Callback)> {
        let mut due = Vec::new();
        while let Some(top) = self.heap.first() {
            if top.expiry > now {
                break;
            }
            let slot = top.slot;
            self.remove_at(0);
            let mut entry = self.entries.remove(slot);
            self.id_to_slot.remove(&entry.id);
            let callback = entry.callback.take().expect("entry callback already taken");
            due.push((entry.id, callback));
        }
        due
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Shared {
    heap: Mutex<IndexedHeap>,
    wakeup: Notify,
    stopped: std::sync::atomic::AtomicBool,
}

/// Schedules deferred callbacks with O(log n) schedule/cancel/replace and
/// a single loop task that sleeps until the next event is due. Callbacks
/// run on a bounded worker pool, never on the loop itself; a panicking
/// callback only fails its own `JoinSet` task and is logged, leaving the
/// loop and every other pending event untouched.
#[derive(Clone)]
pub struct EventScheduler {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventScheduler")
            .field("pending", &self.shared.heap.lock().len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStats {
    pub pending: usize,
    pub workers: usize,
}

impl EventScheduler {
    /// Spawn the scheduler loop plus `worker_count` task slots for
    /// callback dispatch, both tied to `cancel`.
    pub fn start(worker_count: usize, cancel: CancellationToken) -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(IndexedHeap::new()),
            wakeup: Notify::new(),
            stopped: std::sync::atomic::AtomicBool::new(false),
        });

        let loop_shared = shared.clone();
        let loop_cancel = cancel.clone();
        let workers = worker_count.max(1);
        tokio::spawn(async move {
            run_loop(loop_shared, workers, loop_cancel).await;
        });

        Self { shared }
    }

    /// Replace any existing event with id `id` and insert a new one.
    /// Fails only if the manager has been stopped.
    pub fn schedule(
        &self,
        id: impl Into<String>,
        expiry: Instant,
        callback: Callback,
    ) -> crate::error::Result<()> {
        if self.shared.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(crate::error::Error::SchedulerStopped);
        }
        let became_min = self.shared.heap.lock().schedule(id.into(), expiry, callback);
        if became_min {
            self.shared.wakeup.notify_one();
        }
        Ok(())
    }

    /// Convenience wrapper for scheduling `duration` from now.
    pub fn schedule_in(
        &self,
        id: impl Into<String>,
        duration: Duration,
        callback: Callback,
    ) -> crate::error::Result<()> {
        self.schedule(id, Instant::now() + duration, callback)
    }

    pub fn cancel(&self, id: &str) -> bool {
        self.shared.heap.lock().cancel(id)
    }

    pub fn stats(&self, worker_count: usize) -> SchedulerStats {
        SchedulerStats { pending: self.shared.heap.lock().len(), workers: worker_count }
    }

    pub fn stop(&self) {
        self.shared.stopped.store(true, std::sync::atomic::Ordering::Release);
        self.shared.wakeup.notify_one();
    }
}

async fn run_loop(shared: Arc<Shared>, worker_count: usize, cancel: CancellationToken) {
    let mut workers: JoinSet<()> = JoinSet::new();

    loop {
        let sleep_until = shared.heap.lock().peek_expiry();

        let woke = match sleep_until {
            Some(expiry) => {
                let now = Instant::now();
                if expiry <= now {
                    true
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(expiry - now) => true,
                        _ = shared.wakeup.notified() => true,
                        _ = cancel.cancelled() => false,
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = shared.wakeup.notified() => true,
                    _ = cancel.cancelled() => false,
                }
            }
        };

        if cancel.is_cancelled() {
            break;
        }
        if !woke {
            continue;
        }

        let due = shared.heap.lock().drain_due(Instant::now());
        for (id, callback) in due {
            trace!(event_id = %id, "dispatching scheduled event");
            while workers.len() >= worker_count {
                match workers.join_next().await {
                    Some(Err(e)) => warn!(error = %e, "scheduled callback task panicked"),
                    _ => break,
                }
            }
            workers.spawn(async move {
                callback().await;
            });
        }
    }

    debug!("scheduler loop shutting down, draining workers");
    while let Some(res) = workers.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "scheduled callback task panicked during shutdown drain");
        }
    }
}

impl Drop for EventScheduler {
    fn drop(&mut self) {
        if Arc::strong_count(&self.shared) == 1 {
            self.shared.stopped.store(true, std::sync::atomic::Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn cb(f: impl FnOnce() + Send + 'static) -> Callback {
        Box::new(move || {
            Box::pin(async move {
                f();
            })
        })
    }

    #[tokio::test]
    async fn rescheduling_same_id_replaces_not_duplicates() {
        let cancel = CancellationToken::new();
        let sched = EventScheduler::start(2, cancel.clone());

        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        sched
            .schedule_in("x", Duration::from_millis(500), cb(move || {
                f1.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let f2 = fired.clone();
        sched
            .schedule_in("x", Duration::from_millis(10), cb(move || {
                f2.fetch_add(100, Ordering::SeqCst);
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 100);
        cancel.cancel();
    }

    #[tokio::test]
    async fn dispatch_order_is_nondecreasing_in_expiry() {
        let cancel = CancellationToken::new();
        let sched = EventScheduler::start(4, cancel.clone());
        let order = Arc::new(Mutex::new(Vec::<u32>::new()));

        for (id, ms, tag) in [("a", 30, 1u32), ("b", 10, 2), ("c", 20, 3)] {
            let order = order.clone();
            sched
                .schedule_in(id, Duration::from_millis(ms), cb(move || {
                    order.lock().push(tag);
                }))
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*order.lock(), vec![2, 3, 1]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn cancel_removes_pending_event() {
        let cancel = CancellationToken::new();
        let sched = EventScheduler::start(1, cancel.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        sched
            .schedule_in("y", Duration::from_millis(50), cb(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(sched.cancel("y"));
        assert!(!sched.cancel("y"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn heap_len_matches_live_event_count() {
        let cancel = CancellationToken::new();
        let sched = EventScheduler::start(1, cancel.clone());
        for i in 0..5 {
            sched
                .schedule_in(format!("evt-{i}"), Duration::from_secs(60), cb(|| {}))
                .unwrap();
        }
        assert_eq!(sched.stats(1).pending, 5);
        sched.cancel("evt-2");
        assert_eq!(sched.stats(1).pending, 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn panicking_callback_does_not_kill_other_events() {
        let cancel = CancellationToken::new();
        let sched = EventScheduler::start(2, cancel.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        sched
            .schedule_in("panics", Duration::from_millis(10), cb(|| {
                panic!("boom");
            }))
            .unwrap();

        let f = fired.clone();
        sched
            .schedule_in("survives", Duration::from_millis(20), cb(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        cancel.cancel();
    }
}
