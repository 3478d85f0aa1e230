//! Shared state of the parallel reverse-map build: the probability-ordered
//! work queue and the per-address in-flight slots.
//!
//! Lock order is address-slot, then range-tree writer, then queue; the
//! queue and the slot map never nest inside each other.

use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use hashbrown::HashMap;

use super::node::NodeId;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Queue item ordered by probability, highest first.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueItem {
    pub probability: f32,
    pub node: NodeId,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.probability.total_cmp(&other.probability).is_eq()
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.probability.total_cmp(&other.probability)
    }
}

struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    idle: usize,
    workers: usize,
    done: bool,
}

/// Bounded-semaphore-style work queue with collective-idle termination:
/// when every worker is waiting and the heap is empty, the build is over.
pub(crate) struct WorkQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl WorkQueue {
    pub fn new(workers: usize) -> WorkQueue {
        WorkQueue {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                idle: 0,
                workers,
                done: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, item: QueueItem) {
        let mut g = lock(&self.inner);
        g.heap.push(item);
        drop(g);
        self.cond.notify_one();
    }

    /// Blocks until an item arrives or the build completes.
    pub fn pop(&self) -> Option<QueueItem> {
        let mut g = lock(&self.inner);
        loop {
            if g.done {
                return None;
            }
            if let Some(item) = g.heap.pop() {
                return Some(item);
            }
            g.idle += 1;
            if g.idle == g.workers {
                g.done = true;
                drop(g);
                self.cond.notify_all();
                return None;
            }
            g = match self.cond.wait(g) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            g.idle -= 1;
        }
    }

    /// Wakes every worker into completion; used on interrupt.
    pub fn shutdown(&self) {
        let mut g = lock(&self.inner);
        g.done = true;
        drop(g);
        self.cond.notify_all();
    }

    pub fn is_done(&self) -> bool {
        lock(&self.inner).done
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).heap.len()
    }
}

struct Slot {
    busy: Mutex<bool>,
    cv: Condvar,
}

/// One lock per in-flight address: a worker racing on the same virtual
/// address blocks on that slot instead of spinning or stalling the world.
pub(crate) struct AddressLocks {
    slots: Mutex<HashMap<u64, Arc<Slot>>>,
}

impl AddressLocks {
    pub fn new() -> AddressLocks {
        AddressLocks {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, address: u64) -> AddressGuard<'_> {
        let slot = {
            let mut slots = lock(&self.slots);
            slots
                .entry(address)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        busy: Mutex::new(false),
                        cv: Condvar::new(),
                    })
                })
                .clone()
        };
        let mut busy = lock(&slot.busy);
        while *busy {
            busy = match slot.cv.wait(busy) {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
        }
        *busy = true;
        drop(busy);
        AddressGuard {
            locks: self,
            address,
            slot,
        }
    }
}

pub(crate) struct AddressGuard<'a> {
    locks: &'a AddressLocks,
    address: u64,
    slot: Arc<Slot>,
}

impl Drop for AddressGuard<'_> {
    fn drop(&mut self) {
        {
            let mut busy = lock(&self.slot.busy);
            *busy = false;
        }
        self.slot.cv.notify_one();
        let mut slots = lock(&self.locks.slots);
        // Map + this guard are the only holders: nobody waits, free the slot.
        if Arc::strong_count(&self.slot) == 2 {
            slots.remove(&self.address);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn queue_orders_by_probability() {
        let q = WorkQueue::new(1);
        q.push(QueueItem { probability: 0.5, node: 1 });
        q.push(QueueItem { probability: 0.9, node: 2 });
        q.push(QueueItem { probability: 0.7, node: 3 });
        assert_eq!(q.pop().unwrap().node, 2);
        assert_eq!(q.pop().unwrap().node, 3);
        assert_eq!(q.pop().unwrap().node, 1);
        // heap empty and the single worker idle: terminates
        assert!(q.pop().is_none());
    }

    #[test]
    fn queue_terminates_all_workers() {
        let q = Arc::new(WorkQueue::new(3));
        let popped = Arc::new(AtomicUsize::new(0));
        for i in 0..8 {
            q.push(QueueItem { probability: i as f32 / 10.0, node: i });
        }
        std::thread::scope(|s| {
            for _ in 0..3 {
                let q = q.clone();
                let popped = popped.clone();
                s.spawn(move || {
                    while q.pop().is_some() {
                        popped.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(popped.load(Ordering::Relaxed), 8);
    }

    #[test]
    fn address_slots_serialize_same_address() {
        let locks = AddressLocks::new();
        let counter = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|s| {
            for _ in 0..4 {
                let locks = &locks;
                let counter = counter.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let _g = locks.acquire(0xdead_beef);
                        let v = counter.load(Ordering::SeqCst);
                        std::hint::spin_loop();
                        counter.store(v + 1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(counter.load(Ordering::SeqCst), 400);
        assert!(lock(&locks.slots).is_empty(), "slots freed after use");
    }
}
