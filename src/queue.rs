//! The shared global queue and the quiescence protocol.
//!
//! Workers redistribute surplus work through one bounded queue guarded by a
//! mutex and a condition variable. The same mutex carries the termination
//! protocol: a worker with nothing to do parks on the condition and counts
//! itself in `waiters`; the worker that brings `waiters` up to the thread
//! count is, by construction, holding the mutex while every peer is parked,
//! so it can declare the phase complete and wake them all. The soundness of
//! that detection rests on one rule: work is only ever published to this
//! queue under the mutex, so no thread can be counted as a waiter while it
//! still holds undrained work.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crossbeam_utils::CachePadded;

use crate::deque::Deque;
use crate::log::{Event, Logger};
use crate::Tuning;

pub(crate) struct GlobalQueue {
    shared: Mutex<Shared>,
    work_available: Condvar,
    /// Workers currently parked in `pop_work`. Written only with the mutex
    /// held; read without it by the `offer_work` fast-path predicate.
    waiters: CachePadded<AtomicUsize>,
    /// Mirror of the ring length for the same fast path.
    len_hint: CachePadded<AtomicUsize>,
    num_threads: usize,
    max_grab: usize,
    low_water: usize,
    /// Half the local deque capacity: the retention threshold below which a
    /// worker keeps what it has.
    local_halfway: usize,
}

struct Shared {
    ring: Deque,
    /// Monotonic: once true, the phase is over.
    complete: bool,
}

impl GlobalQueue {
    pub(crate) fn new(num_threads: usize, tuning: &Tuning) -> GlobalQueue {
        GlobalQueue {
            shared: Mutex::new(Shared {
                ring: Deque::new(tuning.global_capacity),
                complete: false,
            }),
            work_available: Condvar::new(),
            waiters: CachePadded::new(AtomicUsize::new(0)),
            len_hint: CachePadded::new(AtomicUsize::new(0)),
            num_threads,
            max_grab: tuning.max_grab,
            low_water: tuning.low_water,
            local_halfway: tuning.local_capacity / 2,
        }
    }

    /// Blocks until work or quiescence, then transfers up to `max_grab`
    /// objects from the oldest end of the ring into `local`. Returns the
    /// number transferred; 0 means the phase is complete and the worker
    /// should exit.
    pub(crate) fn pop_work(&self, worker: usize, local: &mut Deque, logger: &Logger) -> usize {
        let mut shared = self.lock();
        while shared.ring.is_empty() && !shared.complete {
            let waiters = self.waiters.fetch_add(1, Ordering::Relaxed) + 1;
            if waiters == self.num_threads {
                // Everyone else is parked on the condition and the queue is
                // empty: no object anywhere is left undrained.
                shared.complete = true;
                self.work_available.notify_all();
                logger.log(|| Event::QuiescenceReached { worker });
            } else {
                logger.log(|| Event::WorkerWaiting { worker, waiters });
                shared = self
                    .work_available
                    .wait(shared)
                    .unwrap_or_else(PoisonError::into_inner);
                logger.log(|| Event::WorkerWoken { worker });
            }
            self.waiters.fetch_sub(1, Ordering::Relaxed);
        }

        let grab = Ord::min(shared.ring.len(), self.max_grab);
        for _ in 0..grab {
            let pushed = local.push(shared.ring.pop_back());
            debug_assert!(pushed, "grab exceeded the local deque capacity");
        }
        self.len_hint.store(shared.ring.len(), Ordering::Relaxed);
        if grab > 0 {
            logger.log(|| Event::ObjectsGrabbed {
                worker,
                count: grab,
            });
        } else {
            debug_assert!(shared.complete);
        }
        grab
    }

    /// Donates half of `local` (oldest entries first) when doing so is
    /// likely to matter: a peer is parked, or the shared queue has drained
    /// below its low-water level while this worker holds plenty.
    pub(crate) fn offer_work(&self, worker: usize, local: &mut Deque, logger: &Logger) {
        // Unlocked heuristic reads; a stale value costs at most a missed or
        // spurious offer, never an object.
        let waiters = self.waiters.load(Ordering::Relaxed);
        let global_len = self.len_hint.load(Ordering::Relaxed);
        // Below 3 items, donating half just bounces single objects around.
        let peers_starving = waiters > 0 && local.len() > 2;
        let queue_draining = global_len < self.low_water && local.len() > self.local_halfway;
        if !peers_starving && !queue_draining {
            return;
        }

        let mut shared = self.lock();
        let free = shared.ring.capacity() - shared.ring.len();
        let count = Ord::min(local.len() / 2, free);
        for _ in 0..count {
            let pushed = shared.ring.push(local.pop_back());
            debug_assert!(pushed, "offer exceeded the global queue capacity");
        }
        self.len_hint.store(shared.ring.len(), Ordering::Relaxed);
        if count > 0 {
            logger.log(|| Event::ObjectsOffered { worker, count });
        }
        if self.waiters.load(Ordering::Relaxed) > 0 {
            self.work_available.notify_all();
        }
    }

    /// Forces completion so every worker leaves `pop_work`. Used when a
    /// phase must be abandoned: a collector panic or a failed spawn would
    /// otherwise leave peers parked forever.
    pub(crate) fn terminate(&self) {
        let mut shared = self.lock();
        shared.complete = true;
        self.work_available.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // A poisoned mutex means a peer is already unwinding the phase;
        // the protected state is still sound (every transfer is completed
        // before the guard drops), so keep going and let the driver re-raise.
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
