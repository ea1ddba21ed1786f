//! The per-phase mark session: worker threads, their run loop, and the
//! deferred-mark hook the collector calls back into.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::panic;

use crossbeam_utils::thread;

use crate::deque::Deque;
use crate::log::{Event, Logger};
use crate::queue::GlobalQueue;
use crate::{MarkError, MarkPool, ObjectRef, ObjectSpace};

/// Everything one parallel mark phase shares: the objspace under
/// collection, the global queue, and the logger. Constructed when the phase
/// starts, dropped when the last worker has been joined; workers borrow it
/// rather than own it.
pub(crate) struct Registry<'s, S: ObjectSpace> {
    objspace: &'s S,
    global: GlobalQueue,
    logger: Logger,
    num_threads: usize,
    local_capacity: usize,
}

impl<'s, S: ObjectSpace> Registry<'s, S> {
    fn new(objspace: &'s S, pool: &MarkPool) -> Registry<'s, S> {
        Registry {
            objspace,
            global: GlobalQueue::new(pool.num_threads(), pool.tuning()),
            logger: Logger::new(),
            num_threads: pool.num_threads(),
            local_capacity: pool.tuning().local_capacity,
        }
    }
}

/// Runs one parallel mark phase: spawns workers `1..N`, runs worker 0 in
/// place, and joins everything before returning.
///
/// Worker 0 must stay on the calling thread. Collectors that scan stacks
/// conservatively enumerate roots out of the frames of whoever invoked the
/// phase; moving the root scan onto a spawned thread would lose them.
pub(crate) fn mark_parallel<S: ObjectSpace>(
    pool: &MarkPool,
    objspace: &S,
) -> Result<(), MarkError> {
    let registry = Registry::new(objspace, pool);
    let registry = &registry;
    let result = thread::scope(|scope| {
        for index in 1..registry.num_threads {
            let mut builder = scope.builder().name(format!("parmark-{}", index));
            if let Some(stack_size) = pool.stack_size() {
                builder = builder.stack_size(stack_size);
            }
            if let Err(err) = builder.spawn(move |_| main_loop(registry, index)) {
                // Wake whatever already parked so the scope can join it;
                // those workers exit without having marked anything.
                registry.global.terminate();
                return Err(MarkError::thread_spawn(err));
            }
        }
        main_loop(registry, 0);
        Ok(())
    });
    match result {
        Ok(outcome) => outcome,
        // A worker unwound through the collector. Its drop guard already
        // drove every peer to completion and the scope joined them, so all
        // that is left is to hand the payload back to the caller.
        Err(payload) => panic::resume_unwind(payload),
    }
}

/// The run loop shared by the initiator (index 0) and the spawned workers.
fn main_loop<S: ObjectSpace>(registry: &Registry<'_, S>, index: usize) {
    let worker = WorkerThread {
        deque: RefCell::new(Deque::new(registry.local_capacity)),
        deferring: Cell::new(true),
        index,
        registry,
    };
    let marker = Marker {
        objspace: registry.objspace,
        worker: Some(&worker),
    };

    // If the collector unwinds out of this frame, release the peers first;
    // they would otherwise park in pop_work forever.
    let poison_on_unwind = PoisonOnUnwind(&registry.global);

    registry.logger.log(|| Event::WorkerStart { worker: index });
    if index == 0 {
        registry.logger.log(|| Event::RootScanStart { worker: index });
        registry.objspace.start_mark(&marker);
        registry.logger.log(|| Event::RootScanDone { worker: index });
    }

    loop {
        let obj = {
            let mut local = worker.deque.borrow_mut();
            registry
                .global
                .offer_work(index, &mut *local, &registry.logger);
            if local.is_empty()
                && registry
                    .global
                    .pop_work(index, &mut *local, &registry.logger)
                    == 0
            {
                break;
            }
            local.pop()
        };
        // The deque borrow is released first: visiting `obj`'s edges
        // re-enters it through `marker`.
        registry.objspace.mark_object(&marker, obj);
    }

    registry.logger.log(|| Event::WorkerTerminate { worker: index });
    mem::forget(poison_on_unwind);
}

struct PoisonOnUnwind<'a>(&'a GlobalQueue);

impl Drop for PoisonOnUnwind<'_> {
    fn drop(&mut self) {
        self.0.terminate();
    }
}

/// One worker's private state.
struct WorkerThread<'a, S: ObjectSpace> {
    deque: RefCell<Deque>,
    /// Cleared while the overflow fallback recurses, so nested `mark` calls
    /// stay on this stack instead of re-entering a full deque.
    deferring: Cell<bool>,
    index: usize,
    registry: &'a Registry<'a, S>,
}

impl<'a, S: ObjectSpace> WorkerThread<'a, S> {
    fn defer(&self, marker: &Marker<'_, S>, obj: ObjectRef) {
        let registry = self.registry;
        {
            let mut local = self.deque.borrow_mut();
            if local.push(obj) {
                return;
            }
            // Local deque full: donate the oldest half and retry.
            registry
                .global
                .offer_work(self.index, &mut *local, &registry.logger);
            if local.push(obj) {
                return;
            }
        }
        // The global queue is full too. Visit `obj` right here rather than
        // allocate unbounded storage; this is the back-pressure that keeps
        // pathological fan-out from exhausting memory.
        registry.logger.log(|| Event::DeferOverflow { worker: self.index });
        self.deferring.set(false);
        registry.objspace.mark_object(marker, obj);
        self.deferring.set(true);
    }
}

/// Handle through which the collector reports discovered references during
/// a mark phase.
///
/// The engine passes a `Marker` into every [`ObjectSpace`] callback.
/// Wherever the collector's marker would recurse into a reference, it calls
/// [`Marker::mark`] instead; depending on the phase the reference is either
/// visited immediately on this stack or deferred onto the current worker's
/// local deque for any worker to pick up.
pub struct Marker<'a, S: ObjectSpace> {
    objspace: &'a S,
    /// `None` when marking single-threaded: every `mark` recurses directly.
    worker: Option<&'a WorkerThread<'a, S>>,
}

impl<'a, S: ObjectSpace> Marker<'a, S> {
    pub(crate) fn synchronous(objspace: &'a S) -> Marker<'a, S> {
        Marker {
            objspace,
            worker: None,
        }
    }

    /// Reports `obj` as reachable, scheduling a visit of its outgoing
    /// references unless the collector has already marked it.
    pub fn mark(&self, obj: ObjectRef) {
        match self.worker {
            Some(worker) if worker.deferring.get() => worker.defer(self, obj),
            _ => self.objspace.mark_object(self, obj),
        }
    }
}

impl<'a, S: ObjectSpace> fmt::Debug for Marker<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Marker")
            .field("worker", &self.worker.map(|w| w.index))
            .finish()
    }
}
