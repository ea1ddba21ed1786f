//! A parallel marking engine for tracing garbage collectors.
//!
//! Given a root set and a heap whose objects expose their outgoing
//! references, the engine traverses the reachable subgraph with a pool of
//! worker threads and marks every live object. Workers keep discovered
//! objects in bounded per-worker deques, rebalance surplus through a
//! bounded shared queue, and detect completion with a waiter-count
//! quiescence protocol. The collector side (mark bits, root enumeration,
//! edge traversal) stays with the caller behind the [`ObjectSpace`] trait.
//!
//! The root scan always runs on the thread that invoked the phase, so
//! collectors that conservatively scan the caller's stack and registers see
//! the frames they expect.
//!
//! # Example
//!
//! ```
//! use parmark::{mark_all, Marker, ObjectRef, ObjectSpace};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! struct Heap {
//!     edges: Vec<Vec<usize>>,
//!     roots: Vec<usize>,
//!     marks: Vec<AtomicBool>,
//! }
//!
//! impl ObjectSpace for Heap {
//!     fn start_mark(&self, marker: &Marker<'_, Self>) {
//!         for &root in &self.roots {
//!             marker.mark(ObjectRef::from_usize(root));
//!         }
//!     }
//!
//!     fn mark_object(&self, marker: &Marker<'_, Self>, obj: ObjectRef) {
//!         let index = obj.as_usize();
//!         if self.marks[index].swap(true, Ordering::SeqCst) {
//!             return; // already marked
//!         }
//!         for &child in &self.edges[index] {
//!             marker.mark(ObjectRef::from_usize(child));
//!         }
//!     }
//!
//!     fn mark_reset(&self) {
//!         for mark in &self.marks {
//!             mark.store(false, Ordering::SeqCst);
//!         }
//!     }
//! }
//!
//! let heap = Heap {
//!     edges: vec![vec![1, 2], vec![], vec![1]],
//!     roots: vec![0],
//!     marks: (0..3).map(|_| AtomicBool::new(false)).collect(),
//! };
//! mark_all(&heap).unwrap();
//! assert!(heap.marks.iter().all(|m| m.load(Ordering::SeqCst)));
//! ```

#![warn(missing_docs)]

use std::env;
use std::error::Error;
use std::fmt;
use std::io;
use std::time::Instant;

mod deque;
mod log;
mod queue;
mod registry;

pub use crate::registry::Marker;

/// Number of marking threads when neither the builder nor the
/// `PARMARK_NUM_THREADS` environment variable says otherwise (capped by the
/// number of available cores).
const DEFAULT_NUM_THREADS: usize = 4;
const DEFAULT_GLOBAL_CAPACITY: usize = 500;
const DEFAULT_LOCAL_CAPACITY: usize = 200;
const DEFAULT_MAX_GRAB: usize = 4;

/// Opaque handle to a heap object, pointer-sized and trivially copyable.
///
/// The engine never dereferences one; it only shuttles handles between
/// queues and hands them back to the collector. Equality is bit identity.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// Wraps a raw handle value.
    pub const fn from_usize(raw: usize) -> ObjectRef {
        ObjectRef(raw)
    }

    /// Returns the raw handle value.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x})", self.0)
    }
}

/// The collector-side surface of a mark phase.
///
/// The engine drives the traversal and owns the work distribution; the
/// implementor owns the heap, the mark bits, and the edge iteration.
pub trait ObjectSpace: Sized + Sync {
    /// Enumerates the root set, reporting each root through
    /// [`Marker::mark`].
    ///
    /// Always invoked on the thread that entered the phase, before any
    /// other worker can observe work, so a conservative stack scan sees
    /// the caller's own frames and registers.
    fn start_mark(&self, marker: &Marker<'_, Self>);

    /// Visits one object: atomically test-and-sets its mark bit, and for a
    /// *newly marked* object reports every outgoing reference through
    /// [`Marker::mark`].
    ///
    /// Must be safe to invoke concurrently on distinct handles and
    /// idempotent on the same handle: the engine may deliver a handle more
    /// than once, and only the invocation that wins the mark bit should
    /// visit the edges.
    fn mark_object(&self, marker: &Marker<'_, Self>, obj: ObjectRef);

    /// Clears every mark bit, between the phases of [`MarkMode::Dual`] and
    /// [`MarkMode::SingleTwice`]. Auxiliary per-object state is the
    /// implementor's own business.
    fn mark_reset(&self);
}

/// How [`MarkPool::mark_all`] traverses the heap.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarkMode {
    /// Mark on the calling thread only, by direct recursion. The traversal
    /// depth is bounded only by the reachable graph, so this belongs on a
    /// generously sized stack.
    Single,
    /// Mark with the full worker pool. The default.
    Parallel,
    /// Run [`Parallel`](MarkMode::Parallel) timed, reset the mark bits,
    /// then run [`Single`](MarkMode::Single) timed over the same snapshot.
    /// The benchmarking mode.
    Dual,
    /// Run [`Single`](MarkMode::Single) twice with a reset in between; a
    /// noise baseline for the benchmark harness.
    SingleTwice,
}

impl Default for MarkMode {
    fn default() -> MarkMode {
        MarkMode::Parallel
    }
}

/// Queue-sizing knobs, resolved and validated by
/// [`MarkPoolBuilder::build`].
#[derive(Clone, Debug)]
pub(crate) struct Tuning {
    pub(crate) global_capacity: usize,
    pub(crate) local_capacity: usize,
    pub(crate) max_grab: usize,
    pub(crate) low_water: usize,
}

/// Error returned when a pool cannot be configured or a phase cannot be
/// started.
#[derive(Debug)]
pub struct MarkError {
    kind: ErrorKind,
}

#[derive(Debug)]
enum ErrorKind {
    InvalidTuning(&'static str),
    ThreadSpawn(io::Error),
}

impl MarkError {
    fn invalid_tuning(what: &'static str) -> MarkError {
        MarkError {
            kind: ErrorKind::InvalidTuning(what),
        }
    }

    pub(crate) fn thread_spawn(err: io::Error) -> MarkError {
        MarkError {
            kind: ErrorKind::ThreadSpawn(err),
        }
    }
}

impl fmt::Display for MarkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::InvalidTuning(what) => write!(f, "invalid mark pool tuning: {}", what),
            ErrorKind::ThreadSpawn(err) => write!(f, "failed to spawn a marking thread: {}", err),
        }
    }
}

impl Error for MarkError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.kind {
            ErrorKind::ThreadSpawn(err) => Some(err),
            ErrorKind::InvalidTuning(_) => None,
        }
    }
}

/// Configures a [`MarkPool`].
///
/// ```
/// # use parmark::{MarkMode, MarkPoolBuilder};
/// let pool = MarkPoolBuilder::new()
///     .num_threads(2)
///     .mode(MarkMode::Parallel)
///     .build()
///     .unwrap();
/// assert_eq!(pool.num_threads(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct MarkPoolBuilder {
    num_threads: usize,
    mode: MarkMode,
    global_capacity: usize,
    local_capacity: usize,
    max_grab: usize,
    low_water: Option<usize>,
    stack_size: Option<usize>,
    bench: bool,
}

impl MarkPoolBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> MarkPoolBuilder {
        MarkPoolBuilder {
            num_threads: 0,
            mode: MarkMode::default(),
            global_capacity: DEFAULT_GLOBAL_CAPACITY,
            local_capacity: DEFAULT_LOCAL_CAPACITY,
            max_grab: DEFAULT_MAX_GRAB,
            low_water: None,
            stack_size: None,
            bench: false,
        }
    }

    /// Sets the number of marking threads, including the initiator.
    ///
    /// `0` (the default) selects the `PARMARK_NUM_THREADS` environment
    /// variable if set, and otherwise the number of available cores capped
    /// at 4.
    pub fn num_threads(mut self, num_threads: usize) -> MarkPoolBuilder {
        self.num_threads = num_threads;
        self
    }

    /// Sets the traversal mode. Defaults to [`MarkMode::Parallel`].
    pub fn mode(mut self, mode: MarkMode) -> MarkPoolBuilder {
        self.mode = mode;
        self
    }

    /// Sets the capacity of the shared global queue. Defaults to 500.
    pub fn global_capacity(mut self, capacity: usize) -> MarkPoolBuilder {
        self.global_capacity = capacity;
        self
    }

    /// Sets the capacity of each worker's local deque. Defaults to 200.
    pub fn local_capacity(mut self, capacity: usize) -> MarkPoolBuilder {
        self.local_capacity = capacity;
        self
    }

    /// Sets how many objects a worker grabs from the global queue per
    /// refill. Defaults to 4.
    pub fn max_grab(mut self, max_grab: usize) -> MarkPoolBuilder {
        self.max_grab = max_grab;
        self
    }

    /// Sets the global-queue level below which workers with surplus start
    /// donating. Defaults to a quarter of the global capacity.
    pub fn low_water(mut self, low_water: usize) -> MarkPoolBuilder {
        self.low_water = Some(low_water);
        self
    }

    /// Sets the stack size, in bytes, of the spawned workers. The initiator
    /// keeps the calling thread's stack.
    pub fn stack_size(mut self, stack_size: usize) -> MarkPoolBuilder {
        self.stack_size = Some(stack_size);
        self
    }

    /// Enables benchmark output on stdout: the thread count, a
    /// milliseconds line per timed call in [`MarkMode::Dual`], and the
    /// `A`/`B`/`END` phase markers scraped by benchmark harnesses.
    pub fn bench(mut self, bench: bool) -> MarkPoolBuilder {
        self.bench = bench;
        self
    }

    /// Validates the configuration and produces the pool.
    pub fn build(self) -> Result<MarkPool, MarkError> {
        if self.global_capacity == 0 {
            return Err(MarkError::invalid_tuning(
                "the global queue capacity must be at least 1",
            ));
        }
        if self.local_capacity < 2 {
            return Err(MarkError::invalid_tuning(
                "the local deque capacity must be at least 2",
            ));
        }
        if self.max_grab == 0 {
            return Err(MarkError::invalid_tuning("max_grab must be at least 1"));
        }
        if self.max_grab > self.local_capacity {
            return Err(MarkError::invalid_tuning(
                "max_grab cannot exceed the local deque capacity",
            ));
        }
        let low_water = self.low_water.unwrap_or(self.global_capacity / 4);
        if low_water > self.global_capacity {
            return Err(MarkError::invalid_tuning(
                "the low-water level cannot exceed the global queue capacity",
            ));
        }
        let num_threads = match self.num_threads {
            0 => default_num_threads(),
            n => n,
        };
        Ok(MarkPool {
            num_threads,
            mode: self.mode,
            tuning: Tuning {
                global_capacity: self.global_capacity,
                local_capacity: self.local_capacity,
                max_grab: self.max_grab,
                low_water,
            },
            stack_size: self.stack_size,
            bench: self.bench,
        })
    }
}

impl Default for MarkPoolBuilder {
    fn default() -> MarkPoolBuilder {
        MarkPoolBuilder::new()
    }
}

fn default_num_threads() -> usize {
    env::var("PARMARK_NUM_THREADS")
        .ok()
        .and_then(|value| value.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(|| Ord::min(num_cpus::get(), DEFAULT_NUM_THREADS))
}

/// A configured marking engine.
///
/// The pool holds no threads between phases; every
/// [`mark_all`](MarkPool::mark_all) spawns its workers, runs the phase to
/// quiescence, and joins them before returning.
#[derive(Clone, Debug)]
pub struct MarkPool {
    num_threads: usize,
    mode: MarkMode,
    tuning: Tuning,
    stack_size: Option<usize>,
    bench: bool,
}

impl MarkPool {
    /// Returns the number of marking threads a parallel phase will use,
    /// including the initiator.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub(crate) fn tuning(&self) -> &Tuning {
        &self.tuning
    }

    pub(crate) fn stack_size(&self) -> Option<usize> {
        self.stack_size
    }

    /// Runs one complete mark phase over `objspace` in the configured mode.
    ///
    /// Worker 0 runs on the calling thread and performs the root scan
    /// there; see [`ObjectSpace::start_mark`]. On return every object
    /// reachable from the roots has been marked. Panics raised by the
    /// collector's callbacks propagate to the caller after all workers have
    /// been joined.
    pub fn mark_all<S: ObjectSpace>(&self, objspace: &S) -> Result<(), MarkError> {
        if self.bench {
            println!("Nthreads: {}", self.num_threads);
        }
        match self.mode {
            MarkMode::Single => {
                self.mark_single(objspace);
                Ok(())
            }
            MarkMode::Parallel => registry::mark_parallel(self, objspace),
            MarkMode::Dual => {
                self.bench_marker("A");
                let parallel = self.timed("mark_parallel(objspace)", || {
                    registry::mark_parallel(self, objspace)
                });
                self.bench_marker("END");
                parallel?;
                objspace.mark_reset();
                self.bench_marker("B");
                self.timed("start_mark(objspace)", || self.mark_single(objspace));
                self.bench_marker("END");
                Ok(())
            }
            MarkMode::SingleTwice => {
                self.bench_marker("A");
                self.mark_single(objspace);
                self.bench_marker("END");
                objspace.mark_reset();
                self.bench_marker("B");
                self.mark_single(objspace);
                self.bench_marker("END");
                Ok(())
            }
        }
    }

    fn mark_single<S: ObjectSpace>(&self, objspace: &S) {
        let marker = Marker::synchronous(objspace);
        objspace.start_mark(&marker);
    }

    fn timed<R>(&self, label: &str, call: impl FnOnce() -> R) -> R {
        if !self.bench {
            return call();
        }
        let start = Instant::now();
        let result = call();
        let micros = start.elapsed().as_micros();
        println!("{}: {:.3}", label, micros as f64 / 1000.0);
        result
    }

    fn bench_marker(&self, label: &str) {
        if self.bench {
            println!("{}", label);
        }
    }
}

/// Marks `objspace` with the default configuration: parallel mode, default
/// thread count and queue sizes.
///
/// The root scan runs on the calling thread; see
/// [`ObjectSpace::start_mark`].
pub fn mark_all<S: ObjectSpace>(objspace: &S) -> Result<(), MarkError> {
    MarkPoolBuilder::new().build()?.mark_all(objspace)
}
