//! A synthetic heap used by the integration tests: adjacency lists for
//! edges, an atomic mark bit per object, and a visit counter that only the
//! winner of the mark bit bumps.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use parmark::{Marker, ObjectRef, ObjectSpace};
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

pub struct GraphHeap {
    edges: Vec<Vec<usize>>,
    roots: Vec<usize>,
    marks: Vec<AtomicBool>,
    visits: Vec<AtomicUsize>,
}

impl GraphHeap {
    pub fn new(edges: Vec<Vec<usize>>, roots: Vec<usize>) -> GraphHeap {
        let len = edges.len();
        GraphHeap {
            edges,
            roots,
            marks: (0..len).map(|_| AtomicBool::new(false)).collect(),
            visits: (0..len).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    /// `0 -> 1 -> ... -> len-1`, rooted at 0.
    pub fn chain(len: usize) -> GraphHeap {
        let edges = (0..len)
            .map(|i| if i + 1 < len { vec![i + 1] } else { vec![] })
            .collect();
        GraphHeap::new(edges, vec![0])
    }

    /// `0 -> {1, 2}`, `1 -> 3`, `2 -> 3`.
    pub fn diamond() -> GraphHeap {
        GraphHeap::new(vec![vec![1, 2], vec![3], vec![3], vec![]], vec![0])
    }

    /// One root fanning out into `count` disjoint chains of `len` objects
    /// each.
    pub fn disjoint_chains(count: usize, len: usize) -> GraphHeap {
        assert!(len >= 1);
        let total = 1 + count * len;
        let mut edges = vec![Vec::new(); total];
        for chain in 0..count {
            let first = 1 + chain * len;
            edges[0].push(first);
            for i in 0..len - 1 {
                edges[first + i].push(first + i + 1);
            }
        }
        GraphHeap::new(edges, vec![0])
    }

    /// One root pointing at `leaves` leaf objects.
    pub fn star(leaves: usize) -> GraphHeap {
        let mut edges = vec![Vec::new(); leaves + 1];
        edges[0] = (1..=leaves).collect();
        GraphHeap::new(edges, vec![0])
    }

    /// A seeded random digraph with `edges_per_object` outgoing edges per
    /// object, rooted at 0. Cycles and duplicate edges are expected.
    pub fn random(objects: usize, edges_per_object: usize, seed: u64) -> GraphHeap {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let edges = (0..objects)
            .map(|_| {
                (0..edges_per_object)
                    .map(|_| rng.gen_range(0..objects))
                    .collect()
            })
            .collect();
        GraphHeap::new(edges, vec![0])
    }

    pub fn with_roots(mut self, roots: Vec<usize>) -> GraphHeap {
        self.roots = roots;
        self
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_marked(&self, index: usize) -> bool {
        self.marks[index].load(Ordering::SeqCst)
    }

    pub fn marked_set(&self) -> Vec<bool> {
        self.marks
            .iter()
            .map(|m| m.load(Ordering::SeqCst))
            .collect()
    }

    pub fn marked_count(&self) -> usize {
        self.marks
            .iter()
            .filter(|m| m.load(Ordering::SeqCst))
            .count()
    }

    pub fn visits(&self, index: usize) -> usize {
        self.visits[index].load(Ordering::SeqCst)
    }

    pub fn total_visits(&self) -> usize {
        self.visits.iter().map(|v| v.load(Ordering::SeqCst)).sum()
    }

    /// Reference reachability computed with a plain iterative worklist.
    pub fn expected_marks(&self) -> Vec<bool> {
        let mut reachable = vec![false; self.edges.len()];
        let mut worklist: Vec<usize> = Vec::new();
        for &root in &self.roots {
            if !reachable[root] {
                reachable[root] = true;
                worklist.push(root);
            }
        }
        while let Some(object) = worklist.pop() {
            for &child in &self.edges[object] {
                if !reachable[child] {
                    reachable[child] = true;
                    worklist.push(child);
                }
            }
        }
        reachable
    }

    /// Every reachable object marked and visited exactly once; every
    /// unreachable object untouched.
    pub fn assert_fully_marked(&self) {
        let expected = self.expected_marks();
        for index in 0..self.len() {
            assert_eq!(
                self.is_marked(index),
                expected[index],
                "wrong mark bit on object {}",
                index
            );
            let expected_visits = if expected[index] { 1 } else { 0 };
            assert_eq!(
                self.visits(index),
                expected_visits,
                "object {} visited {} times",
                index,
                self.visits(index)
            );
        }
    }
}

impl ObjectSpace for GraphHeap {
    fn start_mark(&self, marker: &Marker<'_, Self>) {
        for &root in &self.roots {
            marker.mark(ObjectRef::from_usize(root));
        }
    }

    fn mark_object(&self, marker: &Marker<'_, Self>, obj: ObjectRef) {
        let index = obj.as_usize();
        if self.marks[index].swap(true, Ordering::SeqCst) {
            return; // lost the race or delivered twice: nothing to do
        }
        self.visits[index].fetch_add(1, Ordering::SeqCst);
        for &child in &self.edges[index] {
            marker.mark(ObjectRef::from_usize(child));
        }
    }

    fn mark_reset(&self) {
        for mark in &self.marks {
            mark.store(false, Ordering::SeqCst);
        }
        // Visit counters are auxiliary state this heap chooses to reset
        // alongside the bits, so per-phase assertions stay meaningful.
        for visit in &self.visits {
            visit.store(0, Ordering::SeqCst);
        }
    }
}

/// Runs `body` on a thread with a stack large enough for deep synchronous
/// marking recursions.
pub fn with_big_stack<R: Send + 'static>(body: impl FnOnce() -> R + Send + 'static) -> R {
    thread::Builder::new()
        .name("parmark-test-deep".to_owned())
        .stack_size(256 * 1024 * 1024)
        .spawn(body)
        .expect("failed to spawn big-stack test thread")
        .join()
        .expect("big-stack test thread panicked")
}
