//! Per-worker capacity counters
//!
//! Owned by the tracker task of the lifecycle bus, which is the only caller.
//! Admission check and increment are one call so no two jobs can take the
//! last slot of a worker.

use std::collections::HashMap;

#[derive(Debug)]
pub struct AdmissionController {
    max_per_worker: usize,
    counters: HashMap<String, usize>,
}

impl AdmissionController {
    pub fn new(max_per_worker: usize) -> Self {
        Self {
            max_per_worker,
            counters: HashMap::new(),
        }
    }

    /// Takes a slot on `worker` if one is free
    pub fn try_admit(&mut self, worker: &str) -> bool {
        let count = self.counters.entry(worker.to_string()).or_insert(0);
        if *count < self.max_per_worker {
            *count += 1;
            true
        } else {
            false
        }
    }

    /// Takes a slot regardless of capacity, for jobs that already run
    pub fn register(&mut self, worker: &str) {
        *self.counters.entry(worker.to_string()).or_insert(0) += 1;
    }

    /// Frees a slot, never going below zero
    pub fn release(&mut self, worker: &str) {
        if let Some(count) = self.counters.get_mut(worker) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counters.remove(worker);
            }
        }
    }

    pub fn count(&self, worker: &str) -> usize {
        self.counters.get(worker).copied().unwrap_or(0)
    }

    /// Workers without a free slot, sorted
    pub fn saturated(&self) -> Vec<String> {
        let mut workers: Vec<String> = self
            .counters
            .iter()
            .filter(|(_, count)| **count >= self.max_per_worker)
            .map(|(worker, _)| worker.clone())
            .collect();
        workers.sort();
        workers
    }

    pub fn counters(&self) -> HashMap<String, usize> {
        self.counters.clone()
    }
}
