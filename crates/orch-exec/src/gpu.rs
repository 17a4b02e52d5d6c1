//! Process-level GPU mutual exclusion: smallest-available-index allocation
//! per worker, backed by an `nvidia-smi` probe with a `CUDA_VISIBLE_DEVICES`
//! fallback. Disabled (acquire always succeeds with no assignment) on
//! CPU-only hosts.

use std::collections::BTreeSet;
use std::process::Command;
use std::sync::Mutex;

use dashmap::DashMap;
use orch_core::{Error, Result};

/// Registry of GPU assignments, shared across the worker pool. Acquiring a
/// GPU for a worker id that already holds one returns the same index.
pub struct GpuAllocator {
    total: usize,
    available: Mutex<BTreeSet<usize>>,
    assignments: DashMap<String, usize>,
}

impl GpuAllocator {
    pub fn new(gpu_count: usize) -> Self {
        Self {
            total: gpu_count,
            available: Mutex::new((0..gpu_count).collect()),
            assignments: DashMap::new(),
        }
    }

    /// Probe the host for GPUs and build an allocator clamped so it can never
    /// hand out more indices than `max_workers`.
    pub fn probe(max_workers: usize) -> Self {
        let detected = detect_gpu_count();
        let usable = detected.min(max_workers);
        Self::new(usable)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_enabled(&self) -> bool {
        self.total > 0
    }

    /// Assign the lowest free GPU index to `worker_id`. Returns `None` when
    /// the allocator is disabled (no GPUs on this host).
    pub fn acquire(&self, worker_id: &str) -> Result<Option<usize>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        if let Some(existing) = self.assignments.get(worker_id) {
            return Ok(Some(*existing));
        }
        let mut available = self.available.lock().unwrap();
        let gpu_id = *available
            .iter()
            .next()
            .ok_or_else(|| Error::no_gpus_available(worker_id))?;
        available.remove(&gpu_id);
        self.assignments.insert(worker_id.to_string(), gpu_id);
        Ok(Some(gpu_id))
    }

    pub fn release(&self, worker_id: &str) {
        if let Some((_, gpu_id)) = self.assignments.remove(worker_id) {
            self.available.lock().unwrap().insert(gpu_id);
        }
    }

    pub fn assigned_to(&self, worker_id: &str) -> Option<usize> {
        self.assignments.get(worker_id).map(|v| *v)
    }
}

fn detect_gpu_count() -> usize {
    match Command::new("nvidia-smi")
        .args(["--query-gpu=gpu_name", "--format=csv,noheader"])
        .output()
    {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            stdout.lines().filter(|l| !l.trim().is_empty()).count()
        }
        _ => std::env::var("CUDA_VISIBLE_DEVICES")
            .ok()
            .map(|val| {
                val.split(',')
                    .filter(|d| !d.is_empty() && *d != "-1")
                    .count()
            })
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_assigns_lowest_free_index() {
        let allocator = GpuAllocator::new(2);
        assert_eq!(allocator.acquire("w0").unwrap(), Some(0));
        assert_eq!(allocator.acquire("w1").unwrap(), Some(1));
        assert!(allocator.acquire("w2").is_err());
    }

    #[test]
    fn release_frees_the_index_for_reuse() {
        let allocator = GpuAllocator::new(1);
        assert_eq!(allocator.acquire("w0").unwrap(), Some(0));
        allocator.release("w0");
        assert_eq!(allocator.acquire("w1").unwrap(), Some(0));
    }

    #[test]
    fn repeated_acquire_by_same_worker_is_idempotent() {
        let allocator = GpuAllocator::new(2);
        assert_eq!(allocator.acquire("w0").unwrap(), Some(0));
        assert_eq!(allocator.acquire("w0").unwrap(), Some(0));
    }

    #[test]
    fn disabled_allocator_always_returns_none() {
        let allocator = GpuAllocator::new(0);
        assert_eq!(allocator.acquire("w0").unwrap(), None);
        assert!(!allocator.is_enabled());
    }
}
