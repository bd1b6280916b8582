//! Scheduling seam: CPU topology, pinned worker threads and the
//! wait-for-wake cell used by interrupt-driven polling loops.
//!
//! The drivers only ever need "spawn a worker pinned to CPU k", "block
//! until somebody wakes me" and "wake that worker"; everything else about
//! scheduling stays with the host.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

/// View of the CPUs the drivers may pin workers to.
pub trait CpuTopology: Send + Sync {
    fn count(&self) -> usize;

    /// Identifier of the CPU the calling thread runs on. Only required to
    /// be stable per thread; queue selection keys off it.
    fn current(&self) -> usize;

    /// Spawn a worker with an affinity hint for `cpu`. The hint is
    /// advisory; a host that cannot pin still runs the worker.
    fn spawn_pinned(
        &self,
        cpu: usize,
        name: &str,
        body: Box<dyn FnOnce() + Send>,
    ) -> io::Result<JoinHandle<()>>;

    /// Spawn an unpinned worker.
    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;
}

/// Host-backed topology: `std::thread` workers, thread-id hashing for the
/// current-CPU view.
pub struct HostCpus {
    count: usize,
}

impl HostCpus {
    pub fn new() -> Self {
        let count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { count }
    }
}

impl Default for HostCpus {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTopology for HostCpus {
    fn count(&self) -> usize {
        self.count
    }

    fn current(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.count
    }

    fn spawn_pinned(
        &self,
        _cpu: usize,
        name: &str,
        body: Box<dyn FnOnce() + Send>,
    ) -> io::Result<JoinHandle<()>> {
        self.spawn(name, body)
    }

    fn spawn(&self, name: &str, body: Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new().name(name.into()).spawn(body)
    }
}

/// Wake-up cell shared between a polling worker and its interrupt handler.
///
/// A generation counter closes the wake-before-sleep race: the waiter
/// snapshots the epoch, re-checks its predicate, and only then blocks
/// until the epoch moves. A wake that lands between snapshot and block is
/// never lost.
pub struct WaitCell {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl WaitCell {
    pub fn new() -> Self {
        Self {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        *lock(&self.epoch)
    }

    /// Block until the epoch differs from `seen`.
    pub fn wait_since(&self, seen: u64) {
        let mut guard = lock(&self.epoch);
        while *guard == seen {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wake(&self) {
        let mut guard = lock(&self.epoch);
        *guard = guard.wrapping_add(1);
        self.cond.notify_all();
    }
}

impl Default for WaitCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Poison-immune lock: a panicking worker must not wedge the driver.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_cell_wake_before_sleep_is_not_lost() {
        let cell = WaitCell::new();
        let seen = cell.epoch();
        cell.wake();
        // Would hang forever if the wake had been lost.
        cell.wait_since(seen);
    }

    #[test]
    fn wait_cell_wakes_blocked_thread() {
        let cell = Arc::new(WaitCell::new());
        let woken = Arc::new(AtomicBool::new(false));
        let handle = {
            let cell = cell.clone();
            let woken = woken.clone();
            std::thread::spawn(move || {
                cell.wait_since(cell.epoch());
                woken.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!woken.load(Ordering::SeqCst));
        cell.wake();
        handle.join().expect("waiter join");
        assert!(woken.load(Ordering::SeqCst));
    }

    #[test]
    fn host_cpus_current_is_stable_and_bounded() {
        let cpus = HostCpus::new();
        let a = cpus.current();
        let b = cpus.current();
        assert_eq!(a, b);
        assert!(a < cpus.count());
    }
}
