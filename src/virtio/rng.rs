//! virtio-rng device driver.
//!
//! A single worker keeps a byte pool topped up from the device's one
//! virtqueue; consumers block on the pool. One sleeping lock guards the
//! pool and both condition variables; the worker drops it for the
//! duration of device I/O.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, LazyLock, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::bus::irq::InterruptController;
use crate::bus::pci::PciDevice;
use crate::sched::{lock, CpuTopology, WaitCell};
use crate::virtio::queue::{QueueError, SgList, Virtqueue, VirtqueueFactory};
use crate::virtio::transport::{wait_for_queue, DeviceStatus, TransportError, VirtioTransport};
use crate::virtio::{device_id, VIRTIO_VENDOR_ID};

pub const DEFAULT_POOL_SIZE: usize = 64;

#[derive(Debug)]
pub enum RngError {
    QueueMissing,
    Transport(TransportError),
    Queue(QueueError),
    Spawn(io::Error),
}

impl core::fmt::Display for RngError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::QueueMissing => write!(f, "device exposes no request queue"),
            Self::Transport(err) => write!(f, "transport: {err}"),
            Self::Queue(err) => write!(f, "virtqueue: {err}"),
            Self::Spawn(err) => write!(f, "spawning refill worker: {err}"),
        }
    }
}

impl From<TransportError> for RngError {
    fn from(value: TransportError) -> Self {
        Self::Transport(value)
    }
}

struct Pool {
    entropy: VecDeque<u8>,
    stopping: bool,
}

pub struct Rng {
    transport: Arc<VirtioTransport<Vec<u8>>>,
    queue: Arc<dyn Virtqueue<Vec<u8>>>,
    pool: Mutex<Pool>,
    producer: Condvar,
    consumer: Condvar,
    wait: Arc<WaitCell>,
    pool_size: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Rng {
    /// Driver-probe entry for the transitional rng device id.
    pub fn probe(
        dev: Arc<dyn PciDevice>,
        intc: &Arc<dyn InterruptController>,
        factory: &mut dyn VirtqueueFactory<Vec<u8>>,
        cpus: &Arc<dyn CpuTopology>,
    ) -> Option<Arc<Rng>> {
        if dev.vendor_id() != VIRTIO_VENDOR_ID || dev.device_id() != device_id::RNG {
            return None;
        }
        match Rng::attach(dev, intc, factory, cpus, DEFAULT_POOL_SIZE) {
            Ok(rng) => Some(rng),
            Err(err) => {
                log::error!(target: "virtio-rng", "attach failed: {err}");
                None
            }
        }
    }

    pub fn attach(
        dev: Arc<dyn PciDevice>,
        intc: &Arc<dyn InterruptController>,
        factory: &mut dyn VirtqueueFactory<Vec<u8>>,
        cpus: &Arc<dyn CpuTopology>,
        pool_size: usize,
    ) -> Result<Arc<Rng>, RngError> {
        let mut transport = VirtioTransport::attach(dev)?;
        transport.setup_features(VirtioTransport::<Vec<u8>>::base_driver_features());

        if let Err(err) = transport.probe_virt_queues(factory, 2 * cpus.count()) {
            transport.fail();
            return Err(err.into());
        }
        let queue = transport.get_virt_queue(0).ok_or_else(|| {
            transport.fail();
            RngError::QueueMissing
        })?;

        let rng = Arc::new(Rng {
            transport: Arc::new(transport),
            queue,
            pool: Mutex::new(Pool {
                entropy: VecDeque::with_capacity(pool_size),
                stopping: false,
            }),
            producer: Condvar::new(),
            consumer: Condvar::new(),
            wait: Arc::new(WaitCell::new()),
            pool_size,
            worker: Mutex::new(None),
        });

        // Legacy line only: the lone queue does not rate an MSI-X table.
        let transport_ref = rng.transport.clone();
        let wake = rng.wait.clone();
        intc.register_legacy(
            rng.transport.pci_device().interrupt_line(),
            Box::new(move || transport_ref.read_isr() != 0),
            Box::new(move || wake.wake()),
        );

        rng.transport.add_status(DeviceStatus::DRIVER_OK);

        let this = rng.clone();
        let handle = cpus
            .spawn("virtio-rng", Box::new(move || this.worker()))
            .map_err(RngError::Spawn)?;
        *lock(&rng.worker) = Some(handle);

        register_source(rng.clone());
        Ok(rng)
    }

    /// Copy up to `out.len()` bytes from the head of the pool, blocking
    /// while it is empty. Returns the count actually copied; zero only
    /// after [`Rng::stop`].
    pub fn get_random_bytes(&self, out: &mut [u8]) -> usize {
        let mut pool = lock(&self.pool);
        loop {
            if !pool.entropy.is_empty() {
                break;
            }
            if pool.stopping {
                return 0;
            }
            pool = self
                .consumer
                .wait(pool)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let count = pool.entropy.len().min(out.len());
        for (slot, byte) in out.iter_mut().zip(pool.entropy.drain(..count)) {
            *slot = byte;
        }
        self.producer.notify_one();
        count
    }

    fn stopping(&self) -> bool {
        lock(&self.pool).stopping
    }

    fn worker(&self) {
        loop {
            let remaining;
            {
                let mut pool = lock(&self.pool);
                loop {
                    if pool.stopping {
                        return;
                    }
                    if pool.entropy.len() < self.pool_size {
                        break;
                    }
                    pool = self
                        .producer
                        .wait(pool)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                remaining = self.pool_size - pool.entropy.len();
            }

            // Device I/O happens with the pool unlocked.
            let Some(bytes) = self.refill(remaining) else {
                return;
            };

            let mut pool = lock(&self.pool);
            pool.entropy.extend(bytes);
            self.consumer.notify_all();
        }
    }

    /// One refill round trip: post a `remaining`-byte in-buffer, kick,
    /// wait for the completion and hand back exactly the bytes the host
    /// reported written. `None` means teardown interrupted the wait.
    fn refill(&self, remaining: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; remaining];
        let mut sg = SgList::new();
        sg.add_in(remaining);

        loop {
            match self.queue.add_buf(&sg, buf) {
                Ok(()) => break,
                Err(rejected) => {
                    buf = rejected.token;
                    // Ring full of stale completions: reclaim and retry.
                    wait_for_queue(&*self.queue, &self.wait, |q| {
                        self.stopping() || q.used_ring_can_gc()
                    });
                    if self.stopping() {
                        return None;
                    }
                    self.queue.get_buf_gc();
                }
            }
        }

        self.transport.kick(0);

        wait_for_queue(&*self.queue, &self.wait, |q| {
            self.stopping() || q.used_ring_not_empty()
        });
        if self.stopping() {
            return None;
        }

        let completion = self.queue.get_buf_elem()?;
        self.queue.get_buf_finalize();

        let mut bytes = completion.token;
        bytes.truncate(completion.len as usize);
        Some(bytes)
    }

    /// Tear down: release blocked callers and the worker, then reset the
    /// device. `get_random_bytes` returns 0 from here on.
    pub fn stop(&self) {
        {
            let mut pool = lock(&self.pool);
            pool.stopping = true;
            self.producer.notify_all();
            self.consumer.notify_all();
        }
        self.wait.wake();
        if let Some(handle) = lock(&self.worker).take() {
            let _ = handle.join();
        }
        self.transport.reset();
    }
}

static SOURCES: LazyLock<Mutex<Vec<Arc<Rng>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Register an attached device with the entropy-source registry.
pub fn register_source(source: Arc<Rng>) {
    lock(&SOURCES).push(source);
}

pub fn with_sources<R>(f: impl FnOnce(&[Arc<Rng>]) -> R) -> R {
    f(&lock(&SOURCES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtio::mock::{FixedCpus, MockFactory, MockIntc, MockPci, MockQueue};
    use std::time::{Duration, Instant};

    struct RngHarness {
        rng: Arc<Rng>,
        pci: Arc<MockPci>,
        intc: Arc<MockIntc>,
        queue: Arc<MockQueue<Vec<u8>>>,
    }

    fn attach_rng(pool_size: usize) -> RngHarness {
        attach_rng_with_factory(pool_size, MockFactory::default())
    }

    fn attach_rng_with_factory(
        pool_size: usize,
        mut factory: MockFactory<Vec<u8>>,
    ) -> RngHarness {
        let pci = MockPci::builder()
            .device_id(device_id::RNG)
            .queue_sizes(&[4])
            .build();
        let intc = MockIntc::new();
        let cpus: Arc<dyn CpuTopology> = FixedCpus::new(1);
        let intc_dyn: Arc<dyn InterruptController> = intc.clone();
        let rng = Rng::attach(pci.clone(), &intc_dyn, &mut factory, &cpus, pool_size)
            .expect("rng attach");
        let queue = factory.queue(0);
        RngHarness {
            rng,
            pci,
            intc,
            queue,
        }
    }

    fn wait_until(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    /// Let the "host" answer the worker's outstanding request with
    /// `pattern` bytes and deliver the interrupt.
    fn pump(h: &RngHarness, pattern: u8) {
        assert!(
            wait_until(Duration::from_secs(2), || h.queue.in_flight() > 0),
            "worker never posted a buffer"
        );
        assert!(h.queue.complete_in_flight_with(|buf| {
            buf.fill(pattern);
            buf.len() as u32
        }));
        h.pci.push_isr(0x01);
        assert!(h.intc.fire_legacy());
    }

    #[test]
    fn attach_reaches_driver_ok_and_registers_source() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        assert_eq!(
            h.pci.regs().status,
            (DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::DRIVER_OK).bits()
        );
        assert!(with_sources(|sources| sources
            .iter()
            .any(|s| Arc::ptr_eq(s, &h.rng))));
        h.rng.stop();
    }

    #[test]
    fn get_random_bytes_returns_device_bytes() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        pump(&h, 0xa5);

        let mut out = [0u8; 32];
        let n = h.rng.get_random_bytes(&mut out);
        assert_eq!(n, 32);
        assert!(out.iter().all(|b| *b == 0xa5));
        h.rng.stop();
    }

    #[test]
    fn reads_never_exceed_request_or_pool() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        pump(&h, 0x42);

        let mut out = [0u8; 16];
        assert_eq!(h.rng.get_random_bytes(&mut out), 16);

        // 48 bytes left; the top-up is still waiting for the host.
        let mut big = [0u8; 128];
        let n = h.rng.get_random_bytes(&mut big);
        assert_eq!(n, 48);
        assert!(big[..n].iter().all(|b| *b == 0x42));
        h.rng.stop();
    }

    #[test]
    fn consumer_blocks_until_pool_fills() {
        let h = attach_rng(DEFAULT_POOL_SIZE);

        let rng = h.rng.clone();
        let reader = std::thread::spawn(move || {
            let mut out = [0u8; 8];
            let n = rng.get_random_bytes(&mut out);
            (n, out)
        });

        // The reader cannot finish before the device answers.
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        pump(&h, 0x55);
        let (n, out) = reader.join().expect("reader join");
        assert_eq!(n, 8);
        assert!(out.iter().all(|b| *b == 0x55));
        h.rng.stop();
    }

    #[test]
    fn worker_tops_pool_back_up_after_a_drain() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        pump(&h, 0x11);

        let mut out = [0u8; 40];
        assert_eq!(h.rng.get_random_bytes(&mut out), 40);

        // The worker asks for exactly the missing bytes.
        assert!(
            wait_until(Duration::from_secs(2), || h.queue.in_flight() > 0),
            "no top-up request"
        );
        assert!(h.queue.complete_in_flight_with(|buf| {
            assert_eq!(buf.len(), 40);
            buf.fill(0x22);
            buf.len() as u32
        }));
        h.pci.push_isr(0x01);
        assert!(h.intc.fire_legacy());

        // 24 leftover bytes plus the 40-byte top-up drain out, never more
        // than the pool size at a time.
        let mut topped_up = 0;
        for _ in 0..8 {
            let mut probe = [0u8; 128];
            let n = h.rng.get_random_bytes(&mut probe);
            assert!(n <= DEFAULT_POOL_SIZE);
            topped_up += probe[..n].iter().filter(|b| **b == 0x22).count();
            if topped_up >= 40 {
                break;
            }
        }
        assert_eq!(topped_up, 40);
        h.rng.stop();
    }

    #[test]
    fn partial_device_writes_are_respected() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        assert!(
            wait_until(Duration::from_secs(2), || h.queue.in_flight() > 0),
            "worker never posted a buffer"
        );
        // Host writes only 10 of the requested 64 bytes.
        assert!(h.queue.complete_in_flight_with(|buf| {
            buf[..10].fill(0x77);
            10
        }));
        h.pci.push_isr(0x01);
        assert!(h.intc.fire_legacy());

        let mut out = [0u8; 64];
        let n = h.rng.get_random_bytes(&mut out);
        assert_eq!(n, 10);
        assert!(out[..10].iter().all(|b| *b == 0x77));
        h.rng.stop();
    }

    #[test]
    fn rejected_refill_reclaims_completions_and_retries() {
        // One descriptor total, so an unreclaimed completion blocks the
        // next post.
        let h = attach_rng_with_factory(DEFAULT_POOL_SIZE, MockFactory::with_ring_capacity(1));
        pump(&h, 0x33);

        // Wait for the worker to release the descriptor, then occupy it
        // with a completed entry nobody has reclaimed yet.
        assert!(
            wait_until(Duration::from_secs(2), || h.queue.free_descs() == 1),
            "descriptor never came back"
        );
        let mut sg = SgList::new();
        sg.add_in(1);
        assert!(h.queue.add_buf(&sg, vec![0u8; 1]).is_ok());
        assert!(h.queue.complete_in_flight(0));

        // Draining the pool triggers a refill whose add_buf is rejected;
        // the worker must reclaim the stale entry and carry on instead of
        // sleeping with the queue interrupt masked.
        let mut out = [0u8; 64];
        assert_eq!(h.rng.get_random_bytes(&mut out), 64);
        assert!(out.iter().all(|b| *b == 0x33));

        pump(&h, 0x5a);
        assert_eq!(h.rng.get_random_bytes(&mut out), 64);
        assert!(out.iter().all(|b| *b == 0x5a));
        assert!(h.queue.gc_dropped() >= 1);
        h.rng.stop();
    }

    #[test]
    fn stop_releases_consumers_with_zero() {
        let h = attach_rng(DEFAULT_POOL_SIZE);

        let rng = h.rng.clone();
        let reader = std::thread::spawn(move || {
            let mut out = [0u8; 8];
            rng.get_random_bytes(&mut out)
        });
        std::thread::sleep(Duration::from_millis(20));

        h.rng.stop();
        assert_eq!(reader.join().expect("reader join"), 0);
        assert_eq!(h.pci.regs().status, 0);

        let mut out = [0u8; 8];
        assert_eq!(h.rng.get_random_bytes(&mut out), 0);
    }

    #[test]
    fn spurious_legacy_interrupt_is_not_claimed() {
        let h = attach_rng(DEFAULT_POOL_SIZE);
        // Empty ISR script reads as zero.
        assert!(!h.intc.fire_legacy());
        h.rng.stop();
    }
}
