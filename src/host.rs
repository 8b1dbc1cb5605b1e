//! Host kernel services required by the core
//!
//! Everything the interpreter needs from its embedder goes through [`Host`]:
//! raw address-space accessors, timekeeping, thread identity, and a deferred
//! work queue. The in-memory [`MemoryHost`] backs the test suite the same
//! way firmware-free unit tests run against sparse fake memory.

use crate::error::AmlError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use core::fmt;

/// PCI configuration-space address of a single function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PciAddress {
    /// PCI segment group.
    pub segment: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number.
    pub device: u8,
    /// Function number.
    pub function: u8,
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// Deferred work item executed on a host worker thread.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Services the embedding kernel provides to the core.
///
/// Width parameters are byte counts and are always 1, 2, 4, or 8. All
/// methods may be called concurrently from multiple threads.
pub trait Host: Send + Sync {
    /// Read `width` bytes from physical memory as a little-endian value.
    fn mem_read(&self, phys: u64, width: usize) -> Result<u64, AmlError>;

    /// Write `width` bytes of a little-endian value to physical memory.
    fn mem_write(&self, phys: u64, width: usize, value: u64) -> Result<(), AmlError>;

    /// Copy a physical memory range, used to take table images.
    fn read_physical(&self, phys: u64, out: &mut [u8]) -> Result<(), AmlError>;

    /// Read from an I/O port.
    fn io_read(&self, port: u64, width: usize) -> Result<u64, AmlError>;

    /// Write to an I/O port.
    fn io_write(&self, port: u64, width: usize, value: u64) -> Result<(), AmlError>;

    /// Read PCI configuration space at `offset`.
    fn pci_read(&self, addr: PciAddress, offset: u16, width: usize) -> Result<u64, AmlError>;

    /// Write PCI configuration space at `offset`.
    fn pci_write(
        &self,
        addr: PciAddress,
        offset: u16,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError>;

    /// Monotonic timestamp in 100ns units.
    fn now_100ns(&self) -> u64;

    /// Blocking sleep with millisecond granularity; a suspension point.
    fn sleep_ms(&self, ms: u64);

    /// Busy-wait with microsecond granularity; not a suspension point.
    fn stall_us(&self, us: u64);

    /// Stable identifier of the calling thread.
    fn thread_id(&self) -> u64;

    /// Queue `work` for execution outside the current call stack.
    fn queue_work(&self, work: WorkItem) -> Result<(), AmlError>;

    /// AML executed `Fatal`; the host decides what to do with the machine.
    fn handle_fatal(&self, _typ: u8, _code: u32, _arg: u64) {}

    /// The global lock was released while firmware had the pending bit set;
    /// the host should ring the firmware doorbell (GBL_RLS).
    fn global_lock_pending_released(&self) {}
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

std::thread_local! {
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

/// Process-local stable thread id, usable by any [`Host`] implementation.
pub fn current_thread_id() -> u64 {
    THREAD_ID.with(|id| *id)
}

#[derive(Debug, Default)]
struct SparseSpace {
    bytes: HashMap<u64, u8>,
}

impl SparseSpace {
    fn read(&self, addr: u64, width: usize) -> u64 {
        let mut value = 0u64;
        for i in 0..width {
            let byte = self
                .bytes
                .get(&addr.wrapping_add(i as u64))
                .copied()
                .unwrap_or(0);
            value |= (byte as u64) << (8 * i);
        }
        value
    }

    fn write(&mut self, addr: u64, width: usize, value: u64) {
        for i in 0..width {
            self.bytes
                .insert(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }
}

/// In-memory host: sparse fake physical memory, I/O space, and PCI space.
///
/// Deferred work runs inline, which keeps tests deterministic. Time advances
/// with the real clock.
#[derive(Debug)]
pub struct MemoryHost {
    mem: Mutex<SparseSpace>,
    io: Mutex<SparseSpace>,
    pci: Mutex<HashMap<(PciAddress, u16), u8>>,
    epoch: Instant,
    fatals: Mutex<Vec<(u8, u32, u64)>>,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self {
            mem: Mutex::new(SparseSpace::default()),
            io: Mutex::new(SparseSpace::default()),
            pci: Mutex::new(HashMap::new()),
            epoch: Instant::now(),
            fatals: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryHost {
    /// Fresh host with empty address spaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload bytes into fake physical memory.
    pub fn load_memory(&self, phys: u64, bytes: &[u8]) {
        let mut mem = lock(&self.mem);
        for (i, byte) in bytes.iter().enumerate() {
            mem.bytes.insert(phys + i as u64, *byte);
        }
    }

    /// Read back fake physical memory for assertions.
    pub fn memory_at(&self, phys: u64, width: usize) -> u64 {
        lock(&self.mem).read(phys, width)
    }

    /// Read back fake I/O space for assertions.
    pub fn io_at(&self, port: u64, width: usize) -> u64 {
        lock(&self.io).read(port, width)
    }

    /// `Fatal` invocations observed so far, in order.
    pub fn fatals(&self) -> Vec<(u8, u32, u64)> {
        lock(&self.fatals).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn check_width(width: usize) -> Result<(), AmlError> {
    match width {
        1 | 2 | 4 | 8 => Ok(()),
        _ => Err(AmlError::InvalidArgument("access width")),
    }
}

impl Host for MemoryHost {
    fn mem_read(&self, phys: u64, width: usize) -> Result<u64, AmlError> {
        check_width(width)?;
        Ok(lock(&self.mem).read(phys, width))
    }

    fn mem_write(&self, phys: u64, width: usize, value: u64) -> Result<(), AmlError> {
        check_width(width)?;
        lock(&self.mem).write(phys, width, value);
        Ok(())
    }

    fn read_physical(&self, phys: u64, out: &mut [u8]) -> Result<(), AmlError> {
        let mem = lock(&self.mem);
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = mem.bytes.get(&(phys + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn io_read(&self, port: u64, width: usize) -> Result<u64, AmlError> {
        check_width(width)?;
        Ok(lock(&self.io).read(port, width))
    }

    fn io_write(&self, port: u64, width: usize, value: u64) -> Result<(), AmlError> {
        check_width(width)?;
        lock(&self.io).write(port, width, value);
        Ok(())
    }

    fn pci_read(&self, addr: PciAddress, offset: u16, width: usize) -> Result<u64, AmlError> {
        check_width(width)?;
        let pci = lock(&self.pci);
        let mut value = 0u64;
        for i in 0..width {
            let byte = pci
                .get(&(addr, offset.wrapping_add(i as u16)))
                .copied()
                .unwrap_or(0);
            value |= (byte as u64) << (8 * i);
        }
        Ok(value)
    }

    fn pci_write(
        &self,
        addr: PciAddress,
        offset: u16,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        check_width(width)?;
        let mut pci = lock(&self.pci);
        for i in 0..width {
            pci.insert(
                (addr, offset.wrapping_add(i as u16)),
                (value >> (8 * i)) as u8,
            );
        }
        Ok(())
    }

    fn now_100ns(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() / 100) as u64
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms));
    }

    fn stall_us(&self, us: u64) {
        let deadline = Instant::now() + std::time::Duration::from_micros(us);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    fn thread_id(&self) -> u64 {
        current_thread_id()
    }

    fn queue_work(&self, work: WorkItem) -> Result<(), AmlError> {
        work();
        Ok(())
    }

    fn handle_fatal(&self, typ: u8, code: u32, arg: u64) {
        lock(&self.fatals).push((typ, code, arg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_memory_is_little_endian() {
        let host = MemoryHost::new();
        host.mem_write(0x1000, 4, 0x1122_3344).unwrap();
        assert_eq!(host.mem_read(0x1000, 1).unwrap(), 0x44);
        assert_eq!(host.mem_read(0x1003, 1).unwrap(), 0x11);
        assert_eq!(host.mem_read(0x1000, 2).unwrap(), 0x3344);
    }

    #[test]
    fn unwritten_memory_reads_zero() {
        let host = MemoryHost::new();
        assert_eq!(host.mem_read(0xdead_0000, 8).unwrap(), 0);
    }

    #[test]
    fn bad_width_is_rejected() {
        let host = MemoryHost::new();
        assert!(host.mem_read(0, 3).is_err());
        assert!(host.io_write(0, 0, 1).is_err());
    }

    #[test]
    fn pci_space_is_per_function() {
        let host = MemoryHost::new();
        let a = PciAddress {
            segment: 0,
            bus: 0,
            device: 3,
            function: 0,
        };
        let b = PciAddress { function: 1, ..a };
        host.pci_write(a, 0x40, 2, 0xbeef).unwrap();
        assert_eq!(host.pci_read(a, 0x40, 2).unwrap(), 0xbeef);
        assert_eq!(host.pci_read(b, 0x40, 2).unwrap(), 0);
    }

    #[test]
    fn thread_ids_are_stable_and_distinct() {
        let host = MemoryHost::new();
        let mine = host.thread_id();
        assert_eq!(mine, host.thread_id());
        let other = std::thread::spawn(current_thread_id).join().unwrap();
        assert_ne!(mine, other);
    }
}
