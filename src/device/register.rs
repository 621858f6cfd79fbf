//! Register arrays backing stateful ALUs.
//!
//! A register array is an indexed sequence of fixed-width cells. It is owned
//! by the pipeline and shared by reference (`Arc<RegisterArray>`) with every
//! stateful ALU bound to it and with the group membership manager, if any.
//!
//! All access goes through [`RegisterArray::lock`], which returns an
//! exclusive [`RegisterGuard`]. The guard is the only way to read or write a
//! cell, so a caller that needs a read-modify-write holds the guard for the
//! whole sequence.
//!
//! # Change notification
//!
//! Consumers may register notifiers that fire on every cell write. Notifiers
//! run while the array lock is held, so they must not try to lock the array
//! again. Registration hands back a [`NotifierId`]; a consumer that goes away
//! before the array passes it to [`RegisterArray::unregister_notifier`].

use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Widest supported register cell.
pub const MAX_REGISTER_BITWIDTH: usize = 64;

/// Callback fired with the index of a cell that was just written.
pub type Notifier = Box<dyn Fn(usize) + Send + Sync>;

/// Handle identifying a registered notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

/// Mask covering the low `bitwidth` bits.
#[inline]
pub fn width_mask(bitwidth: usize) -> u64 {
    if bitwidth >= 64 {
        u64::MAX
    } else {
        (1u64 << bitwidth) - 1
    }
}

/// An indexed, fixed-width, lock-guarded register array.
pub struct RegisterArray {
    name: String,
    size: usize,
    bitwidth: usize,
    mask: u64,
    cells: Mutex<Vec<u64>>,
    notifiers: RwLock<Vec<(NotifierId, Notifier)>>,
    next_notifier: AtomicU64,
}

impl RegisterArray {
    /// Create a zero-filled array of `size` cells, each `bitwidth` bits wide.
    ///
    /// `bitwidth` is clamped to `1..=MAX_REGISTER_BITWIDTH`.
    pub fn new(name: impl Into<String>, size: usize, bitwidth: usize) -> Self {
        let bitwidth = bitwidth.clamp(1, MAX_REGISTER_BITWIDTH);
        Self {
            name: name.into(),
            size,
            bitwidth,
            mask: width_mask(bitwidth),
            cells: Mutex::new(vec![0; size]),
            notifiers: RwLock::new(Vec::new()),
            next_notifier: AtomicU64::new(0),
        }
    }

    /// Array name as declared in the program.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of cells. Does not take the lock.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Cell width in bits.
    pub fn bitwidth(&self) -> usize {
        self.bitwidth
    }

    /// Acquire the exclusive lock.
    pub fn lock(&self) -> RegisterGuard<'_> {
        RegisterGuard {
            array: self,
            cells: self.cells.lock(),
        }
    }

    /// Register a callback fired on every cell write.
    pub fn register_notifier<F>(&self, notifier: F) -> NotifierId
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let id = NotifierId(self.next_notifier.fetch_add(1, Ordering::Relaxed));
        self.notifiers.write().push((id, Box::new(notifier)));
        id
    }

    /// Drop a callback. Returns false if `id` was not registered.
    ///
    /// Must not be called from inside a notifier.
    pub fn unregister_notifier(&self, id: NotifierId) -> bool {
        let mut notifiers = self.notifiers.write();
        let before = notifiers.len();
        notifiers.retain(|(nid, _)| *nid != id);
        notifiers.len() != before
    }

    /// Number of registered callbacks.
    pub fn notifier_count(&self) -> usize {
        self.notifiers.read().len()
    }

    /// Copy of all cell values, read under the lock.
    pub fn snapshot(&self) -> Vec<u64> {
        self.lock().cells.to_vec()
    }

    fn notify(&self, index: usize) {
        for (_, notifier) in self.notifiers.read().iter() {
            notifier(index);
        }
    }
}

impl fmt::Debug for RegisterArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells = self.cells.lock();
        // Only show non-zero cells
        let non_zero: Vec<_> = cells
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != 0)
            .collect();

        write!(f, "RegisterArray {{ {}[{}] x {}b", self.name, cells.len(), self.bitwidth)?;
        if non_zero.is_empty() {
            return write!(f, ", all zero }}");
        }
        write!(f, ": ")?;
        for (i, (index, value)) in non_zero.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{}]=0x{:X}", index, value)?;
        }
        write!(f, " }}")
    }
}

/// Exclusive access to a register array.
///
/// Dropping the guard releases the lock.
pub struct RegisterGuard<'a> {
    array: &'a RegisterArray,
    cells: MutexGuard<'a, Vec<u64>>,
}

impl RegisterGuard<'_> {
    /// Number of cells.
    #[inline]
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    /// Cell width in bits.
    #[inline]
    pub fn bitwidth(&self) -> usize {
        self.array.bitwidth
    }

    /// Read a cell.
    ///
    /// # Panics
    ///
    /// Panics if `index >= size()`; callers bound-check first.
    #[inline]
    pub fn at(&self, index: usize) -> u64 {
        self.cells[index]
    }

    /// Write a cell, truncating `value` to the array's bitwidth, then fire
    /// the change notifiers.
    ///
    /// # Panics
    ///
    /// Panics if `index >= size()`; callers bound-check first.
    pub fn set(&mut self, index: usize, value: u64) {
        self.cells[index] = value & self.array.mask;
        self.array.notify(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_width_mask() {
        assert_eq!(width_mask(1), 1);
        assert_eq!(width_mask(8), 0xFF);
        assert_eq!(width_mask(32), 0xFFFF_FFFF);
        assert_eq!(width_mask(64), u64::MAX);
    }

    #[test]
    fn test_set_truncates_to_bitwidth() {
        let reg = RegisterArray::new("r", 4, 8);
        let mut guard = reg.lock();
        guard.set(2, 0x1FF);
        assert_eq!(guard.at(2), 0xFF);
        assert_eq!(guard.at(0), 0);
    }

    #[test]
    fn test_notifier_fires_on_write() {
        let reg = RegisterArray::new("r", 4, 32);
        let count = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(AtomicUsize::new(usize::MAX));
        {
            let count = count.clone();
            let last = last.clone();
            reg.register_notifier(move |index| {
                count.fetch_add(1, Ordering::SeqCst);
                last.store(index, Ordering::SeqCst);
            });
        }

        reg.lock().set(3, 7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(last.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_unregistered_notifier_stops_firing() {
        let reg = RegisterArray::new("r", 2, 8);
        let count = Arc::new(AtomicUsize::new(0));
        let ids: Vec<_> = (0..2)
            .map(|_| {
                let count = count.clone();
                reg.register_notifier(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        assert_ne!(ids[0], ids[1]);
        assert_eq!(reg.notifier_count(), 2);

        reg.lock().set(0, 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(reg.unregister_notifier(ids[0]));
        assert!(!reg.unregister_notifier(ids[0]));
        assert_eq!(reg.notifier_count(), 1);
        reg.lock().set(1, 1);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_snapshot_and_debug() {
        let reg = RegisterArray::new("counters", 3, 16);
        assert!(format!("{:?}", reg).contains("all zero"));
        reg.lock().set(1, 0xAB);
        assert_eq!(reg.snapshot(), vec![0, 0xAB, 0]);
        assert!(format!("{:?}", reg).contains("[1]=0xAB"));
    }
}
