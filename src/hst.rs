//! This module provides the hash-table store test (HST), the process-wide
//! substrate behind LR/SC reservations and locked compare-and-swap across
//! emulated cores.
//!
//! Every guest address hashes onto one [`StoreTableEntry`]. Publishing a
//! core id at an entry ("set") doubles as both a reservation and an
//! invalidation of other cores' reservations that collide there; the
//! fine-grained per-entry lock serialises multi-step atomic sequences when
//! host intrinsics are unavailable. Colliding addresses are conservatively
//! serialised against each other, which LR/SC permits as an
//! implementation-chosen reservation granularity; the hash is deterministic
//! so the serialisation is stable across a run.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;
use crate::ir::{HelperId, IrBuilder, Temp};

/// Sentinel: the entry's lock is available.
pub const HST_UNLOCKED: u32 = 0xFFFF_FFFF;
/// Sentinel: no core has accessed any address hashing onto the entry.
pub const HST_NO_CORE: u32 = 0xFFFF_FFFF;

/// Entries cover an 8-byte granule, so the low three address bits do not
/// participate in the hash.
const ENTRY_SHIFT: u32 = 3;

/// One store-table entry.
#[derive(Debug)]
pub struct StoreTableEntry {
    /// Id of the core that last wrote to (or reserved) an address hashing
    /// here; [`HST_NO_CORE`] when untouched.
    last_accessed_by_core_id: AtomicU32,
    /// Fine-grained lock: [`HST_UNLOCKED`], or the owning core's id.
    lock: AtomicU32,
}

impl StoreTableEntry {
    fn unused() -> Self {
        Self {
            last_accessed_by_core_id: AtomicU32::new(HST_NO_CORE),
            lock: AtomicU32::new(HST_UNLOCKED),
        }
    }
}

/// The process-wide store table. Allocated once, never resized; shared
/// between cores behind an `Arc`. All fields are atomics, so every method
/// takes `&self`.
#[derive(Debug)]
pub struct StoreTable {
    entries: Box<[StoreTableEntry]>,
    index_mask: u64,
}

impl StoreTable {
    /// Creates a table with `1 << index_bits` entries, each covering an
    /// 8-byte granule of guest addresses.
    pub fn new(index_bits: u8) -> Result<Self, Error> {
        if index_bits == 0 || index_bits > 28 {
            return Err(Error::InvalidStoreTableBits(index_bits));
        }
        let count = 1usize << index_bits;
        let entries = (0..count).map(|_| StoreTableEntry::unused()).collect();
        Ok(Self {
            entries,
            index_mask: (count - 1) as u64,
        })
    }

    /// Re-initialises every entry to the sentinels. Called at process start
    /// and after deserialising emulator state; reservations never survive
    /// either.
    pub fn reset(&self) {
        for entry in self.entries.iter() {
            entry.last_accessed_by_core_id.store(HST_NO_CORE, Ordering::Relaxed);
            entry.lock.store(HST_UNLOCKED, Ordering::Relaxed);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// The entry index a guest address hashes to.
    pub fn index(&self, addr: u64) -> usize {
        ((addr >> ENTRY_SHIFT) & self.index_mask) as usize
    }

    /// Publishes `core_id` at the entry for `addr`. A single atomic store,
    /// so no lock is needed.
    pub fn set(&self, addr: u64, core_id: u32) {
        self.entries[self.index(addr)]
            .last_accessed_by_core_id
            .store(core_id, Ordering::Release);
    }

    /// True iff `core_id` is still the last accessor of the entry for
    /// `addr`, i.e. no other core has written since this core last set it.
    pub fn check(&self, addr: u64, core_id: u32) -> bool {
        self.entries[self.index(addr)]
            .last_accessed_by_core_id
            .load(Ordering::Acquire)
            == core_id
    }

    /// Acquires the entry's fine-grained lock, spinning on a CAS from
    /// [`HST_UNLOCKED`] to `core_id`. Recursive acquisition self-deadlocks.
    pub fn lock(&self, addr: u64, core_id: u32) {
        let entry = &self.entries[self.index(addr)];
        while entry
            .lock
            .compare_exchange_weak(HST_UNLOCKED, core_id, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    /// Releases the entry's lock.
    pub fn unlock(&self, addr: u64) {
        self.entries[self.index(addr)].lock.store(HST_UNLOCKED, Ordering::Release);
    }

    /// Acquires the two entries covering a 16-byte region, always low
    /// address first so concurrent 128-bit sequences cannot deadlock.
    /// The caller guarantees `addr_hi == addr_lo + 8`.
    pub fn lock_pair(&self, addr_lo: u64, addr_hi: u64, core_id: u32) {
        debug_assert_eq!(addr_hi, addr_lo.wrapping_add(8));
        debug_assert_ne!(self.index(addr_lo), self.index(addr_hi));
        self.lock(addr_lo, core_id);
        self.lock(addr_hi, core_id);
    }

    /// Releases a pair acquired by [`StoreTable::lock_pair`].
    pub fn unlock_pair(&self, addr_lo: u64, addr_hi: u64) {
        self.unlock(addr_hi);
        self.unlock(addr_lo);
    }

    /// The lock word at the entry for `addr`; used by invariant checks.
    pub fn lock_holder(&self, addr: u64) -> u32 {
        self.entries[self.index(addr)].lock.load(Ordering::Acquire)
    }
}

/// Emits the store-table update for a guest store or LR reservation.
pub fn gen_store_table_set(ir: &mut IrBuilder, addr: Temp) {
    ir.gen_helper(HelperId::StoreTableSet, None, &[addr]);
}

/// Emits the reservation probe; `result` receives 1 iff the current core
/// still owns the entry.
pub fn gen_store_table_check(ir: &mut IrBuilder, result: Temp, addr: Temp) {
    ir.gen_helper(HelperId::StoreTableCheck, Some(result), &[addr]);
}

/// Emits the fine-grained lock acquisition for the entry covering `addr`.
pub fn gen_store_table_lock(ir: &mut IrBuilder, addr: Temp) {
    ir.gen_helper(HelperId::StoreTableLock, None, &[addr]);
}

/// Emits the matching release.
pub fn gen_store_table_unlock(ir: &mut IrBuilder, addr: Temp) {
    ir.gen_helper(HelperId::StoreTableUnlock, None, &[addr]);
}

/// Emits the two-entry acquisition for a 128-bit sequence. The caller
/// guarantees `addr_hi == addr_lo + 8`.
pub fn gen_store_table_lock_128(ir: &mut IrBuilder, addr_lo: Temp, addr_hi: Temp) {
    ir.gen_helper(HelperId::StoreTableLock128, None, &[addr_lo, addr_hi]);
}

/// Emits the matching two-entry release.
pub fn gen_store_table_unlock_128(ir: &mut IrBuilder, addr_lo: Temp, addr_hi: Temp) {
    ir.gen_helper(HelperId::StoreTableUnlock128, None, &[addr_lo, addr_hi]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn addresses_in_one_granule_share_an_entry() {
        let table = StoreTable::new(8).unwrap();
        assert_eq!(table.index(0x1000), table.index(0x1007));
        assert_ne!(table.index(0x1000), table.index(0x1008));
    }

    #[test]
    fn hash_wraps_at_table_size() {
        let table = StoreTable::new(4).unwrap();
        let span = (table.entry_count() as u64) << 3;
        assert_eq!(table.index(0x40), table.index(0x40 + span));
    }

    #[test]
    fn set_then_check_tracks_last_accessor() {
        let table = StoreTable::new(8).unwrap();
        table.set(0x2000, 0);
        assert!(table.check(0x2000, 0));
        table.set(0x2000, 1);
        assert!(!table.check(0x2000, 0));
        assert!(table.check(0x2000, 1));
    }

    #[test]
    fn reset_restores_sentinels() {
        let table = StoreTable::new(8).unwrap();
        table.set(0x2000, 3);
        table.lock(0x2000, 3);
        table.reset();
        assert!(!table.check(0x2000, 3));
        assert_eq!(table.lock_holder(0x2000), HST_UNLOCKED);
    }

    #[test]
    fn zero_index_bits_is_rejected() {
        assert!(matches!(StoreTable::new(0), Err(Error::InvalidStoreTableBits(0))));
    }

    #[test]
    fn lock_is_mutually_exclusive_across_threads() {
        let table = Arc::new(StoreTable::new(4).unwrap());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut handles = Vec::new();
        for core in 0..4u32 {
            let table = Arc::clone(&table);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    table.lock(0x8000, core);
                    // Non-atomic-looking critical section: read-modify-write
                    // through a relaxed pair only correct under the lock.
                    let value = counter.load(Ordering::Relaxed);
                    counter.store(value + 1, Ordering::Relaxed);
                    assert_eq!(table.lock_holder(0x8000), core);
                    table.unlock(0x8000);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn pair_lock_orders_low_address_first() {
        let table = StoreTable::new(8).unwrap();
        table.lock_pair(0x100, 0x108, 7);
        assert_eq!(table.lock_holder(0x100), 7);
        assert_eq!(table.lock_holder(0x108), 7);
        table.unlock_pair(0x100, 0x108);
        assert_eq!(table.lock_holder(0x100), HST_UNLOCKED);
        assert_eq!(table.lock_holder(0x108), HST_UNLOCKED);
    }
}
