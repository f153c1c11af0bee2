//! This module provides the ARM64 instruction-fetch helpers. Fetched code
//! is always returned in standard little-endian order; when the guest runs
//! with big-endian instruction fetch (`SCTLR.B`), the bytes are swapped
//! back here so the decoder sees one byte order.

use crate::exception::Trap;
use crate::memory::GuestMemory;

/// Loads one instruction word, normalising to little-endian order.
pub fn arm_ldl_code(mem: &mut dyn GuestMemory, addr: u64, sctlr_b: bool) -> Result<u32, Trap> {
    let word = mem.ldl_code(addr)?;
    Ok(if sctlr_b { word.swap_bytes() } else { word })
}

/// Loads one Thumb halfword, normalising to little-endian order. In BE32
/// mode adjacent halfwords have been swapped within each word; undo that
/// before the fetch.
pub fn arm_lduw_code(mem: &mut dyn GuestMemory, addr: u64, sctlr_b: bool) -> Result<u16, Trap> {
    let addr = if sctlr_b { addr ^ 2 } else { addr };
    let half = mem.lduw_code(addr)?;
    Ok(if sctlr_b { half.swap_bytes() } else { half })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    #[test]
    fn little_endian_fetch_is_identity() {
        let mut mem = FlatMemory::new(0, 8);
        mem.write(0, &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(arm_ldl_code(&mut mem, 0, false).unwrap(), 0x1234_5678);
        assert_eq!(arm_lduw_code(&mut mem, 0, false).unwrap(), 0x5678);
    }

    #[test]
    fn big_endian_fetch_swaps_and_adjusts_thumb_address() {
        let mut mem = FlatMemory::new(0, 8);
        mem.write(0, &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(arm_ldl_code(&mut mem, 0, true).unwrap(), 0x1234_5678);
        // BE32 swaps halfwords within the word: the halfword at 0 lives at 2.
        assert_eq!(arm_lduw_code(&mut mem, 0, true).unwrap(), 0x5678);
        assert_eq!(arm_lduw_code(&mut mem, 2, true).unwrap(), 0x1234);
    }
}
