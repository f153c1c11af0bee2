//! This module provides the host callback surface of the x86 front-end:
//! port I/O, the pending-interrupt query, and the APIC/TSC write-throughs.

/// Callbacks the host emulator supplies to an x86 core.
pub trait X86Callbacks {
    fn read_byte_from_port(&mut self, port: u16) -> u8 {
        log::warn!("unhandled port read (byte) from {:#x}", port);
        0xff
    }

    fn read_word_from_port(&mut self, port: u16) -> u16 {
        log::warn!("unhandled port read (word) from {:#x}", port);
        0xffff
    }

    fn read_double_word_from_port(&mut self, port: u16) -> u32 {
        log::warn!("unhandled port read (dword) from {:#x}", port);
        0xffff_ffff
    }

    fn write_byte_to_port(&mut self, port: u16, value: u8) {
        log::warn!("unhandled port write (byte) {:#x} <- {:#x}", port, value);
    }

    fn write_word_to_port(&mut self, port: u16, value: u16) {
        log::warn!("unhandled port write (word) {:#x} <- {:#x}", port, value);
    }

    fn write_double_word_to_port(&mut self, port: u16, value: u32) {
        log::warn!("unhandled port write (dword) {:#x} <- {:#x}", port, value);
    }

    /// The vector of the highest-priority pending external interrupt.
    fn get_pending_interrupt(&mut self) -> i32 {
        -1
    }

    /// Guest instructions executed so far, for the time-stamp counter.
    fn get_instruction_count(&mut self) -> u64 {
        0
    }

    fn set_tsc_deadline_value(&mut self, value: u64) {
        let _ = value;
    }

    fn set_apic_base_value(&mut self, value: u64) {
        let _ = value;
    }
}

/// The do-nothing callback set.
#[derive(Debug, Default)]
pub struct NoCallbacks;

impl X86Callbacks for NoCallbacks {}
