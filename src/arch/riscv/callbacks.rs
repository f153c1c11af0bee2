//! This module provides the host callback surface of the RISC-V front-end:
//! external CSRs, interrupt-controller acknowledgement, PMP configuration,
//! custom instruction dispatch, and the instrumentation hooks.

/// Callbacks the host emulator supplies to a RISC-V core. Every method has
/// a default so hosts only implement what they use.
pub trait RiscvCallbacks {
    /// Current guest time, for the `time` CSR.
    fn get_cpu_time(&mut self) -> u64 {
        0
    }

    /// Reads a CSR the core does not model itself.
    fn read_csr(&mut self, csr: u32) -> u64 {
        log::warn!("read of unhandled CSR {:#x}", csr);
        0
    }

    /// Writes a CSR the core does not model itself.
    fn write_csr(&mut self, csr: u32, value: u64) {
        log::warn!("write of unhandled CSR {:#x} (value {:#x})", csr, value);
    }

    /// The `mip` register changed; the host may need to reschedule.
    fn mip_changed(&mut self, value: u64) {
        let _ = value;
    }

    /// Dispatches a host-registered custom instruction. Returns true when
    /// the callback handled the opcode.
    fn custom_instruction(&mut self, id: u64, opcode: u64) -> bool {
        let _ = (id, opcode);
        false
    }

    fn pre_opcode_hook(&mut self, id: u32, pc: u64, opcode: u64) {
        let _ = (id, pc, opcode);
    }

    fn post_opcode_hook(&mut self, id: u32, pc: u64, opcode: u64) {
        let _ = (id, pc, opcode);
    }

    /// Fired after a traced GPR is accessed.
    fn gpr_access_hook(&mut self, reg: u32, is_write: bool) {
        let _ = (reg, is_write);
    }

    /// Fired before a load/store through the stack pointer.
    fn stack_access_hook(&mut self, addr: u64, width: u32, is_write: bool) {
        let _ = (addr, width, is_write);
    }

    /// Stack-frame announcement for the profiler.
    fn stack_change(&mut self, prev_sp: u64, sp: u64) {
        let _ = (prev_sp, sp);
    }

    fn clic_acknowledge_interrupt(&mut self) {}

    fn clic_clear_edge_interrupt(&mut self) {}

    fn pmp_cfg_read(&mut self, index: u32) -> u64 {
        let _ = index;
        0
    }

    fn pmp_cfg_write(&mut self, index: u32, value: u64) {
        let _ = (index, value);
    }

    fn pmp_address_read(&mut self, index: u32) -> u64 {
        let _ = index;
        0
    }

    fn pmp_address_write(&mut self, index: u32, value: u64) {
        let _ = (index, value);
    }
}

/// The do-nothing callback set.
#[derive(Debug, Default)]
pub struct NoCallbacks;

impl RiscvCallbacks for NoCallbacks {}
