//! This module provides the RISC-V front-end: per-core CPU state, the
//! decoder and micro-op emitter, compressed-instruction expansion, the CSR
//! file, the vector engine, and interrupt dispatch.

pub mod callbacks;
pub mod compressed;
pub mod csr;
pub mod translate;
pub mod vector;
pub mod vector_helper;

use std::sync::Arc;

use bitflags::bitflags;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::backend::CpuEnv;
use crate::exception::{Exception, Trap};
use crate::hooks::HookState;
use crate::hst::{StoreTable, HST_NO_CORE};
use crate::ir::HelperId;
use crate::memory::GuestMemory;
use callbacks::{NoCallbacks, RiscvCallbacks};

/// Guest register width.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }
}

/// Privilege modes, encoded as in `mstatus.MPP`.
#[derive(Clone, Copy, Debug, Eq, FromPrimitive, PartialEq, PartialOrd)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

bitflags! {
    /// Single-letter ISA extensions, as in `misa`.
    pub struct RiscvFeatures: u32 {
        const RVI = 1 << 8;
        const RVM = 1 << 12;
        const RVA = 1 << 0;
        const RVF = 1 << 5;
        const RVD = 1 << 3;
        const RVC = 1 << 2;
        const RVS = 1 << 18;
        const RVU = 1 << 20;
        const RVV = 1 << 21;
    }
}

bitflags! {
    /// Ratified sub-extensions outside `misa`.
    pub struct AdditionalFeatures: u32 {
        const ZBA      = 1 << 0;
        const ZBB      = 1 << 1;
        const ZBC      = 1 << 2;
        const ZBS      = 1 << 3;
        const ZICSR    = 1 << 4;
        const ZIFENCEI = 1 << 5;
        const ZFH      = 1 << 6;
        const ZACAS    = 1 << 7;
        const ZVE32X   = 1 << 8;
        const ZVE32F   = 1 << 9;
        const ZVE64X   = 1 << 10;
        const ZVE64F   = 1 << 11;
        const ZVE64D   = 1 << 12;
        const ZVFH     = 1 << 13;
    }
}

// mstatus fields used by the core.
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP: u64 = 3 << 11;
pub const MSTATUS_FS: u64 = 3 << 13;
pub const MSTATUS_VS: u64 = 3 << 9;

// mip/mie bit positions.
pub const IRQ_S_SOFT: u32 = 1;
pub const IRQ_M_SOFT: u32 = 3;
pub const IRQ_S_TIMER: u32 = 5;
pub const IRQ_M_TIMER: u32 = 7;
pub const IRQ_S_EXT: u32 = 9;
pub const IRQ_M_EXT: u32 = 11;

/// No LR reservation outstanding.
pub const RESERVATION_NONE: u64 = u64::MAX;

/// Stable global-temporary ids for the IR builder.
pub(crate) mod globals {
    pub const GPR_BASE: u16 = 0; // 0..=31
    pub const PC: u16 = 32;
    pub const OPCODE: u16 = 33;
    pub const VSTART: u16 = 34;
    pub const VILL: u16 = 35;
    pub const PREV_SP: u16 = 36;
    pub const MSTATUS: u16 = 37;
    pub const FPR_BASE: u16 = 40; // 40..=71
}

/// Abstract cause codes passed from generated code to `RaiseException`.
pub(crate) mod excp {
    pub const ILLEGAL: u64 = 0;
    pub const BREAKPOINT: u64 = 1;
    pub const ECALL: u64 = 2;
    pub const MISALIGNED_FETCH: u64 = 3;
    pub const FETCH_FAULT: u64 = 4;
}

/// A host-registered custom instruction pattern.
#[derive(Clone, Debug)]
pub struct CustomInstruction {
    pub id: u64,
    pub pattern: u64,
    pub mask: u64,
    /// Instruction length in bytes (2, 4, or 8).
    pub length: u32,
}

/// Per-core RISC-V CPU state. Owned by the core's host thread; mutated only
/// by its own translated code and the helpers called from it.
pub struct CpuState {
    pub xlen: Xlen,
    pub gpr: [u64; 32],
    pub fpr: [u64; 32],
    pub pc: u64,
    /// Raw bits of the instruction being executed, published for `mtval`.
    pub opcode: u64,
    pub privilege: PrivilegeMode,
    pub mstatus: u64,
    pub misa: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mie: u64,
    pub mip: u64,
    pub mtvec: u64,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub stvec: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub mhartid: u64,
    pub fcsr: u64,

    // Vector configuration and register file.
    pub vlenb: u32,
    pub vl: u64,
    pub vstart: u64,
    pub vtype: u64,
    pub vsew: u32,
    /// log2 of LMUL, in -3..=3.
    pub vlmul: i8,
    pub vta: bool,
    pub vma: bool,
    pub vill: bool,
    pub vxrm: u8,
    pub vxsat: bool,
    pub vreg: Box<[u8]>,

    /// Outstanding LR reservation address, or [`RESERVATION_NONE`].
    pub load_res: u64,

    pub store_table: Arc<StoreTable>,
    pub core_id: u32,

    pub nmi_pending: u32,
    pub nmi_mcause: [u64; 32],
    pub nmi_length: u32,
    pub debug_mode: bool,
    /// Set by `WFI`; cleared by the host when an interrupt arrives.
    pub waiting_for_interrupt: bool,

    pub hooks: HookState,
    pub prev_sp: u64,
    pub custom_instructions: Vec<CustomInstruction>,
    features: RiscvFeatures,
    additional: AdditionalFeatures,
    /// Extensions whose absence is reported without the diagnostic log.
    silent: AdditionalFeatures,
    pub callbacks: Box<dyn RiscvCallbacks>,
}

/// Configures a RISC-V core before construction, in the builder style of
/// the crate's other configurable objects.
pub struct CoreBuilder {
    xlen: Xlen,
    features: RiscvFeatures,
    additional: AdditionalFeatures,
    vlen: u32,
    core_id: u32,
    hartid: u64,
    store_table: Option<Arc<StoreTable>>,
    callbacks: Option<Box<dyn RiscvCallbacks>>,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self {
            xlen: Xlen::Rv64,
            features: RiscvFeatures::RVI | RiscvFeatures::RVU,
            additional: AdditionalFeatures::empty(),
            vlen: 128,
            core_id: 0,
            hartid: 0,
            store_table: None,
            callbacks: None,
        }
    }

    pub fn with_xlen(mut self, xlen: Xlen) -> Self {
        self.xlen = xlen;
        self
    }

    pub fn with_features(mut self, features: RiscvFeatures) -> Self {
        self.features |= features;
        self
    }

    pub fn with_additional_features(mut self, features: AdditionalFeatures) -> Self {
        self.additional |= features;
        self
    }

    /// Vector register length in bits; must be a power of two of at least 32.
    pub fn with_vlen(mut self, vlen: u32) -> Self {
        self.vlen = vlen;
        self
    }

    pub fn with_core_id(mut self, core_id: u32) -> Self {
        self.core_id = core_id;
        self.hartid = core_id as u64;
        self
    }

    pub fn with_store_table(mut self, table: Arc<StoreTable>) -> Self {
        self.store_table = Some(table);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Box<dyn RiscvCallbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn build(self) -> Result<CpuState, crate::error::Error> {
        if !self.vlen.is_power_of_two() || self.vlen < 32 {
            return Err(crate::error::Error::InvalidVlen(self.vlen));
        }
        if self.core_id == HST_NO_CORE {
            return Err(crate::error::Error::ReservedCoreId(self.core_id));
        }
        let store_table = match self.store_table {
            Some(table) => table,
            None => Arc::new(StoreTable::new(16)?),
        };
        let vlenb = self.vlen / 8;
        let misa = self.features.bits() as u64
            | match self.xlen {
                Xlen::Rv32 => 1 << 30,
                Xlen::Rv64 => 2 << 62,
            };
        Ok(CpuState {
            xlen: self.xlen,
            gpr: [0; 32],
            fpr: [0; 32],
            pc: 0,
            opcode: 0,
            privilege: PrivilegeMode::Machine,
            mstatus: 0,
            misa,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mip: 0,
            mtvec: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            mhartid: self.hartid,
            fcsr: 0,
            vlenb,
            vl: 0,
            vstart: 0,
            vtype: 0,
            vsew: 8,
            vlmul: 0,
            vta: false,
            vma: false,
            vill: false,
            vxrm: 0,
            vxsat: false,
            vreg: vec![0; vlenb as usize * 32].into_boxed_slice(),
            load_res: RESERVATION_NONE,
            store_table,
            core_id: self.core_id,
            nmi_pending: 0,
            nmi_mcause: [0; 32],
            nmi_length: 32,
            debug_mode: false,
            waiting_for_interrupt: false,
            hooks: HookState::default(),
            prev_sp: 0,
            custom_instructions: Vec::new(),
            features: self.features,
            additional: self.additional,
            silent: AdditionalFeatures::empty(),
            callbacks: self.callbacks.unwrap_or_else(|| Box::new(NoCallbacks)),
        })
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    pub fn has_feature(&self, feature: RiscvFeatures) -> bool {
        self.features.contains(feature)
    }

    pub fn has_additional(&self, feature: AdditionalFeatures) -> bool {
        self.additional.contains(feature)
    }

    /// Suppresses the disabled-extension diagnostic for `feature`.
    pub fn silence_feature(&mut self, feature: AdditionalFeatures) {
        self.silent |= feature;
    }

    pub(crate) fn is_silenced(&self, feature: AdditionalFeatures) -> bool {
        self.silent.contains(feature)
    }

    /// Widest supported element width, from the vector feature set.
    pub fn elen(&self) -> u32 {
        if self.features.contains(RiscvFeatures::RVV)
            || self
                .additional
                .intersects(AdditionalFeatures::ZVE64X | AdditionalFeatures::ZVE64F | AdditionalFeatures::ZVE64D)
        {
            64
        } else {
            32
        }
    }

    pub fn has_vector(&self) -> bool {
        self.features.contains(RiscvFeatures::RVV)
            || self.additional.intersects(
                AdditionalFeatures::ZVE32X
                    | AdditionalFeatures::ZVE32F
                    | AdditionalFeatures::ZVE64X
                    | AdditionalFeatures::ZVE64F
                    | AdditionalFeatures::ZVE64D,
            )
    }

    /// Truncate or sign-extend per XLEN; RV32 values are kept
    /// sign-extended in the 64-bit slots.
    pub fn canonical(&self, value: u64) -> u64 {
        match self.xlen {
            Xlen::Rv32 => value as u32 as i32 as i64 as u64,
            Xlen::Rv64 => value,
        }
    }

    /// MMU index for data accesses in the current privilege mode.
    pub fn mem_index(&self) -> u8 {
        self.privilege as u8
    }

    /// Raises `mip` bits and notifies the host.
    pub fn set_mip(&mut self, mask: u64) {
        self.mip |= mask;
        let value = self.mip;
        self.callbacks.mip_changed(value);
    }

    pub fn clear_mip(&mut self, mask: u64) {
        self.mip &= !mask;
        let value = self.mip;
        self.callbacks.mip_changed(value);
    }

    pub fn set_nmi(&mut self, number: u32, mcause: u64) {
        assert!(number < self.nmi_length, "NMI index {} out of range", number);
        self.nmi_pending |= 1 << number;
        self.nmi_mcause[number as usize] = mcause;
    }

    pub fn reset_nmi(&mut self, number: u32) {
        self.nmi_pending &= !(1 << number);
    }

    /// The `mcause` interrupt flag for the current XLEN.
    fn interrupt_flag(&self) -> u64 {
        1 << (self.xlen.bits() - 1)
    }

    /// Maps an abstract exception onto the architectural cause number.
    pub fn cause_for(&self, exception: Exception) -> u64 {
        match exception {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EnvironmentCall => 8 + self.privilege as u64,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
            // Not architectural; never delivered to the guest.
            _ => u64::MAX,
        }
    }

    /// Delivers a trap to the guest: fills the cause/epc/tval CSRs, stacks
    /// the interrupt-enable state, and transfers to the handler.
    pub fn do_interrupt(&mut self, trap: &Trap) {
        if trap.exception == Exception::WaitForInterrupt {
            self.waiting_for_interrupt = true;
            return;
        }
        let cause = self.cause_for(trap.exception);
        let delegated = self.privilege < PrivilegeMode::Machine
            && self.features.contains(RiscvFeatures::RVS)
            && self.medeleg & (1 << cause) != 0;
        if delegated {
            self.scause = cause;
            self.sepc = self.pc;
            self.stval = self.canonical(trap.tval);
            let sie = (self.mstatus & MSTATUS_SIE) >> 1;
            self.mstatus = (self.mstatus & !(MSTATUS_SPIE | MSTATUS_SIE | MSTATUS_SPP))
                | (sie << 5)
                | if self.privilege == PrivilegeMode::Supervisor { MSTATUS_SPP } else { 0 };
            self.privilege = PrivilegeMode::Supervisor;
            self.pc = self.stvec & !3;
        } else {
            self.mcause = cause;
            self.mepc = self.pc;
            self.mtval = self.canonical(trap.tval);
            let mie = (self.mstatus & MSTATUS_MIE) >> 3;
            self.mstatus = (self.mstatus & !(MSTATUS_MPIE | MSTATUS_MIE | MSTATUS_MPP))
                | (mie << 7)
                | ((self.privilege as u64) << 11);
            self.privilege = PrivilegeMode::Machine;
            self.pc = self.mtvec & !3;
        }
    }

    /// Delivers a pending interrupt, NMIs first. Returns true when one was
    /// taken. In debug mode every interrupt (including NMI) is masked.
    pub fn process_interrupt(&mut self) -> bool {
        if self.debug_mode {
            return false;
        }
        if self.nmi_pending != 0 {
            let number = self.nmi_pending.trailing_zeros();
            let mcause = self.nmi_mcause[number as usize];
            self.reset_nmi(number);
            self.mcause = mcause | self.interrupt_flag();
            self.mepc = self.pc;
            self.mtval = 0;
            let mie = (self.mstatus & MSTATUS_MIE) >> 3;
            self.mstatus = (self.mstatus & !(MSTATUS_MPIE | MSTATUS_MIE | MSTATUS_MPP))
                | (mie << 7)
                | ((self.privilege as u64) << 11);
            self.privilege = PrivilegeMode::Machine;
            self.pc = self.mtvec & !3;
            self.waiting_for_interrupt = false;
            return true;
        }
        if let Some(irq) = self.pending_interrupt() {
            self.callbacks.clic_acknowledge_interrupt();
            self.mcause = irq as u64 | self.interrupt_flag();
            self.mepc = self.pc;
            self.mtval = 0;
            let mie = (self.mstatus & MSTATUS_MIE) >> 3;
            self.mstatus = (self.mstatus & !(MSTATUS_MPIE | MSTATUS_MIE | MSTATUS_MPP))
                | (mie << 7)
                | ((self.privilege as u64) << 11);
            self.privilege = PrivilegeMode::Machine;
            // Vectored mode dispatches interrupts through tvec entries.
            let base = self.mtvec & !3;
            self.pc = if self.mtvec & 3 == 1 { base + 4 * irq as u64 } else { base };
            self.waiting_for_interrupt = false;
            return true;
        }
        false
    }

    /// The highest-priority enabled pending interrupt, if any.
    fn pending_interrupt(&self) -> Option<u32> {
        let enabled = match self.privilege {
            PrivilegeMode::Machine => {
                if self.mstatus & MSTATUS_MIE == 0 {
                    return None;
                }
                self.mip & self.mie & !self.mideleg
            }
            _ => self.mip & self.mie,
        };
        // MEI > MSI > MTI > SEI > SSI > STI.
        for irq in [IRQ_M_EXT, IRQ_M_SOFT, IRQ_M_TIMER, IRQ_S_EXT, IRQ_S_SOFT, IRQ_S_TIMER] {
            if enabled & (1 << irq) != 0 {
                return Some(irq);
            }
        }
        None
    }

    fn raise(&self, code: u64, tval: Option<u64>) -> Trap {
        match code {
            excp::ILLEGAL => Trap::new(Exception::IllegalInstruction, self.opcode),
            excp::BREAKPOINT => Trap::new(Exception::Breakpoint, self.pc),
            excp::ECALL => Trap::bare(Exception::EnvironmentCall),
            excp::MISALIGNED_FETCH => {
                Trap::new(Exception::InstructionAddressMisaligned, tval.unwrap_or(0))
            }
            excp::FETCH_FAULT => Trap::new(Exception::InstructionAccessFault, tval.unwrap_or(0)),
            _ => Trap::bare(Exception::IllegalInstruction),
        }
    }

    fn mret(&mut self) {
        let mpp = (self.mstatus & MSTATUS_MPP) >> 11;
        let mpie = (self.mstatus & MSTATUS_MPIE) >> 7;
        self.mstatus = (self.mstatus & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP)) | (mpie << 3) | MSTATUS_MPIE;
        self.privilege = PrivilegeMode::from_u64(mpp).unwrap_or(PrivilegeMode::User);
        self.pc = self.mepc;
    }

    fn sret(&mut self) {
        let spp = (self.mstatus & MSTATUS_SPP) >> 8;
        let spie = (self.mstatus & MSTATUS_SPIE) >> 5;
        self.mstatus = (self.mstatus & !(MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP)) | (spie << 1) | MSTATUS_SPIE;
        self.privilege = if spp != 0 { PrivilegeMode::Supervisor } else { PrivilegeMode::User };
        self.pc = self.sepc;
    }
}

impl CpuEnv for CpuState {
    fn read_global(&self, id: u16) -> u64 {
        match id {
            globals::GPR_BASE..=31 => self.gpr[id as usize],
            globals::PC => self.pc,
            globals::OPCODE => self.opcode,
            globals::VSTART => self.vstart,
            globals::VILL => self.vill as u64,
            globals::PREV_SP => self.prev_sp,
            globals::MSTATUS => self.mstatus,
            globals::FPR_BASE..=71 => self.fpr[(id - globals::FPR_BASE) as usize],
            _ => {
                log::error!("read of unknown RISC-V global {}", id);
                0
            }
        }
    }

    fn write_global(&mut self, id: u16, value: u64) {
        match id {
            // Writes to x0 are discarded at decode; defend here as well.
            0 => {}
            globals::GPR_BASE..=31 => self.gpr[id as usize] = value,
            globals::PC => self.pc = value,
            globals::OPCODE => self.opcode = value,
            globals::VSTART => self.vstart = value,
            globals::VILL => self.vill = value != 0,
            globals::PREV_SP => self.prev_sp = value,
            globals::MSTATUS => self.mstatus = value,
            globals::FPR_BASE..=71 => self.fpr[(id - globals::FPR_BASE) as usize] = value,
            _ => log::error!("write of unknown RISC-V global {}", id),
        }
    }

    fn call_helper(
        &mut self,
        helper: HelperId,
        args: &[u64],
        mem: &mut dyn GuestMemory,
    ) -> Result<Option<u64>, Trap> {
        match helper {
            HelperId::RaiseException => Err(self.raise(args[0], None)),
            HelperId::RaiseExceptionBadAddr => Err(self.raise(args[0], Some(args[1]))),

            HelperId::StoreTableSet => {
                self.store_table.set(args[0], self.core_id);
                Ok(None)
            }
            HelperId::StoreTableCheck => {
                Ok(Some(self.store_table.check(args[0], self.core_id) as u64))
            }
            HelperId::StoreTableLock => {
                self.store_table.lock(args[0], self.core_id);
                Ok(None)
            }
            HelperId::StoreTableUnlock => {
                self.store_table.unlock(args[0]);
                Ok(None)
            }
            HelperId::StoreTableLock128 => {
                self.store_table.lock_pair(args[0], args[1], self.core_id);
                Ok(None)
            }
            HelperId::StoreTableUnlock128 => {
                self.store_table.unlock_pair(args[0], args[1]);
                Ok(None)
            }

            HelperId::ReserveAddress => {
                self.load_res = args[0];
                self.store_table.set(args[0], self.core_id);
                Ok(None)
            }
            HelperId::CheckAddressReservation => {
                let addr = args[0];
                let held = self.load_res == addr && self.store_table.check(addr, self.core_id);
                // 0 means the reservation is still valid.
                Ok(Some(if held { 0 } else { 1 }))
            }
            HelperId::RegisterAddressAccess => {
                self.store_table.set(args[0], self.core_id);
                Ok(None)
            }
            HelperId::CancelReservation => {
                self.load_res = RESERVATION_NONE;
                Ok(None)
            }

            HelperId::CsrRead => csr::read_csr(self, args[0] as u32).map(Some),
            HelperId::CsrWrite => csr::write_csr(self, args[0] as u32, args[1]).map(|_| None),
            HelperId::Mret => {
                self.mret();
                Ok(None)
            }
            HelperId::Sret => {
                self.sret();
                Ok(None)
            }
            HelperId::Wfi => {
                if self.debug_mode {
                    // In debug mode WFI is a NOP.
                    Ok(None)
                } else {
                    Err(Trap::bare(Exception::WaitForInterrupt))
                }
            }

            HelperId::Vsetvl => {
                vector_helper::vsetvl(self, args[0] as u32, args[1] as u32, args[2], args[3], args[4] != 0)
                    .map(Some)
            }
            HelperId::VLoadUnit => vector_helper::load_unit(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] != 0, args[5] != 0,
            )
            .map(|_| None),
            HelperId::VStoreUnit => vector_helper::store_unit(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] != 0,
            )
            .map(|_| None),
            HelperId::VLoadStride => vector_helper::load_stride(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] as u32, args[5] != 0,
            )
            .map(|_| None),
            HelperId::VStoreStride => vector_helper::store_stride(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] as u32, args[5] != 0,
            )
            .map(|_| None),
            HelperId::VLoadIndexed => vector_helper::load_indexed(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] as u32, args[5] != 0,
            )
            .map(|_| None),
            HelperId::VStoreIndexed => vector_helper::store_indexed(
                self, mem, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32,
                args[4] as u32, args[5] != 0,
            )
            .map(|_| None),
            HelperId::VLoadMask => {
                vector_helper::load_mask(self, mem, args[0] as u32, args[1] as u32).map(|_| None)
            }
            HelperId::VStoreMask => {
                vector_helper::store_mask(self, mem, args[0] as u32, args[1] as u32).map(|_| None)
            }
            HelperId::VLoadWhole => {
                vector_helper::load_whole(self, mem, args[0] as u32, args[1] as u32, args[2] as u32)
                    .map(|_| None)
            }
            HelperId::VStoreWhole => {
                vector_helper::store_whole(self, mem, args[0] as u32, args[1] as u32, args[2] as u32)
                    .map(|_| None)
            }
            HelperId::VOpIvv => vector_helper::op_ivv(
                self, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32, args[4] != 0,
            )
            .map(|_| None),
            HelperId::VOpIvx => vector_helper::op_ivx(
                self, args[0] as u32, args[1] as u32, args[2] as u32, args[3] as u32, args[4] != 0,
            )
            .map(|_| None),
            HelperId::VOpIvi => vector_helper::op_ivi(
                self, args[0] as u32, args[1] as u32, args[2] as i64, args[3] as u32, args[4] != 0,
            )
            .map(|_| None),

            HelperId::CustomInstruction => {
                let handled = self.callbacks.custom_instruction(args[0], args[1]);
                if handled {
                    Ok(Some(1))
                } else {
                    Err(Trap::new(Exception::IllegalInstruction, args[1]))
                }
            }
            HelperId::PreOpcodeHook => {
                if let Some(id) = self.hooks.pre_opcode_hook {
                    self.callbacks.pre_opcode_hook(id, args[0], args[1]);
                }
                Ok(None)
            }
            HelperId::PostOpcodeHook => {
                if let Some(id) = self.hooks.post_opcode_hook {
                    self.callbacks.post_opcode_hook(id, args[0], args[1]);
                }
                Ok(None)
            }
            HelperId::GprAccessHook => {
                self.callbacks.gpr_access_hook(args[0] as u32, args[1] != 0);
                Ok(None)
            }
            HelperId::StackAccessHook => {
                self.callbacks
                    .stack_access_hook(args[0], args[1] as u32, args[2] != 0);
                Ok(None)
            }
            HelperId::StackChange => {
                let prev = self.prev_sp;
                self.callbacks.stack_change(prev, args[0]);
                self.prev_sp = args[0];
                Ok(None)
            }
            HelperId::OpcodeCount => {
                self.hooks.record_opcode(args[0] as u8);
                Ok(None)
            }

            other => unreachable!("not a RISC-V helper: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> CpuState {
        CoreBuilder::new()
            .with_features(RiscvFeatures::RVM | RiscvFeatures::RVA | RiscvFeatures::RVC)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_rejects_bad_vlen() {
        assert!(CoreBuilder::new().with_vlen(96).build().is_err());
        assert!(CoreBuilder::new().with_vlen(16).build().is_err());
    }

    #[test]
    fn trap_delivery_fills_machine_csrs() {
        let mut cpu = core();
        cpu.pc = 0x8000_0000;
        cpu.mtvec = 0x4000_0000;
        cpu.mstatus = MSTATUS_MIE;
        cpu.privilege = PrivilegeMode::User;
        cpu.do_interrupt(&Trap::new(Exception::IllegalInstruction, 0xdead));
        assert_eq!(cpu.mcause, 2);
        assert_eq!(cpu.mepc, 0x8000_0000);
        assert_eq!(cpu.mtval, 0xdead);
        assert_eq!(cpu.pc, 0x4000_0000);
        assert_eq!(cpu.privilege, PrivilegeMode::Machine);
        assert_eq!(cpu.mstatus & MSTATUS_MIE, 0);
        assert_eq!(cpu.mstatus & MSTATUS_MPIE, MSTATUS_MPIE);
        // MPP records user mode.
        assert_eq!(cpu.mstatus & MSTATUS_MPP, 0);
    }

    #[test]
    fn mret_restores_stacked_state() {
        let mut cpu = core();
        cpu.mepc = 0x1234;
        cpu.mstatus = MSTATUS_MPIE; // MPP = user
        cpu.mret();
        assert_eq!(cpu.pc, 0x1234);
        assert_eq!(cpu.privilege, PrivilegeMode::User);
        assert_eq!(cpu.mstatus & MSTATUS_MIE, MSTATUS_MIE);
    }

    #[test]
    fn nmi_takes_precedence_over_ordinary_interrupts() {
        let mut cpu = core();
        cpu.mtvec = 0x100;
        cpu.mstatus = MSTATUS_MIE;
        cpu.mie = 1 << IRQ_M_EXT;
        cpu.mip = 1 << IRQ_M_EXT;
        cpu.set_nmi(2, 0x42);
        assert!(cpu.process_interrupt());
        assert_eq!(cpu.mcause & 0xfff, 0x42);
        assert_ne!(cpu.mcause & cpu.interrupt_flag(), 0);
    }

    #[test]
    fn debug_mode_masks_all_interrupts() {
        let mut cpu = core();
        cpu.debug_mode = true;
        cpu.set_nmi(0, 1);
        assert!(!cpu.process_interrupt());
    }

    #[test]
    fn interrupts_respect_mie_gate() {
        let mut cpu = core();
        cpu.mie = 1 << IRQ_M_TIMER;
        cpu.mip = 1 << IRQ_M_TIMER;
        assert!(!cpu.process_interrupt());
        cpu.mstatus = MSTATUS_MIE;
        assert!(cpu.process_interrupt());
        assert_eq!(cpu.mcause & 0xfff, IRQ_M_TIMER as u64);
    }
}
