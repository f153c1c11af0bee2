//! This module provides the x86/x86-64 front-end: per-core CPU state, the
//! lazy condition-code engine, the decoder and micro-op emitter, and
//! interrupt dispatch.

pub mod callbacks;
pub mod ccop;
pub mod translate;

use std::sync::Arc;

use bitflags::bitflags;

use crate::backend::CpuEnv;
use crate::exception::{Exception, Trap};
use crate::hooks::HookState;
use crate::hst::{StoreTable, HST_NO_CORE};
use crate::ir::HelperId;
use crate::memory::{AccessSize, GuestMemory};
use callbacks::{NoCallbacks, X86Callbacks};
use ccop::{CcOp, CC_A, CC_C, CC_O, CC_P, CC_S, CC_Z};

// General-purpose register indices.
pub const R_EAX: usize = 0;
pub const R_ECX: usize = 1;
pub const R_EDX: usize = 2;
pub const R_EBX: usize = 3;
pub const R_ESP: usize = 4;
pub const R_EBP: usize = 5;
pub const R_ESI: usize = 6;
pub const R_EDI: usize = 7;

// Segment register indices.
pub const R_ES: usize = 0;
pub const R_CS: usize = 1;
pub const R_SS: usize = 2;
pub const R_DS: usize = 3;
pub const R_FS: usize = 4;
pub const R_GS: usize = 5;

// EFLAGS bits outside the lazy condition codes.
pub const TF_MASK: u64 = 0x0000_0100;
pub const IF_MASK: u64 = 0x0000_0200;
pub const DF_MASK: u64 = 0x0000_0400;
pub const IOPL_MASK: u64 = 0x0000_3000;
pub const NT_MASK: u64 = 0x0000_4000;
pub const RF_MASK: u64 = 0x0001_0000;
pub const VM_MASK: u64 = 0x0002_0000;
pub const AC_MASK: u64 = 0x0004_0000;
pub const VIF_MASK: u64 = 0x0008_0000;
pub const VIP_MASK: u64 = 0x0010_0000;
pub const ID_MASK: u64 = 0x0020_0000;

/// The lazily-maintained condition-code bits.
pub const CC_MASK: u64 = (CC_C | CC_P | CC_A | CC_Z | CC_S | CC_O) as u64;

// hflags: translation-regime bits baked into each TB.
pub const HF_CPL_MASK: u64 = 0x0003;
pub const HF_INHIBIT_IRQ_MASK: u64 = 0x0008;
pub const HF_CS32_MASK: u64 = 0x0010;
pub const HF_SS32_MASK: u64 = 0x0020;
pub const HF_ADDSEG_MASK: u64 = 0x0040;
pub const HF_PE_MASK: u64 = 0x0080;
pub const HF_LMA_MASK: u64 = 0x0400;
pub const HF_CS64_MASK: u64 = 0x0800;
pub const HF_SMM_MASK: u64 = 0x2000;
pub const HF_SVMI_MASK: u64 = 0x0020_0000;

// hflags2: virtualisation gating bits.
pub const HF2_GIF_MASK: u64 = 0x0001;
pub const HF2_HIF_MASK: u64 = 0x0002;
pub const HF2_NMI_MASK: u64 = 0x0004;
pub const HF2_VINTR_MASK: u64 = 0x0008;

// Interrupt request lines, in priority order.
pub const CPU_INTERRUPT_HARD: u32 = 0x0002;
pub const CPU_INTERRUPT_SMI: u32 = 0x0040;
pub const CPU_INTERRUPT_NMI: u32 = 0x0200;
pub const CPU_INTERRUPT_INIT: u32 = 0x0400;
pub const CPU_INTERRUPT_SIPI: u32 = 0x0800;
pub const CPU_INTERRUPT_MCE: u32 = 0x1000;
pub const CPU_INTERRUPT_VIRQ: u32 = 0x2000;

// Control register bits used by the core.
pub const CR0_PE_MASK: u64 = 1 << 0;
pub const CR0_TS_MASK: u64 = 1 << 3;
pub const CR4_TSD_MASK: u64 = 1 << 2;

// Model-specific registers the core models.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;
pub const MSR_IA32_APICBASE: u32 = 0x1b;
pub const MSR_IA32_TSC_DEADLINE: u32 = 0x6e0;
pub const MSR_EFER: u32 = 0xc000_0080;
pub const MSR_STAR: u32 = 0xc000_0081;
pub const MSR_LSTAR: u32 = 0xc000_0082;
pub const MSR_CSTAR: u32 = 0xc000_0083;
pub const MSR_FMASK: u32 = 0xc000_0084;
pub const MSR_FSBASE: u32 = 0xc000_0100;
pub const MSR_GSBASE: u32 = 0xc000_0101;
pub const MSR_KERNELGSBASE: u32 = 0xc000_0102;

bitflags! {
    /// Gated instruction-set features, as the decoder consults them.
    pub struct X86Features: u64 {
        const SSE      = 1 << 0;
        const SSE2     = 1 << 1;
        const SSE3     = 1 << 2;
        const SSSE3    = 1 << 3;
        const SSE41    = 1 << 4;
        const SSE42    = 1 << 5;
        const THREEDNOW = 1 << 6;
        const AES      = 1 << 7;
        const POPCNT   = 1 << 8;
        const LAHF_LM  = 1 << 9;
        const CX16     = 1 << 10;
        const CMOV     = 1 << 11;
        const CLFLUSH  = 1 << 12;
        const SVM      = 1 << 13;
        const MONITOR  = 1 << 14;
        const RDTSCP   = 1 << 15;
        const TSC      = 1 << 16;
        const SYSCALL  = 1 << 17;
    }
}

/// One cached segment register.
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u64,
    pub limit: u32,
    pub flags: u32,
}

/// A descriptor-table register (GDTR/IDTR).
#[derive(Clone, Copy, Debug, Default)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

/// Stable global-temporary ids for the IR builder.
pub(crate) mod globals {
    pub const REG_BASE: u16 = 0; // 0..=15
    pub const EIP: u16 = 16;
    pub const CC_OP: u16 = 17;
    pub const CC_SRC: u16 = 18;
    pub const CC_DST: u16 = 19;
    pub const CC_TMP: u16 = 20;
    pub const DF: u16 = 21;
    pub const SEG_BASE: u16 = 24; // 24..=29, indexed by R_ES..R_GS
    pub const XMM_BASE: u16 = 32; // 32..=63, two per register
}

/// Per-core x86 CPU state. Owned by the core's host thread; mutated only
/// by its own translated code and the helpers called from it.
pub struct CpuState {
    pub regs: [u64; 16],
    /// Instruction pointer, as an offset within CS.
    pub eip: u64,
    /// Architectural EFLAGS except the lazy condition codes and DF.
    pub eflags: u64,
    /// Encoded [`CcOp`] tag of the last flag-defining operation.
    pub cc_op: u32,
    pub cc_src: u64,
    pub cc_dst: u64,
    pub cc_tmp: u64,
    /// Direction flag as a stride: 1 or -1.
    pub df: i64,
    pub segs: [SegmentCache; 6],
    pub ldt: SegmentCache,
    pub tr: SegmentCache,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr: [u64; 9],
    pub dr: [u64; 8],
    pub hflags: u64,
    pub hflags2: u64,
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub fmask: u64,
    pub kernel_gs_base: u64,
    pub sysenter_cs: u64,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub pat: u64,
    pub apic_state: u64,
    pub tsc_offset: u64,
    pub tsc_deadline: u64,
    pub xmm: [[u64; 2]; 16],

    pub interrupt_request: u32,
    /// Vector of a pending virtual interrupt (SVM V_INTR).
    pub virq_vector: u8,
    pub halted: bool,
    /// Exception handed to the external delivery collaborator when the
    /// core runs in protected mode.
    pub pending_exception: Option<(u8, u32)>,

    pub store_table: Arc<StoreTable>,
    pub core_id: u32,
    pub hooks: HookState,
    pub callbacks: Box<dyn X86Callbacks>,
    features: X86Features,
}

/// Configures an x86 core before construction.
pub struct CoreBuilder {
    features: X86Features,
    core_id: u32,
    store_table: Option<Arc<StoreTable>>,
    callbacks: Option<Box<dyn X86Callbacks>>,
    long_mode: bool,
}

impl CoreBuilder {
    pub fn new() -> Self {
        Self {
            features: X86Features::TSC | X86Features::CLFLUSH | X86Features::CMOV,
            core_id: 0,
            store_table: None,
            callbacks: None,
            long_mode: false,
        }
    }

    pub fn with_features(mut self, features: X86Features) -> Self {
        self.features |= features;
        self
    }

    pub fn with_core_id(mut self, core_id: u32) -> Self {
        self.core_id = core_id;
        self
    }

    pub fn with_store_table(mut self, table: Arc<StoreTable>) -> Self {
        self.store_table = Some(table);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Box<dyn X86Callbacks>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Starts the core in 64-bit long mode with flat segments.
    pub fn with_long_mode(mut self) -> Self {
        self.long_mode = true;
        self
    }

    pub fn build(self) -> Result<CpuState, crate::error::Error> {
        if self.core_id == HST_NO_CORE {
            return Err(crate::error::Error::ReservedCoreId(self.core_id));
        }
        let store_table = match self.store_table {
            Some(table) => table,
            None => Arc::new(StoreTable::new(16)?),
        };
        let mut cpu = CpuState {
            regs: [0; 16],
            eip: 0xfff0,
            eflags: 0x2,
            cc_op: CcOp::Eflags.to_bits(),
            cc_src: 0,
            cc_dst: 0,
            cc_tmp: 0,
            df: 1,
            segs: [SegmentCache::default(); 6],
            ldt: SegmentCache::default(),
            tr: SegmentCache::default(),
            gdt: DescriptorTable::default(),
            idt: DescriptorTable::default(),
            cr: [0; 9],
            dr: [0; 8],
            hflags: 0,
            hflags2: HF2_GIF_MASK,
            efer: 0,
            star: 0,
            lstar: 0,
            cstar: 0,
            fmask: 0,
            kernel_gs_base: 0,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            pat: 0,
            apic_state: (0xfee00 << 12) | (1 << 11),
            tsc_offset: 0,
            tsc_deadline: 0,
            xmm: [[0; 2]; 16],
            interrupt_request: 0,
            virq_vector: 0,
            halted: false,
            pending_exception: None,
            store_table,
            core_id: self.core_id,
            hooks: HookState::default(),
            callbacks: self.callbacks.unwrap_or_else(|| Box::new(NoCallbacks)),
            features: self.features,
        };
        // Reset places CS at the top of the 4 GiB space.
        cpu.segs[R_CS].selector = 0xf000;
        cpu.segs[R_CS].base = 0xffff_0000;
        if self.long_mode {
            cpu.cr[0] |= CR0_PE_MASK;
            cpu.efer |= 1 << 8 | 1 << 10; // LME | LMA
            cpu.hflags |= HF_PE_MASK | HF_LMA_MASK | HF_CS64_MASK | HF_CS32_MASK | HF_SS32_MASK;
            cpu.segs[R_CS].selector = 0x8;
            cpu.segs[R_CS].base = 0;
            cpu.eip = 0;
        }
        Ok(cpu)
    }
}

impl Default for CoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    pub fn has_feature(&self, feature: X86Features) -> bool {
        self.features.contains(feature)
    }

    pub fn cpl(&self) -> u8 {
        (self.hflags & HF_CPL_MASK) as u8
    }

    pub fn set_cpl(&mut self, cpl: u8) {
        self.hflags = (self.hflags & !HF_CPL_MASK) | cpl as u64;
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags & IOPL_MASK) >> 12) as u8
    }

    pub fn protected_mode(&self) -> bool {
        self.hflags & HF_PE_MASK != 0
    }

    pub fn vm86(&self) -> bool {
        self.eflags & VM_MASK != 0
    }

    pub fn code64(&self) -> bool {
        self.hflags & HF_CS64_MASK != 0
    }

    /// MMU index for data accesses: user or supervisor, from CPL.
    pub fn mem_index(&self) -> u8 {
        if self.cpl() == 3 {
            1
        } else {
            0
        }
    }

    pub fn request_interrupt(&mut self, mask: u32) {
        self.interrupt_request |= mask;
    }

    fn clear_interrupt_pending(&mut self, mask: u32) {
        self.interrupt_request &= !mask;
    }

    /// The architectural EFLAGS word, with the lazy condition codes
    /// reconstructed.
    pub fn read_eflags(&self) -> u64 {
        let op = CcOp::from_bits(self.cc_op).unwrap_or(CcOp::Eflags);
        let cc = ccop::compute_all(op, self.cc_dst, self.cc_src) as u64;
        let df = if self.df < 0 { DF_MASK } else { 0 };
        (self.eflags & !(CC_MASK | DF_MASK)) | cc | df | 0x2
    }

    /// Writes EFLAGS under an update mask: the condition codes move into
    /// the lazy slots, DF becomes the stride, the rest merges into the
    /// stored word.
    pub fn write_eflags(&mut self, value: u64, update_mask: u64) {
        self.cc_src = value & CC_MASK;
        self.cc_op = CcOp::Eflags.to_bits();
        self.df = if value & DF_MASK != 0 { -1 } else { 1 };
        let keep = !(update_mask & !(CC_MASK | DF_MASK));
        self.eflags = (self.eflags & keep) | (value & update_mask & !(CC_MASK | DF_MASK)) | 0x2;
    }

    fn vector_for(&self, exception: Exception) -> u8 {
        match exception {
            Exception::DivideError => 0,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::IllegalInstruction => 6,
            Exception::GeneralProtection => 13,
            Exception::InstructionPageFault
            | Exception::LoadPageFault
            | Exception::StorePageFault => 14,
            Exception::InstructionAccessFault
            | Exception::LoadAccessFault
            | Exception::StoreAccessFault => 13,
            _ => 6,
        }
    }

    /// Delivers a trap to the guest. Real mode vectors through the IVT
    /// here; protected-mode delivery (descriptor walks, stack switches)
    /// belongs to the external segmentation collaborator, which picks the
    /// exception up from [`CpuState::pending_exception`].
    pub fn do_interrupt(&mut self, trap: &Trap, mem: &mut dyn GuestMemory) {
        if trap.exception == Exception::WaitForInterrupt {
            self.halted = true;
            return;
        }
        let (vector, error_code) = match trap.exception {
            Exception::EnvironmentCall => (trap.tval as u8, 0),
            Exception::GeneralProtection => (13, trap.tval as u32),
            other => (self.vector_for(other), 0),
        };
        if !self.protected_mode() {
            if let Err(inner) = self.deliver_real_mode(vector, mem) {
                log::error!("double fault delivering vector {}: {:?}", vector, inner);
            }
        } else {
            self.pending_exception = Some((vector, error_code));
        }
    }

    /// Classic IVT delivery: push FLAGS/CS/IP, clear IF/TF, vector through
    /// `idt.base + 4 * n`.
    fn deliver_real_mode(&mut self, vector: u8, mem: &mut dyn GuestMemory) -> Result<(), Trap> {
        let flags = self.read_eflags();
        self.push16(flags as u16, mem)?;
        let cs = self.segs[R_CS].selector;
        self.push16(cs, mem)?;
        self.push16(self.eip as u16, mem)?;
        self.eflags &= !(IF_MASK | TF_MASK | AC_MASK | RF_MASK);
        let entry = self.idt.base + vector as u64 * 4;
        let ip = mem.ld(entry, AccessSize::Word, 0)?;
        let cs = mem.ld(entry + 2, AccessSize::Word, 0)? as u16;
        self.segs[R_CS].selector = cs;
        self.segs[R_CS].base = (cs as u64) << 4;
        self.eip = ip;
        Ok(())
    }

    fn push16(&mut self, value: u16, mem: &mut dyn GuestMemory) -> Result<(), Trap> {
        let sp = (self.regs[R_ESP].wrapping_sub(2)) & 0xffff;
        self.regs[R_ESP] = (self.regs[R_ESP] & !0xffff) | sp;
        mem.st(self.segs[R_SS].base + sp, value as u64, AccessSize::Word, 0)
    }

    /// Decides whether a pending interrupt is taken, in priority order:
    /// INIT > SIPI > SMI > NMI > MCE > HARD > VIRQ. The STI shadow defers
    /// maskable interrupts exactly once.
    pub fn process_interrupt(&mut self, mem: &mut dyn GuestMemory) -> bool {
        let request = self.interrupt_request;
        if request & CPU_INTERRUPT_INIT != 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_INIT);
            self.apic_init_reset();
            self.halted = false;
            return true;
        }
        if request & CPU_INTERRUPT_SIPI != 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_SIPI);
            log::warn!("SIPI delivery is owned by the host APIC model");
            return true;
        }
        if self.hflags2 & HF2_GIF_MASK == 0 {
            return false;
        }
        if request & CPU_INTERRUPT_SMI != 0 && self.hflags & HF_SMM_MASK == 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_SMI);
            self.hflags |= HF_SMM_MASK;
            log::warn!("SMM entry is owned by the host");
            return true;
        }
        if request & CPU_INTERRUPT_NMI != 0 && self.hflags2 & HF2_NMI_MASK == 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_NMI);
            self.hflags2 |= HF2_NMI_MASK;
            self.halted = false;
            self.do_interrupt(&Trap::new(Exception::EnvironmentCall, 2), mem);
            return true;
        }
        if request & CPU_INTERRUPT_MCE != 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_MCE);
            self.do_interrupt(&Trap::new(Exception::EnvironmentCall, 18), mem);
            return true;
        }
        if self.hflags & HF_INHIBIT_IRQ_MASK != 0 {
            // The first instruction after STI runs with interrupts held
            // off exactly once.
            self.hflags &= !HF_INHIBIT_IRQ_MASK;
            return false;
        }
        if request & CPU_INTERRUPT_HARD != 0 {
            let virtualised = self.hflags2 & HF2_VINTR_MASK != 0;
            let gated = if virtualised {
                self.hflags2 & HF2_HIF_MASK != 0
            } else {
                self.eflags & IF_MASK != 0
            };
            if gated {
                let intno = self.callbacks.get_pending_interrupt();
                self.clear_interrupt_pending(CPU_INTERRUPT_HARD | CPU_INTERRUPT_VIRQ);
                if intno >= 0 {
                    self.halted = false;
                    self.do_interrupt(&Trap::new(Exception::EnvironmentCall, intno as u64), mem);
                    return true;
                }
                return false;
            }
        }
        if request & CPU_INTERRUPT_VIRQ != 0 && self.eflags & IF_MASK != 0 {
            self.clear_interrupt_pending(CPU_INTERRUPT_VIRQ);
            let vector = self.virq_vector;
            self.halted = false;
            self.do_interrupt(&Trap::new(Exception::EnvironmentCall, vector as u64), mem);
            return true;
        }
        false
    }

    fn apic_init_reset(&mut self) {
        self.apic_state = (0xfee00 << 12) | (1 << 11);
    }

    pub fn cpu_set_apic_base(&mut self, value: u64) {
        self.apic_state = value;
        self.callbacks.set_apic_base_value(value);
    }

    fn tsc(&mut self) -> u64 {
        self.callbacks.get_instruction_count().wrapping_add(self.tsc_offset)
    }

    fn cpuid(&mut self) {
        let leaf = self.regs[R_EAX] as u32;
        let (a, b, c, d) = match leaf {
            0 => (1, u32::from_le_bytes(*b"Genu"), u32::from_le_bytes(*b"ntel"), u32::from_le_bytes(*b"ineI")),
            1 => {
                let mut edx: u32 = 1 << 0 | 1 << 8 | 1 << 5; // FPU, CX8, MSR
                let mut ecx: u32 = 0;
                if self.features.contains(X86Features::TSC) {
                    edx |= 1 << 4;
                }
                if self.features.contains(X86Features::CMOV) {
                    edx |= 1 << 15;
                }
                if self.features.contains(X86Features::CLFLUSH) {
                    edx |= 1 << 19;
                }
                if self.features.contains(X86Features::SSE) {
                    edx |= 1 << 25;
                }
                if self.features.contains(X86Features::SSE2) {
                    edx |= 1 << 26;
                }
                if self.features.contains(X86Features::SSE3) {
                    ecx |= 1 << 0;
                }
                if self.features.contains(X86Features::MONITOR) {
                    ecx |= 1 << 3;
                }
                if self.features.contains(X86Features::SSSE3) {
                    ecx |= 1 << 9;
                }
                if self.features.contains(X86Features::CX16) {
                    ecx |= 1 << 13;
                }
                if self.features.contains(X86Features::SSE41) {
                    ecx |= 1 << 19;
                }
                if self.features.contains(X86Features::SSE42) {
                    ecx |= 1 << 20;
                }
                if self.features.contains(X86Features::POPCNT) {
                    ecx |= 1 << 23;
                }
                if self.features.contains(X86Features::AES) {
                    ecx |= 1 << 25;
                }
                (0x0006_00f1, 0, ecx, edx)
            }
            0x8000_0000 => (0x8000_0001, 0, 0, 0),
            0x8000_0001 => {
                let mut ecx: u32 = 0;
                let mut edx: u32 = 0;
                if self.features.contains(X86Features::LAHF_LM) {
                    ecx |= 1 << 0;
                }
                if self.features.contains(X86Features::SVM) {
                    ecx |= 1 << 2;
                }
                if self.features.contains(X86Features::THREEDNOW) {
                    edx |= 1 << 31;
                }
                if self.features.contains(X86Features::RDTSCP) {
                    edx |= 1 << 27;
                }
                if self.features.contains(X86Features::SYSCALL) {
                    edx |= 1 << 11;
                }
                (0, 0, ecx, edx)
            }
            _ => (0, 0, 0, 0),
        };
        self.regs[R_EAX] = a as u64;
        self.regs[R_EBX] = b as u64;
        self.regs[R_ECX] = c as u64;
        self.regs[R_EDX] = d as u64;
    }

    fn rdmsr(&mut self) -> u64 {
        let index = self.regs[R_ECX] as u32;
        match index {
            MSR_EFER => self.efer,
            MSR_STAR => self.star,
            MSR_LSTAR => self.lstar,
            MSR_CSTAR => self.cstar,
            MSR_FMASK => self.fmask,
            MSR_FSBASE => self.segs[R_FS].base,
            MSR_GSBASE => self.segs[R_GS].base,
            MSR_KERNELGSBASE => self.kernel_gs_base,
            MSR_IA32_SYSENTER_CS => self.sysenter_cs,
            MSR_IA32_SYSENTER_ESP => self.sysenter_esp,
            MSR_IA32_SYSENTER_EIP => self.sysenter_eip,
            MSR_IA32_APICBASE => self.apic_state,
            MSR_IA32_TSC_DEADLINE => self.tsc_deadline,
            0x10 => self.tsc(),
            0x277 => self.pat,
            _ => {
                log::warn!("rdmsr of unhandled MSR {:#x}", index);
                0
            }
        }
    }

    fn wrmsr(&mut self) {
        let index = self.regs[R_ECX] as u32;
        let value = (self.regs[R_EAX] & 0xffff_ffff) | (self.regs[R_EDX] << 32);
        match index {
            MSR_EFER => self.efer = value,
            MSR_STAR => self.star = value,
            MSR_LSTAR => self.lstar = value,
            MSR_CSTAR => self.cstar = value,
            MSR_FMASK => self.fmask = value,
            MSR_FSBASE => self.segs[R_FS].base = value,
            MSR_GSBASE => self.segs[R_GS].base = value,
            MSR_KERNELGSBASE => self.kernel_gs_base = value,
            MSR_IA32_SYSENTER_CS => self.sysenter_cs = value,
            MSR_IA32_SYSENTER_ESP => self.sysenter_esp = value,
            MSR_IA32_SYSENTER_EIP => self.sysenter_eip = value,
            MSR_IA32_APICBASE => self.cpu_set_apic_base(value),
            MSR_IA32_TSC_DEADLINE => {
                self.tsc_deadline = value;
                self.callbacks.set_tsc_deadline_value(value);
            }
            0x277 => self.pat = value,
            _ => log::warn!("wrmsr of unhandled MSR {:#x} (value {:#x})", index, value),
        }
    }

    fn set_reg16(&mut self, reg: usize, value: u16) {
        self.regs[reg] = (self.regs[reg] & !0xffff) | value as u64;
    }

    fn div_trap(&self) -> Trap {
        Trap::bare(Exception::DivideError)
    }

    fn helper_div(&mut self, size: AccessSize, divisor: u64, signed: bool) -> Result<(), Trap> {
        match size {
            AccessSize::Byte => {
                let num = self.regs[R_EAX] & 0xffff;
                let den = divisor & 0xff;
                if signed {
                    let num = num as u16 as i16 as i64;
                    let den = den as u8 as i8 as i64;
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q != q as i8 as i64 {
                        return Err(self.div_trap());
                    }
                    self.set_reg16(R_EAX, ((q as u8 as u16) | ((r as u8 as u16) << 8)) as u16);
                } else {
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q > 0xff {
                        return Err(self.div_trap());
                    }
                    self.set_reg16(R_EAX, (q as u16) | ((r as u16) << 8));
                }
            }
            AccessSize::Word => {
                let num = (self.regs[R_EAX] & 0xffff) | ((self.regs[R_EDX] & 0xffff) << 16);
                let den = divisor & 0xffff;
                if signed {
                    let num = num as u32 as i32 as i64;
                    let den = den as u16 as i16 as i64;
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q != q as i16 as i64 {
                        return Err(self.div_trap());
                    }
                    self.set_reg16(R_EAX, q as u16);
                    self.set_reg16(R_EDX, r as u16);
                } else {
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q > 0xffff {
                        return Err(self.div_trap());
                    }
                    self.set_reg16(R_EAX, q as u16);
                    self.set_reg16(R_EDX, r as u16);
                }
            }
            AccessSize::Long => {
                let num = (self.regs[R_EAX] & 0xffff_ffff) | ((self.regs[R_EDX] & 0xffff_ffff) << 32);
                let den = divisor & 0xffff_ffff;
                if signed {
                    let num = num as i64;
                    let den = den as u32 as i32 as i64;
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q != q as i32 as i64 {
                        return Err(self.div_trap());
                    }
                    // 32-bit destinations zero the upper halves.
                    self.regs[R_EAX] = q as u32 as u64;
                    self.regs[R_EDX] = r as u32 as u64;
                } else {
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q > 0xffff_ffff {
                        return Err(self.div_trap());
                    }
                    self.regs[R_EAX] = q as u32 as u64;
                    self.regs[R_EDX] = r as u32 as u64;
                }
            }
            AccessSize::Quad => {
                let num = ((self.regs[R_EDX] as u128) << 64) | self.regs[R_EAX] as u128;
                if signed {
                    let num = num as i128;
                    let den = divisor as i64 as i128;
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q != q as i64 as i128 {
                        return Err(self.div_trap());
                    }
                    self.regs[R_EAX] = q as u64;
                    self.regs[R_EDX] = r as u64;
                } else {
                    let den = divisor as u128;
                    if den == 0 {
                        return Err(self.div_trap());
                    }
                    let q = num / den;
                    let r = num % den;
                    if q > u64::MAX as u128 {
                        return Err(self.div_trap());
                    }
                    self.regs[R_EAX] = q as u64;
                    self.regs[R_EDX] = r as u64;
                }
            }
        }
        Ok(())
    }
}

impl CpuEnv for CpuState {
    fn read_global(&self, id: u16) -> u64 {
        match id {
            globals::REG_BASE..=15 => self.regs[id as usize],
            globals::EIP => self.eip,
            globals::CC_OP => self.cc_op as u64,
            globals::CC_SRC => self.cc_src,
            globals::CC_DST => self.cc_dst,
            globals::CC_TMP => self.cc_tmp,
            globals::DF => self.df as u64,
            globals::SEG_BASE..=29 => self.segs[(id - globals::SEG_BASE) as usize].base,
            globals::XMM_BASE..=63 => {
                let slot = (id - globals::XMM_BASE) as usize;
                self.xmm[slot / 2][slot % 2]
            }
            _ => {
                log::error!("read of unknown x86 global {}", id);
                0
            }
        }
    }

    fn write_global(&mut self, id: u16, value: u64) {
        match id {
            globals::REG_BASE..=15 => self.regs[id as usize] = value,
            globals::EIP => self.eip = value,
            globals::CC_OP => self.cc_op = value as u32,
            globals::CC_SRC => self.cc_src = value,
            globals::CC_DST => self.cc_dst = value,
            globals::CC_TMP => self.cc_tmp = value,
            globals::DF => self.df = value as i64,
            globals::SEG_BASE..=29 => self.segs[(id - globals::SEG_BASE) as usize].base = value,
            globals::XMM_BASE..=63 => {
                let slot = (id - globals::XMM_BASE) as usize;
                self.xmm[slot / 2][slot % 2] = value;
            }
            _ => log::error!("write of unknown x86 global {}", id),
        }
    }

    fn call_helper(
        &mut self,
        helper: HelperId,
        args: &[u64],
        _mem: &mut dyn GuestMemory,
    ) -> Result<Option<u64>, Trap> {
        match helper {
            HelperId::RaiseException => {
                let vector = args[0] as u8;
                Err(match vector {
                    0 => Trap::bare(Exception::DivideError),
                    3 => Trap::bare(Exception::Breakpoint),
                    4 => Trap::bare(Exception::Overflow),
                    13 => Trap::new(Exception::GeneralProtection, 0),
                    _ => Trap::bare(Exception::IllegalInstruction),
                })
            }
            HelperId::RaiseExceptionBadAddr => {
                Err(Trap::new(Exception::GeneralProtection, args[1]))
            }

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

            HelperId::CcComputeAll => {
                let op = CcOp::from_bits(args[0] as u32).unwrap_or(CcOp::Eflags);
                Ok(Some(ccop::compute_all(op, self.cc_dst, self.cc_src) as u64))
            }
            HelperId::CcComputeC => {
                let op = CcOp::from_bits(args[0] as u32).unwrap_or(CcOp::Eflags);
                Ok(Some(ccop::compute_c(op, self.cc_dst, self.cc_src) as u64))
            }
            HelperId::ReadEflags => Ok(Some(self.read_eflags())),
            HelperId::WriteEflags => {
                self.write_eflags(args[0], args[1]);
                Ok(None)
            }
            HelperId::Cli => {
                self.eflags &= !IF_MASK;
                Ok(None)
            }
            HelperId::Sti => {
                self.eflags |= IF_MASK;
                Ok(None)
            }
            HelperId::SetInhibitIrq => {
                if args[0] != 0 {
                    self.hflags |= HF_INHIBIT_IRQ_MASK;
                } else {
                    self.hflags &= !HF_INHIBIT_IRQ_MASK;
                }
                Ok(None)
            }

            HelperId::Inb => Ok(Some(self.callbacks.read_byte_from_port(args[0] as u16) as u64)),
            HelperId::Inw => Ok(Some(self.callbacks.read_word_from_port(args[0] as u16) as u64)),
            HelperId::Inl => Ok(Some(
                self.callbacks.read_double_word_from_port(args[0] as u16) as u64,
            )),
            HelperId::Outb => {
                self.callbacks.write_byte_to_port(args[0] as u16, args[1] as u8);
                Ok(None)
            }
            HelperId::Outw => {
                self.callbacks.write_word_to_port(args[0] as u16, args[1] as u16);
                Ok(None)
            }
            HelperId::Outl => {
                self.callbacks
                    .write_double_word_to_port(args[0] as u16, args[1] as u32);
                Ok(None)
            }
            HelperId::CheckIo => {
                // The TSS permission bitmap lives with the external
                // segmentation collaborator; a core that gets here was
                // denied by CPL/IOPL.
                log::warn!("port {:#x} access denied at CPL {}", args[0], self.cpl());
                Err(Trap::new(Exception::GeneralProtection, 0))
            }
            HelperId::Hlt => {
                self.eip = args[0];
                Err(Trap::bare(Exception::WaitForInterrupt))
            }
            HelperId::Cpuid => {
                self.cpuid();
                Ok(None)
            }
            HelperId::Rdtsc => {
                if self.cr[4] & CR4_TSD_MASK != 0 && self.cpl() != 0 {
                    return Err(Trap::new(Exception::GeneralProtection, 0));
                }
                let tsc = self.tsc();
                self.regs[R_EAX] = tsc & 0xffff_ffff;
                self.regs[R_EDX] = tsc >> 32;
                Ok(None)
            }
            HelperId::Rdtscp => {
                let tsc = self.tsc();
                self.regs[R_EAX] = tsc & 0xffff_ffff;
                self.regs[R_EDX] = tsc >> 32;
                self.regs[R_ECX] = self.core_id as u64;
                Ok(None)
            }
            HelperId::Rdmsr => {
                let value = self.rdmsr();
                self.regs[R_EAX] = value & 0xffff_ffff;
                self.regs[R_EDX] = value >> 32;
                Ok(None)
            }
            HelperId::Wrmsr => {
                self.wrmsr();
                Ok(None)
            }
            HelperId::Divb => self.helper_div(AccessSize::Byte, args[0], false).map(|_| None),
            HelperId::Divw => self.helper_div(AccessSize::Word, args[0], false).map(|_| None),
            HelperId::Divl => self.helper_div(AccessSize::Long, args[0], false).map(|_| None),
            HelperId::Divq => self.helper_div(AccessSize::Quad, args[0], false).map(|_| None),
            HelperId::Idivb => self.helper_div(AccessSize::Byte, args[0], true).map(|_| None),
            HelperId::Idivw => self.helper_div(AccessSize::Word, args[0], true).map(|_| None),
            HelperId::Idivl => self.helper_div(AccessSize::Long, args[0], true).map(|_| None),
            HelperId::Idivq => self.helper_div(AccessSize::Quad, args[0], true).map(|_| None),
            HelperId::IntN => {
                self.eip = args[1];
                Err(Trap::new(Exception::EnvironmentCall, args[0]))
            }
            HelperId::OpcodeCount => {
                self.hooks.record_opcode(args[0] as u8);
                Ok(None)
            }
            HelperId::Monitor => Ok(None),
            HelperId::Mwait => {
                // Treated as an architectural NOP.
                Ok(None)
            }
            HelperId::SvmDispatch => {
                log::warn!("SVM world switch requested (op {:#x}); delegated", args[0]);
                Err(Trap::bare(Exception::IllegalInstruction))
            }
            HelperId::LoadSeg => {
                let seg = args[0] as usize;
                let selector = args[1] as u16;
                self.segs[seg].selector = selector;
                if !self.protected_mode() || self.vm86() {
                    self.segs[seg].base = (selector as u64) << 4;
                } else {
                    // Descriptor walks belong to the external segmentation
                    // collaborator; model a flat segment here.
                    log::debug!("flat descriptor load for segment {} <- {:#x}", seg, selector);
                    self.segs[seg].base = 0;
                }
                Ok(None)
            }
            HelperId::SegSelector => Ok(Some(self.segs[args[0] as usize].selector as u64)),
            HelperId::ReadCr => Ok(Some(self.cr[args[0] as usize])),
            HelperId::WriteCr => {
                let index = args[0] as usize;
                self.cr[index] = args[1];
                if index == 0 {
                    if args[1] & CR0_PE_MASK != 0 {
                        self.hflags |= HF_PE_MASK;
                    } else {
                        self.hflags &= !HF_PE_MASK;
                    }
                }
                Ok(None)
            }
            HelperId::ReadDr => Ok(Some(self.dr[args[0] as usize])),
            HelperId::WriteDr => {
                self.dr[args[0] as usize] = args[1];
                Ok(None)
            }
            HelperId::LoadDtr => {
                let table = if args[0] != 0 { &mut self.idt } else { &mut self.gdt };
                table.base = args[1];
                table.limit = args[2] as u16;
                Ok(None)
            }
            HelperId::DtrBase => Ok(Some(if args[0] != 0 { self.idt.base } else { self.gdt.base })),
            HelperId::DtrLimit => Ok(Some(if args[0] != 0 {
                self.idt.limit as u64
            } else {
                self.gdt.limit as u64
            })),
            HelperId::Swapgs => {
                std::mem::swap(&mut self.segs[R_GS].base, &mut self.kernel_gs_base);
                Ok(None)
            }
            HelperId::Syscall => {
                if self.efer & 1 == 0 {
                    // EFER.SCE off.
                    return Err(Trap::bare(Exception::IllegalInstruction));
                }
                self.regs[R_ECX] = args[0];
                self.regs[11] = self.read_eflags();
                let mask = self.fmask;
                let flags = self.read_eflags() & !mask;
                self.write_eflags(flags, u64::MAX);
                self.eip = self.lstar;
                self.set_cpl(0);
                Ok(None)
            }
            HelperId::Sysret => {
                if self.cpl() != 0 {
                    return Err(Trap::new(Exception::GeneralProtection, 0));
                }
                self.eip = self.regs[R_ECX];
                let flags = self.regs[11];
                self.write_eflags(flags, u64::MAX);
                self.set_cpl(3);
                Ok(None)
            }
            HelperId::Sysenter => {
                if self.sysenter_cs == 0 {
                    return Err(Trap::new(Exception::GeneralProtection, 0));
                }
                self.eflags &= !(IF_MASK | VM_MASK);
                self.regs[R_ESP] = self.sysenter_esp;
                self.eip = self.sysenter_eip;
                self.set_cpl(0);
                Ok(None)
            }
            HelperId::Sysexit => {
                if self.sysenter_cs == 0 || self.cpl() != 0 {
                    return Err(Trap::new(Exception::GeneralProtection, 0));
                }
                self.regs[R_ESP] = self.regs[R_ECX];
                self.eip = self.regs[R_EDX];
                self.set_cpl(3);
                Ok(None)
            }

            other => unreachable!("not an x86 helper: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FlatMemory;

    fn real_mode_core() -> CpuState {
        CoreBuilder::new().build().unwrap()
    }

    #[test]
    fn eflags_round_trip_through_lazy_slots() {
        let mut cpu = real_mode_core();
        cpu.write_eflags(IF_MASK | DF_MASK | (CC_Z | CC_C) as u64, u64::MAX);
        assert_eq!(cpu.df, -1);
        assert_eq!(cpu.cc_op, CcOp::Eflags.to_bits());
        let flags = cpu.read_eflags();
        assert_ne!(flags & IF_MASK, 0);
        assert_ne!(flags & DF_MASK, 0);
        assert_ne!(flags & CC_Z as u64, 0);
        assert_ne!(flags & CC_C as u64, 0);
        assert_ne!(flags & 0x2, 0);
    }

    #[test]
    fn real_mode_interrupt_vectors_through_ivt() {
        let mut cpu = real_mode_core();
        let mut mem = FlatMemory::new(0, 0x2000);
        // IVT entry 6: ip = 0x1234, cs = 0x0100.
        mem.write(6 * 4, &[0x34, 0x12, 0x00, 0x01]);
        cpu.segs[R_SS].base = 0x1000;
        cpu.regs[R_ESP] = 0x100;
        cpu.eip = 0x42;
        cpu.eflags |= IF_MASK;
        cpu.do_interrupt(&Trap::bare(Exception::IllegalInstruction), &mut mem);
        assert_eq!(cpu.eip, 0x1234);
        assert_eq!(cpu.segs[R_CS].selector, 0x0100);
        assert_eq!(cpu.segs[R_CS].base, 0x1000);
        assert_eq!(cpu.eflags & IF_MASK, 0);
        // The old IP sits on top of the stack.
        assert_eq!(mem.ld(0x1000 + 0xfa, AccessSize::Word, 0).unwrap(), 0x42);
    }

    #[test]
    fn sti_shadow_defers_hard_interrupts_once() {
        let mut cpu = real_mode_core();
        let mut mem = FlatMemory::new(0, 0x2000);
        cpu.eflags |= IF_MASK;
        cpu.hflags |= HF_INHIBIT_IRQ_MASK;
        cpu.request_interrupt(CPU_INTERRUPT_HARD);
        assert!(!cpu.process_interrupt(&mut mem));
        assert_eq!(cpu.hflags & HF_INHIBIT_IRQ_MASK, 0);
        // Next boundary takes the interrupt (none pending from callbacks
        // means it is simply consumed).
        assert!(!cpu.process_interrupt(&mut mem));
    }

    #[test]
    fn nmi_sets_the_nmi_latch() {
        let mut cpu = real_mode_core();
        let mut mem = FlatMemory::new(0, 0x2000);
        cpu.segs[R_SS].base = 0x1000;
        cpu.regs[R_ESP] = 0x100;
        cpu.request_interrupt(CPU_INTERRUPT_NMI);
        assert!(cpu.process_interrupt(&mut mem));
        assert_ne!(cpu.hflags2 & HF2_NMI_MASK, 0);
        // A second NMI is held off until the latch clears.
        cpu.request_interrupt(CPU_INTERRUPT_NMI);
        assert!(!cpu.process_interrupt(&mut mem));
    }

    #[test]
    fn interrupts_respect_gif() {
        let mut cpu = real_mode_core();
        let mut mem = FlatMemory::new(0, 0x2000);
        cpu.hflags2 &= !HF2_GIF_MASK;
        cpu.request_interrupt(CPU_INTERRUPT_NMI);
        assert!(!cpu.process_interrupt(&mut mem));
    }

    #[test]
    fn divide_overflow_raises_de() {
        let mut cpu = real_mode_core();
        cpu.regs[R_EAX] = 0x1_0000;
        cpu.regs[R_EDX] = 0x1;
        // 0x1_0000_0000 / 1 overflows a 32-bit quotient.
        cpu.regs[R_EAX] = 0;
        let trap = cpu.helper_div(AccessSize::Long, 1, false).unwrap_err();
        assert_eq!(trap.exception, Exception::DivideError);
        let trap = cpu.helper_div(AccessSize::Long, 0, false).unwrap_err();
        assert_eq!(trap.exception, Exception::DivideError);
    }

    #[test]
    fn unsigned_divide_splits_quotient_and_remainder() {
        let mut cpu = real_mode_core();
        cpu.regs[R_EAX] = 100;
        cpu.regs[R_EDX] = 0;
        cpu.helper_div(AccessSize::Long, 7, false).unwrap();
        assert_eq!(cpu.regs[R_EAX], 14);
        assert_eq!(cpu.regs[R_EDX], 2);
    }
}
