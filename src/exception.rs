//! This module provides the guest-architectural exception model.
//!
//! Guest exceptions are not host errors: a translated block that traps has
//! behaved correctly by raising the exception the ISA mandates. Runtime
//! helpers therefore signal exceptions through `Result<_, Trap>` and the
//! dispatcher catches the [`Trap`] at the translation-block boundary, the
//! structured equivalent of the longjmp unwinding in the original scheme.

/// An architectural exception, named abstractly; each front-end maps these
/// onto its own cause numbers (RISC-V `mcause`) or vectors (x86).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Exception {
    /// The opcode does not decode in the current mode, or a required
    /// extension is disabled.
    IllegalInstruction,
    /// Control transfer to a misaligned target without compressed-instruction
    /// support.
    InstructionAddressMisaligned,
    /// Instruction fetch failed the access check.
    InstructionAccessFault,
    /// Data load failed the access check.
    LoadAccessFault,
    /// Data store (or AMO) failed the access check.
    StoreAccessFault,
    /// Instruction fetch page fault.
    InstructionPageFault,
    /// Data load page fault.
    LoadPageFault,
    /// Data store (or AMO) page fault.
    StorePageFault,
    /// Misaligned data load on a target that traps on misalignment.
    LoadAddressMisaligned,
    /// Misaligned data store on a target that traps on misalignment.
    StoreAddressMisaligned,
    /// An instrumented `ebreak` / `int3`.
    Breakpoint,
    /// Environment call (`ecall` / software interrupt).
    EnvironmentCall,
    /// x86 `#DE`: division by zero or quotient overflow.
    DivideError,
    /// x86 `#OF`.
    Overflow,
    /// x86 `#GP`. The trap value carries the error code.
    GeneralProtection,
    /// Host requested a stop (e.g. `WFI`); not delivered to the guest.
    WaitForInterrupt,
}

/// A pending guest trap: the exception plus the value reported to the guest
/// (`mtval` on RISC-V, the error code on x86 where one applies).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Trap {
    pub exception: Exception,
    pub tval: u64,
}

impl Trap {
    pub fn new(exception: Exception, tval: u64) -> Self {
        Self { exception, tval }
    }

    /// A trap with no additional reported value.
    pub fn bare(exception: Exception) -> Self {
        Self { exception, tval: 0 }
    }

    /// Whether this trap is a synchronous memory fault, i.e. one the memory
    /// interface may raise mid-instruction.
    pub fn is_memory_fault(&self) -> bool {
        matches!(
            self.exception,
            Exception::LoadAccessFault
                | Exception::StoreAccessFault
                | Exception::LoadPageFault
                | Exception::StorePageFault
                | Exception::LoadAddressMisaligned
                | Exception::StoreAddressMisaligned
        )
    }
}
