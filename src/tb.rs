//! This module provides the translation-block model and the generic
//! decode-translate loop that drives each architecture's front-end.

/// The unit of translated guest code: a straight-line run terminated by a
/// control transfer, a privilege-mode change, or a page boundary. Blocks are
/// owned and invalidated by the translation cache, an external collaborator.
#[derive(Clone, Debug)]
pub struct TranslationBlock {
    /// Guest PC of the first instruction.
    pub pc: u64,
    /// Code-segment base added to `pc` on x86; zero elsewhere.
    pub cs_base: u64,
    /// Front-end-specific mode flags (code size, privilege, inhibit bits)
    /// baked into the generated code.
    pub flags: u64,
    /// Guest bytes covered by the block.
    pub size: u32,
    /// Guest instructions in the block.
    pub icount: u32,
    /// Direct-jump chaining targets for the two `goto_tb` slots.
    pub jmp_target: [Option<u64>; 2],
    /// When set, the cache must not chain into this block; the successor is
    /// re-resolved through the dispatcher (set after CSR writes and other
    /// mode changes).
    pub no_chain: bool,
}

impl TranslationBlock {
    pub fn new(pc: u64, cs_base: u64, flags: u64) -> Self {
        Self {
            pc,
            cs_base,
            flags,
            size: 0,
            icount: 0,
            jmp_target: [None, None],
            no_chain: false,
        }
    }
}

/// TB termination reason set while translating one instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DisasJumpType {
    /// Continue to the next sequential instruction.
    Next,
    /// Reached the per-block instruction budget.
    TooMany,
    /// A conditional branch ended the block.
    Branch,
    /// The block must stop for a mode change, CSR write, or exception.
    Stop,
    /// An unconditional direct jump ended the block (chainable).
    TbJump,
    /// The next instruction would cross a page boundary.
    PageCross,
}

impl DisasJumpType {
    /// Whether translation of this block is over.
    pub fn is_terminal(self) -> bool {
        self != DisasJumpType::Next
    }
}

/// Base disassembly state shared by all front-ends.
#[derive(Clone, Debug)]
pub struct DisasContextBase {
    /// PC of the first instruction in the block.
    pub pc_first: u64,
    /// PC of the next byte to fetch.
    pub pc_next: u64,
    pub is_jmp: DisasJumpType,
    pub num_insns: u32,
    pub max_insns: u32,
    /// MMU index for data accesses, derived from CPL / privilege mode.
    pub mem_idx: u8,
}

impl DisasContextBase {
    pub fn new(pc: u64, max_insns: u32, mem_idx: u8) -> Self {
        Self {
            pc_first: pc,
            pc_next: pc,
            is_jmp: DisasJumpType::Next,
            num_insns: 0,
            max_insns,
            mem_idx,
        }
    }
}

/// Per-architecture translation hooks. The implementing translator owns its
/// disassembly context and IR builder; the loop below only sequences them.
pub trait TranslatorOps {
    /// Called once at the start of the block.
    fn tb_start(&mut self);

    /// Emits the `insn_start` marker for the current guest PC.
    fn insn_start(&mut self);

    /// Decodes and translates one guest instruction, advancing
    /// `base().pc_next` and setting `base().is_jmp` when the instruction
    /// terminates the block.
    fn translate_insn(&mut self);

    /// Emits the block epilogue (fall-through exit or chained jump).
    fn tb_stop(&mut self);

    fn base(&self) -> &DisasContextBase;

    fn base_mut(&mut self) -> &mut DisasContextBase;
}

/// Drives the decode-translate cycle for one translation block.
pub fn translator_loop<T: TranslatorOps>(translator: &mut T) {
    translator.tb_start();

    loop {
        translator.insn_start();
        translator.translate_insn();

        let base = translator.base();
        if base.is_jmp.is_terminal() {
            break;
        }
        if base.num_insns >= base.max_insns {
            translator.base_mut().is_jmp = DisasJumpType::TooMany;
            break;
        }
    }

    translator.tb_stop();
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        base: DisasContextBase,
        stops: u32,
    }

    impl TranslatorOps for Counting {
        fn tb_start(&mut self) {}

        fn insn_start(&mut self) {
            self.base.num_insns += 1;
        }

        fn translate_insn(&mut self) {
            self.base.pc_next += 4;
        }

        fn tb_stop(&mut self) {
            self.stops += 1;
        }

        fn base(&self) -> &DisasContextBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut DisasContextBase {
            &mut self.base
        }
    }

    #[test]
    fn loop_honours_instruction_budget() {
        let mut t = Counting {
            base: DisasContextBase::new(0x1000, 3, 0),
            stops: 0,
        };
        translator_loop(&mut t);
        assert_eq!(t.base.num_insns, 3);
        assert_eq!(t.base.is_jmp, DisasJumpType::TooMany);
        assert_eq!(t.base.pc_next, 0x100c);
        assert_eq!(t.stops, 1);
    }
}
