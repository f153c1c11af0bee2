//! This module provides the RISC-V decoder and micro-op emitter. One
//! [`RiscvTranslator`] is constructed per translation block; it owns the
//! disassembly context and the IR builder, fetches parcels through the
//! guest memory interface, and emits IR that the back-end lowers.

use crate::backend::BackendCaps;
use crate::hst;
use crate::ir::{BinOp, Cond, HelperId, IrBuilder, Op, Temp, UnOp};
use crate::memory::{AccessSize, GuestMemory};
use crate::tb::{translator_loop, DisasContextBase, DisasJumpType, TranslationBlock, TranslatorOps};

use super::{
    compressed, excp, globals, AdditionalFeatures, CpuState, PrivilegeMode, RiscvFeatures, Xlen,
    MSTATUS_FS,
};

const TARGET_PAGE_BITS: u32 = 12;
const TARGET_PAGE_MASK: u64 = !((1 << TARGET_PAGE_BITS) - 1);

/// Per-block translator state: the disassembly context plus the register
/// temporaries, which live on the builder rather than in process globals.
pub struct RiscvTranslator<'a> {
    pub(crate) cpu: &'a CpuState,
    pub(crate) mem: &'a mut dyn GuestMemory,
    pub(crate) caps: BackendCaps,
    pub(crate) base: DisasContextBase,
    pub(crate) ir: IrBuilder,
    pub(crate) tb: TranslationBlock,
    gpr: [Temp; 32],
    fpr: [Temp; 32],
    pc_global: Temp,
    opcode_global: Temp,
    vill_global: Temp,
    mstatus_global: Temp,
    /// Raw bits of the instruction being translated.
    pub(crate) opcode: u64,
    insn_len: u32,
}

/// Decides the instruction length from the first 16-bit parcel.
/// Returns 0 for the reserved (>= 192-bit) encodings.
pub fn decode_instruction_length(first_parcel: u16) -> u32 {
    if first_parcel & 0b11 != 0b11 {
        2
    } else if first_parcel & 0b11100 != 0b11100 {
        4
    } else if first_parcel & 0b111111 == 0b011111 {
        6
    } else if first_parcel & 0b1111111 == 0b0111111 {
        8
    } else if (first_parcel >> 12) & 0b111 != 0b111 {
        10 + 2 * ((first_parcel >> 12) & 0b111) as u32
    } else {
        0
    }
}

/// Width-truncates an opcode to its instruction length for fault reporting.
fn format_opcode(opcode: u64, length: u32) -> u64 {
    if length >= 8 {
        opcode
    } else {
        opcode & ((1u64 << (8 * length)) - 1)
    }
}

/// Translates one block starting at `pc`, returning the block descriptor
/// and the finished op list.
pub fn translate_block(
    cpu: &CpuState,
    mem: &mut dyn GuestMemory,
    caps: BackendCaps,
    pc: u64,
    max_insns: u32,
) -> (TranslationBlock, Vec<Op>) {
    let mut ir = IrBuilder::new();
    let mut gpr = [Temp(0); 32];
    for (i, slot) in gpr.iter_mut().enumerate() {
        *slot = ir.global(globals::GPR_BASE + i as u16);
    }
    let mut fpr = [Temp(0); 32];
    for (i, slot) in fpr.iter_mut().enumerate() {
        *slot = ir.global(globals::FPR_BASE + i as u16);
    }
    let pc_global = ir.global(globals::PC);
    let opcode_global = ir.global(globals::OPCODE);
    let vill_global = ir.global(globals::VILL);
    let mstatus_global = ir.global(globals::MSTATUS);

    let mut translator = RiscvTranslator {
        base: DisasContextBase::new(pc, max_insns, cpu.mem_index()),
        tb: TranslationBlock::new(pc, 0, cpu.privilege as u64),
        cpu,
        mem,
        caps,
        ir,
        gpr,
        fpr,
        pc_global,
        opcode_global,
        vill_global,
        mstatus_global,
        opcode: 0,
        insn_len: 4,
    };
    translator_loop(&mut translator);

    let mut tb = translator.tb;
    tb.size = (translator.base.pc_next - pc) as u32;
    tb.icount = translator.base.num_insns;
    tb.no_chain = translator.base.is_jmp == DisasJumpType::Stop;
    (tb, translator.ir.finish())
}

impl TranslatorOps for RiscvTranslator<'_> {
    fn tb_start(&mut self) {}

    fn insn_start(&mut self) {
        let pc = self.base.pc_next;
        self.ir.gen_insn_start(pc);
        self.base.num_insns += 1;
    }

    fn translate_insn(&mut self) {
        let pc = self.base.pc_next;
        let parcel = match self.mem.lduw_code(pc) {
            Ok(parcel) => parcel,
            Err(trap) => {
                self.gen_fetch_fault(trap.tval);
                return;
            }
        };
        let length = decode_instruction_length(parcel);
        self.insn_len = if length == 0 { 4 } else { length };

        // Fetch the remaining parcels before anything is emitted so the
        // hooks and fault paths see the whole opcode.
        self.opcode = match length {
            2 => parcel as u64,
            4 | 0 => match self.mem.ldl_code(pc) {
                Ok(word) => word as u64,
                Err(trap) => {
                    self.gen_fetch_fault(trap.tval);
                    return;
                }
            },
            _ => match self.mem.ldq_code(pc) {
                Ok(word) => format_opcode(word, length.min(8)),
                Err(trap) => {
                    self.gen_fetch_fault(trap.tval);
                    return;
                }
            },
        };

        if self.cpu.hooks.pre_opcode_hook.is_some() {
            let pc_c = self.ir.constant(pc);
            let op_c = self.ir.constant(self.opcode);
            self.ir.gen_helper(HelperId::PreOpcodeHook, None, &[pc_c, op_c]);
        }

        match length {
            2 => {
                if parcel == 0 {
                    // An all-zeros parcel is defined illegal.
                    self.kill_unknown();
                } else if self.ensure_extension(RiscvFeatures::RVC) {
                    match compressed::expand(parcel, self.cpu.xlen) {
                        Ok(word) => self.decode32(word),
                        Err(_) => self.kill_unknown(),
                    }
                }
            }
            4 => {
                if self.opcode == u32::MAX as u64 {
                    // All-ones parcels are defined illegal; mtval gets the
                    // full 32-bit value.
                    self.kill_unknown();
                } else {
                    let word = self.opcode as u32;
                    self.decode32(word);
                }
            }
            0 => {
                // Reserved length encoding: report the first 32 fetched bits.
                self.kill_unknown();
            }
            _ => {
                // 48-bit and longer encodings carry no instructions we model.
                log::debug!("unsupported {}-byte instruction at {:#x}", length, pc);
                self.kill_unknown();
            }
        }

        if self.base.is_jmp == DisasJumpType::Next && self.cpu.hooks.post_opcode_hook.is_some() {
            let pc_c = self.ir.constant(pc);
            let op_c = self.ir.constant(self.opcode);
            self.ir.gen_helper(HelperId::PostOpcodeHook, None, &[pc_c, op_c]);
        }

        self.base.pc_next = pc.wrapping_add(self.insn_len as u64);
        if self.base.is_jmp == DisasJumpType::Next
            && self.base.pc_next & TARGET_PAGE_MASK != self.base.pc_first & TARGET_PAGE_MASK
        {
            self.base.is_jmp = DisasJumpType::PageCross;
        }
    }

    fn tb_stop(&mut self) {
        match self.base.is_jmp {
            DisasJumpType::Next | DisasJumpType::TooMany | DisasJumpType::PageCross => {
                let next = self.base.pc_next;
                self.gen_goto_tb(0, next);
            }
            DisasJumpType::Stop => {
                let next = self.canonical_imm(self.base.pc_next);
                self.ir.gen_movi(self.pc_global, next);
                self.ir.gen_exit_tb_no_chaining(0);
            }
            DisasJumpType::Branch | DisasJumpType::TbJump => {}
        }
    }

    fn base(&self) -> &DisasContextBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DisasContextBase {
        &mut self.base
    }
}

impl RiscvTranslator<'_> {
    fn rv64(&self) -> bool {
        self.cpu.xlen == Xlen::Rv64
    }

    fn next_pc(&self) -> u64 {
        self.base.pc_next.wrapping_add(self.insn_len as u64)
    }

    fn canonical_imm(&self, value: u64) -> u64 {
        match self.cpu.xlen {
            Xlen::Rv32 => value as u32 as i32 as i64 as u64,
            Xlen::Rv64 => value,
        }
    }

    /// Copies a guest register into a fresh temporary; `x0` reads as zero.
    pub(crate) fn get_gpr(&mut self, reg: u32) -> Temp {
        let t = self.ir.temp_new();
        if reg == 0 {
            self.ir.gen_movi(t, 0);
        } else {
            self.ir.gen_mov(t, self.gpr[reg as usize]);
        }
        t
    }

    /// Writes a guest register; writes to `x0` are silently dropped. RV32
    /// keeps register values sign-extended in the 64-bit slots.
    pub(crate) fn set_gpr(&mut self, reg: u32, value: Temp) {
        if reg == 0 {
            return;
        }
        let dst = self.gpr[reg as usize];
        if self.rv64() {
            self.ir.gen_mov(dst, value);
        } else {
            self.ir.gen_ext32s(dst, value);
        }
        if self.cpu.hooks.traces_gpr(reg) {
            let reg_c = self.ir.constant(reg as u64);
            let write_c = self.ir.constant(1);
            self.ir.gen_helper(HelperId::GprAccessHook, None, &[reg_c, write_c]);
        }
        if reg == 2 && self.cpu.hooks.guest_profiler {
            self.ir.gen_helper(HelperId::StackChange, None, &[dst]);
        }
    }

    /// Emits the illegal-instruction exception for the current opcode and
    /// ends the block.
    pub(crate) fn kill_unknown(&mut self) {
        let formatted = format_opcode(self.opcode, self.insn_len);
        self.ir.gen_movi(self.opcode_global, formatted);
        let cause = self.ir.constant(excp::ILLEGAL);
        self.ir.gen_helper(HelperId::RaiseException, None, &[cause]);
        self.base.is_jmp = DisasJumpType::Stop;
    }

    fn gen_fetch_fault(&mut self, badaddr: u64) {
        let cause = self.ir.constant(excp::FETCH_FAULT);
        let addr = self.ir.constant(badaddr);
        self.ir.gen_helper(HelperId::RaiseExceptionBadAddr, None, &[cause, addr]);
        self.base.is_jmp = DisasJumpType::Stop;
    }

    fn ensure_extension(&mut self, feature: RiscvFeatures) -> bool {
        if self.cpu.has_feature(feature) {
            return true;
        }
        let letter = match feature {
            RiscvFeatures::RVM => 'M',
            RiscvFeatures::RVA => 'A',
            RiscvFeatures::RVF => 'F',
            RiscvFeatures::RVD => 'D',
            RiscvFeatures::RVC => 'C',
            RiscvFeatures::RVV => 'V',
            _ => 'I',
        };
        log::error!(
            "PC: {:#x}, opcode: {:#x}, RISC-V '{}' instruction set is not enabled for this CPU!",
            self.base.pc_next,
            format_opcode(self.opcode, self.insn_len),
            letter
        );
        self.kill_unknown();
        false
    }

    fn ensure_additional(&mut self, feature: AdditionalFeatures, name: &str) -> bool {
        if self.cpu.has_additional(feature) {
            return true;
        }
        if !self.cpu.is_silenced(feature) {
            log::error!(
                "PC: {:#x}, opcode: {:#x}, RISC-V '{}' extension is not enabled for this CPU!",
                self.base.pc_next,
                format_opcode(self.opcode, self.insn_len),
                name
            );
        }
        self.kill_unknown();
        false
    }

    /// Raises IllegalInstruction when `vill` is set, on a conditional path.
    pub(crate) fn gen_vill_check(&mut self) {
        let t = self.ir.temp_new();
        self.ir.gen_mov(t, self.vill_global);
        let done = self.ir.new_label();
        self.ir.gen_brcondi(Cond::Eq, t, 0, done);
        let formatted = format_opcode(self.opcode, self.insn_len);
        self.ir.gen_movi(self.opcode_global, formatted);
        let cause = self.ir.constant(excp::ILLEGAL);
        self.ir.gen_helper(HelperId::RaiseException, None, &[cause]);
        self.ir.set_label(done);
        self.base.is_jmp = DisasJumpType::Stop;
    }

    /// Raises IllegalInstruction when `mstatus.FS` is off.
    fn gen_fs_check(&mut self) {
        let t = self.ir.temp_new();
        self.ir.gen_mov(t, self.mstatus_global);
        self.ir.gen_andi(t, t, MSTATUS_FS);
        let ok = self.ir.new_label();
        self.ir.gen_brcondi(Cond::Ne, t, 0, ok);
        let formatted = format_opcode(self.opcode, self.insn_len);
        self.ir.gen_movi(self.opcode_global, formatted);
        let cause = self.ir.constant(excp::ILLEGAL);
        self.ir.gen_helper(HelperId::RaiseException, None, &[cause]);
        self.ir.set_label(ok);
        self.base.is_jmp = DisasJumpType::Stop;
    }

    /// Effective address `gpr[rs1] + imm`, zero-extended on RV32.
    fn gen_addr(&mut self, rs1: u32, imm: i64) -> Temp {
        let t = self.get_gpr(rs1);
        if imm != 0 {
            self.ir.gen_addi(t, t, imm as u64);
        }
        if !self.rv64() {
            self.ir.gen_ext32u(t, t);
        }
        t
    }

    fn gen_stack_hook(&mut self, rs1: u32, addr: Temp, width: u32, is_write: bool) {
        if rs1 == 2 && self.cpu.hooks.stack_access_hook {
            let width_c = self.ir.constant(width as u64);
            let write_c = self.ir.constant(is_write as u64);
            self.ir.gen_helper(HelperId::StackAccessHook, None, &[addr, width_c, write_c]);
        }
    }

    /// Chainable jump to `dest` through `goto_tb` slot `slot`; falls back
    /// to an unchained exit when the target leaves the block's page.
    fn gen_goto_tb(&mut self, slot: u8, dest: u64) {
        let dest = self.canonical_imm(dest);
        if dest & TARGET_PAGE_MASK == self.tb.pc & TARGET_PAGE_MASK {
            self.ir.gen_goto_tb(slot);
            self.ir.gen_movi(self.pc_global, dest);
            self.ir.gen_exit_tb(slot as u64);
        } else {
            self.ir.gen_movi(self.pc_global, dest);
            self.ir.gen_exit_tb_no_chaining(0);
        }
    }

    fn decode32(&mut self, insn: u32) {
        let opcode = insn & 0x7f;
        let rd = (insn >> 7) & 0x1f;
        let rs1 = (insn >> 15) & 0x1f;
        let rs2 = (insn >> 20) & 0x1f;
        let funct3 = (insn >> 12) & 0x7;
        match opcode {
            0x37 => {
                // LUI
                let value = self.canonical_imm((insn & 0xffff_f000) as i32 as i64 as u64);
                let t = self.ir.constant(value);
                self.set_gpr(rd, t);
            }
            0x17 => {
                // AUIPC
                let offset = (insn & 0xffff_f000) as i32 as i64 as u64;
                let value = self.canonical_imm(self.base.pc_next.wrapping_add(offset));
                let t = self.ir.constant(value);
                self.set_gpr(rd, t);
            }
            0x6f => self.gen_jal(rd, imm_j(insn)),
            0x67 => self.gen_jalr(rd, rs1, imm_i(insn)),
            0x63 => self.gen_branch(funct3, rs1, rs2, imm_b(insn)),
            0x03 => self.gen_load(funct3, rd, rs1, imm_i(insn)),
            0x23 => self.gen_store(funct3, rs1, rs2, imm_s(insn)),
            0x13 => self.gen_op_imm(insn, rd, rs1, funct3),
            0x33 => self.gen_op_reg(insn, rd, rs1, rs2, funct3),
            0x1b => self.gen_op_imm32(insn, rd, rs1, funct3),
            0x3b => self.gen_op_reg32(insn, rd, rs1, rs2, funct3),
            0x0f => self.gen_misc_mem(funct3),
            0x73 => self.gen_system(insn, rd, rs1, funct3),
            0x2f => self.gen_atomic(insn, rd, rs1, rs2, funct3),
            0x07 => match super::vector::vector_eew(funct3) {
                Some(eew) => self.gen_v_load(insn, eew),
                None => self.gen_fp_load(funct3, rd, rs1, imm_i(insn)),
            },
            0x27 => match super::vector::vector_eew(funct3) {
                Some(eew) => self.gen_v_store(insn, eew),
                None => self.gen_fp_store(funct3, rs1, rs2, imm_s(insn)),
            },
            0x53 => self.gen_op_fp(insn, rd, rs1, rs2, funct3),
            0x57 => self.gen_v_arith(insn),
            _ => self.decode_custom_or_illegal(),
        }
    }

    fn decode_custom_or_illegal(&mut self) {
        let opcode = self.opcode;
        let matched = self
            .cpu
            .custom_instructions
            .iter()
            .find(|ci| opcode & ci.mask == ci.pattern)
            .cloned();
        if let Some(ci) = matched {
            self.insn_len = ci.length;
            let formatted = format_opcode(opcode, ci.length);
            self.ir.gen_movi(self.opcode_global, formatted);
            let id_c = self.ir.constant(ci.id);
            let op_c = self.ir.constant(formatted);
            let result = self.ir.temp_new();
            self.ir.gen_helper(HelperId::CustomInstruction, Some(result), &[id_c, op_c]);
            return;
        }
        self.kill_unknown();
    }

    fn gen_jal(&mut self, rd: u32, imm: i64) {
        let target = self.base.pc_next.wrapping_add(imm as u64);
        if !self.cpu.has_feature(RiscvFeatures::RVC) && target & 0x3 != 0 {
            let cause = self.ir.constant(excp::MISALIGNED_FETCH);
            let bad = self.ir.constant(self.canonical_imm(target));
            self.ir.gen_helper(HelperId::RaiseExceptionBadAddr, None, &[cause, bad]);
            self.base.is_jmp = DisasJumpType::Stop;
            return;
        }
        let link = self.ir.constant(self.canonical_imm(self.next_pc()));
        self.set_gpr(rd, link);
        self.gen_goto_tb(0, target);
        self.base.is_jmp = DisasJumpType::TbJump;
    }

    fn gen_jalr(&mut self, rd: u32, rs1: u32, imm: i64) {
        let target = self.get_gpr(rs1);
        if imm != 0 {
            self.ir.gen_addi(target, target, imm as u64);
        }
        self.ir.gen_andi(target, target, !1u64);
        if !self.rv64() {
            self.ir.gen_ext32u(target, target);
        }
        if !self.cpu.has_feature(RiscvFeatures::RVC) {
            // A 2-byte-aligned but not 4-byte-aligned target traps.
            let misaligned = self.ir.temp_new();
            self.ir.gen_andi(misaligned, target, 0x2);
            let ok = self.ir.new_label();
            self.ir.gen_brcondi(Cond::Eq, misaligned, 0, ok);
            let cause = self.ir.constant(excp::MISALIGNED_FETCH);
            self.ir.gen_helper(HelperId::RaiseExceptionBadAddr, None, &[cause, target]);
            self.ir.set_label(ok);
        }
        let link = self.ir.constant(self.canonical_imm(self.next_pc()));
        self.set_gpr(rd, link);
        self.ir.gen_mov(self.pc_global, target);
        self.ir.gen_exit_tb_no_chaining(0);
        self.base.is_jmp = DisasJumpType::Branch;
    }

    fn gen_branch(&mut self, funct3: u32, rs1: u32, rs2: u32, imm: i64) {
        let cond = match funct3 {
            0b000 => Cond::Eq,
            0b001 => Cond::Ne,
            0b100 => Cond::Lt,
            0b101 => Cond::Ge,
            0b110 => Cond::Ltu,
            0b111 => Cond::Geu,
            _ => {
                self.kill_unknown();
                return;
            }
        };
        let target = self.base.pc_next.wrapping_add(imm as u64);
        let a = self.get_gpr(rs1);
        let b = self.get_gpr(rs2);
        let taken = self.ir.new_label();
        self.ir.gen_brcond(cond, a, b, taken);
        let next = self.next_pc();
        self.gen_goto_tb(1, next);
        self.ir.set_label(taken);
        if !self.cpu.has_feature(RiscvFeatures::RVC) && target & 0x3 != 0 {
            let cause = self.ir.constant(excp::MISALIGNED_FETCH);
            let bad = self.ir.constant(self.canonical_imm(target));
            self.ir.gen_helper(HelperId::RaiseExceptionBadAddr, None, &[cause, bad]);
        } else {
            self.gen_goto_tb(0, target);
        }
        self.base.is_jmp = DisasJumpType::Branch;
    }

    fn gen_load(&mut self, funct3: u32, rd: u32, rs1: u32, imm: i64) {
        let (size, signed) = match funct3 {
            0b000 => (AccessSize::Byte, true),
            0b001 => (AccessSize::Word, true),
            0b010 => (AccessSize::Long, true),
            0b011 if self.rv64() => (AccessSize::Quad, true),
            0b100 => (AccessSize::Byte, false),
            0b101 => (AccessSize::Word, false),
            0b110 if self.rv64() => (AccessSize::Long, false),
            _ => {
                self.kill_unknown();
                return;
            }
        };
        let addr = self.gen_addr(rs1, imm);
        self.gen_stack_hook(rs1, addr, size.bits(), false);
        let value = self.ir.temp_new();
        self.ir.gen_qemu_ld(value, addr, size, signed, self.base.mem_idx);
        self.set_gpr(rd, value);
    }

    fn gen_store(&mut self, funct3: u32, rs1: u32, rs2: u32, imm: i64) {
        let size = match funct3 {
            0b000 => AccessSize::Byte,
            0b001 => AccessSize::Word,
            0b010 => AccessSize::Long,
            0b011 if self.rv64() => AccessSize::Quad,
            _ => {
                self.kill_unknown();
                return;
            }
        };
        let addr = self.gen_addr(rs1, imm);
        self.gen_stack_hook(rs1, addr, size.bits(), true);
        let value = self.get_gpr(rs2);
        self.ir.gen_qemu_st(value, addr, size, self.base.mem_idx);
        // Stores publish the writing core so colliding reservations break.
        hst::gen_store_table_set(&mut self.ir, addr);
    }

    fn shamt_mask(&self) -> u64 {
        if self.rv64() {
            0x3f
        } else {
            0x1f
        }
    }

    fn gen_op_imm(&mut self, insn: u32, rd: u32, rs1: u32, funct3: u32) {
        let imm = imm_i(insn);
        let shamt = (insn >> 20) as u64 & self.shamt_mask();
        let funct12 = (insn >> 20) & 0xfff;
        let t = self.get_gpr(rs1);
        match funct3 {
            0b000 => self.ir.gen_addi(t, t, imm as u64),
            0b010 => self.ir.gen_setcondi(Cond::Lt, t, t, imm as u64),
            0b011 => {
                let imm = self.canonical_imm(imm as u64);
                self.ir.gen_setcondi(Cond::Ltu, t, t, imm);
            }
            0b100 => self.ir.gen_binary_imm(BinOp::Xor, t, t, imm as u64),
            0b110 => self.ir.gen_ori(t, t, imm as u64),
            0b111 => self.ir.gen_andi(t, t, imm as u64),
            0b001 => {
                // SLLI plus the Zbb/Zbs immediates sharing funct3 001.
                let selector = funct12 as u64 & !self.shamt_mask();
                match selector {
                    0x000 => self.ir.gen_binary_imm(BinOp::Shl, t, t, shamt),
                    0x280 => {
                        // BSETI
                        if !self.ensure_additional(AdditionalFeatures::ZBS, "Zbs") {
                            return;
                        }
                        self.ir.gen_ori(t, t, 1u64 << shamt);
                    }
                    0x480 => {
                        // BCLRI
                        if !self.ensure_additional(AdditionalFeatures::ZBS, "Zbs") {
                            return;
                        }
                        self.ir.gen_andi(t, t, !(1u64 << shamt));
                    }
                    0x680 => {
                        // BINVI
                        if !self.ensure_additional(AdditionalFeatures::ZBS, "Zbs") {
                            return;
                        }
                        self.ir.gen_binary_imm(BinOp::Xor, t, t, 1u64 << shamt);
                    }
                    0x600 => {
                        // CLZ/CTZ/CPOP/SEXT.B/SEXT.H
                        if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                            return;
                        }
                        match funct12 & 0x1f {
                            0 => self.gen_clz(t),
                            1 => self.gen_ctz(t),
                            2 => self.gen_cpop(t),
                            4 => self.ir.gen_unary(UnOp::Ext8S, t, t),
                            5 => self.ir.gen_unary(UnOp::Ext16S, t, t),
                            _ => {
                                self.kill_unknown();
                                return;
                            }
                        }
                    }
                    _ => {
                        self.kill_unknown();
                        return;
                    }
                }
            }
            _ => {
                // funct3 101: SRLI/SRAI and the Zbb/Zbs immediates.
                let selector = funct12 as u64 & !self.shamt_mask();
                match selector {
                    0x000 => {
                        if !self.rv64() {
                            self.ir.gen_ext32u(t, t);
                        }
                        self.ir.gen_binary_imm(BinOp::Shr, t, t, shamt);
                    }
                    0x400 => self.ir.gen_binary_imm(BinOp::Sar, t, t, shamt),
                    0x600 => {
                        // RORI
                        if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                            return;
                        }
                        let amount = self.ir.constant(shamt);
                        self.gen_ror(t, amount);
                    }
                    0x280 if funct12 == 0x287 => {
                        // ORC.B
                        if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                            return;
                        }
                        self.gen_orc_b(t);
                    }
                    0x680 if funct12 == 0x698 || funct12 == 0x6b8 => {
                        // REV8
                        if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                            return;
                        }
                        if self.rv64() {
                            if funct12 != 0x6b8 {
                                self.kill_unknown();
                                return;
                            }
                            self.ir.gen_unary(UnOp::Bswap64, t, t);
                        } else {
                            if funct12 != 0x698 {
                                self.kill_unknown();
                                return;
                            }
                            self.ir.gen_unary(UnOp::Bswap32, t, t);
                        }
                    }
                    0x480 => {
                        // BEXTI
                        if !self.ensure_additional(AdditionalFeatures::ZBS, "Zbs") {
                            return;
                        }
                        self.ir.gen_binary_imm(BinOp::Shr, t, t, shamt);
                        self.ir.gen_andi(t, t, 1);
                    }
                    _ => {
                        self.kill_unknown();
                        return;
                    }
                }
            }
        }
        self.set_gpr(rd, t);
    }

    fn gen_clz(&mut self, t: Temp) {
        if self.rv64() {
            self.ir.gen_unary(UnOp::Clz, t, t);
        } else {
            self.ir.gen_ext32u(t, t);
            self.ir.gen_unary(UnOp::Clz, t, t);
            self.ir.gen_addi(t, t, (-32i64) as u64);
        }
    }

    fn gen_ctz(&mut self, t: Temp) {
        if self.rv64() {
            self.ir.gen_unary(UnOp::Ctz, t, t);
        } else {
            // Bound the zero-input result to 32 by seeding bit 32.
            self.ir.gen_ext32u(t, t);
            self.ir.gen_ori(t, t, 1u64 << 32);
            self.ir.gen_unary(UnOp::Ctz, t, t);
        }
    }

    fn gen_cpop(&mut self, t: Temp) {
        if !self.rv64() {
            self.ir.gen_ext32u(t, t);
        }
        self.ir.gen_unary(UnOp::Popcnt, t, t);
    }

    fn gen_ror(&mut self, t: Temp, amount: Temp) {
        if self.rv64() {
            self.ir.gen_binary(BinOp::Rotr, t, t, amount);
        } else {
            self.gen_ror_w(t, amount);
        }
    }

    fn gen_rol(&mut self, t: Temp, amount: Temp) {
        if self.rv64() {
            self.ir.gen_binary(BinOp::Rotl, t, t, amount);
        } else {
            let neg = self.ir.temp_new();
            self.ir.gen_movi(neg, 32);
            self.ir.gen_sub(neg, neg, amount);
            self.gen_ror_w(t, neg);
        }
    }

    /// 32-bit rotate-right composed from shifts on the zero-extended value.
    fn gen_ror_w(&mut self, t: Temp, amount: Temp) {
        let a = self.ir.temp_new();
        self.ir.gen_ext32u(a, t);
        let s = self.ir.temp_new();
        self.ir.gen_andi(s, amount, 0x1f);
        let lo = self.ir.temp_new();
        self.ir.gen_binary(BinOp::Shr, lo, a, s);
        let inv = self.ir.temp_new();
        self.ir.gen_movi(inv, 32);
        self.ir.gen_sub(inv, inv, s);
        self.ir.gen_andi(inv, inv, 0x3f);
        let hi = self.ir.temp_new();
        self.ir.gen_binary(BinOp::Shl, hi, a, inv);
        self.ir.gen_or(t, lo, hi);
        self.ir.gen_ext32s(t, t);
    }

    /// ORC.B: every non-zero byte becomes 0xff.
    fn gen_orc_b(&mut self, t: Temp) {
        const LOW7: u64 = 0x7f7f_7f7f_7f7f_7f7f;
        let low = self.ir.temp_new();
        self.ir.gen_andi(low, t, LOW7);
        self.ir.gen_addi(low, low, LOW7);
        self.ir.gen_or(low, low, t);
        self.ir.gen_andi(low, low, !LOW7);
        self.ir.gen_binary_imm(BinOp::Shr, low, low, 7);
        self.ir.gen_binary_imm(BinOp::Mul, t, low, 0xff);
    }

    fn gen_op_reg(&mut self, insn: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32) {
        let funct7 = insn >> 25;
        if funct7 == 0x01 {
            self.gen_mul_div(rd, rs1, rs2, funct3, false);
            return;
        }
        let a = self.get_gpr(rs1);
        let b = self.get_gpr(rs2);
        match (funct7, funct3) {
            (0x00, 0b000) => self.ir.gen_add(a, a, b),
            (0x20, 0b000) => self.ir.gen_sub(a, a, b),
            (0x00, 0b001) => {
                let mask = self.shamt_mask();
                self.ir.gen_andi(b, b, mask);
                self.ir.gen_binary(BinOp::Shl, a, a, b);
            }
            (0x00, 0b010) => self.ir.gen_setcond(Cond::Lt, a, a, b),
            (0x00, 0b011) => self.ir.gen_setcond(Cond::Ltu, a, a, b),
            (0x00, 0b100) => self.ir.gen_xor(a, a, b),
            (0x00, 0b101) => {
                let mask = self.shamt_mask();
                self.ir.gen_andi(b, b, mask);
                if !self.rv64() {
                    self.ir.gen_ext32u(a, a);
                }
                self.ir.gen_binary(BinOp::Shr, a, a, b);
            }
            (0x20, 0b101) => {
                let mask = self.shamt_mask();
                self.ir.gen_andi(b, b, mask);
                self.ir.gen_binary(BinOp::Sar, a, a, b);
            }
            (0x00, 0b110) => self.ir.gen_or(a, a, b),
            (0x00, 0b111) => self.ir.gen_and(a, a, b),
            // Zba shift-adds
            (0x10, 0b010) | (0x10, 0b100) | (0x10, 0b110) => {
                if !self.ensure_additional(AdditionalFeatures::ZBA, "Zba") {
                    return;
                }
                let shift = (funct3 >> 1) as u64;
                self.ir.gen_binary_imm(BinOp::Shl, a, a, shift);
                self.ir.gen_add(a, a, b);
            }
            // Zbc carry-less multiply
            (0x05, 0b001) | (0x05, 0b010) | (0x05, 0b011) => {
                if !self.ensure_additional(AdditionalFeatures::ZBC, "Zbc") {
                    return;
                }
                match funct3 {
                    0b001 => self.ir.gen_binary(BinOp::Clmul, a, a, b),
                    0b011 => self.ir.gen_binary(BinOp::Clmulh, a, a, b),
                    _ => {
                        // CLMULR = P[126:63] of the carry-less product.
                        let hi = self.ir.temp_new();
                        self.ir.gen_binary(BinOp::Clmulh, hi, a, b);
                        self.ir.gen_binary_imm(BinOp::Shl, hi, hi, 1);
                        let lo = self.ir.temp_new();
                        self.ir.gen_binary(BinOp::Clmul, lo, a, b);
                        self.ir.gen_binary_imm(BinOp::Shr, lo, lo, 63);
                        self.ir.gen_or(a, hi, lo);
                    }
                }
            }
            // Zbb logic-with-negate
            (0x20, 0b111) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_unary(UnOp::Not, b, b);
                self.ir.gen_and(a, a, b); // ANDN
            }
            (0x20, 0b110) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_unary(UnOp::Not, b, b);
                self.ir.gen_or(a, a, b); // ORN
            }
            (0x20, 0b100) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_xor(a, a, b);
                self.ir.gen_unary(UnOp::Not, a, a); // XNOR
            }
            // Zbb min/max
            (0x05, 0b100) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_movcond(Cond::Lt, a, a, b, a, b); // MIN
            }
            (0x05, 0b101) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_movcond(Cond::Ltu, a, a, b, a, b); // MINU
            }
            (0x05, 0b110) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_movcond(Cond::Gt, a, a, b, a, b); // MAX
            }
            (0x05, 0b111) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_movcond(Cond::Gtu, a, a, b, a, b); // MAXU
            }
            // Zbb rotates and zext.h
            (0x30, 0b001) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.gen_rol(a, b);
            }
            (0x30, 0b101) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.gen_ror(a, b);
            }
            (0x04, 0b100) if rs2 == 0 => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_unary(UnOp::Ext16U, a, a); // ZEXT.H
            }
            // Zbs single-bit ops
            (0x14, 0b001) | (0x24, 0b001) | (0x34, 0b001) | (0x24, 0b101) => {
                if !self.ensure_additional(AdditionalFeatures::ZBS, "Zbs") {
                    return;
                }
                let mask_bits = self.shamt_mask();
                self.ir.gen_andi(b, b, mask_bits);
                let mask = self.ir.temp_new();
                self.ir.gen_movi(mask, 1);
                self.ir.gen_binary(BinOp::Shl, mask, mask, b);
                match (funct7, funct3) {
                    (0x14, _) => self.ir.gen_or(a, a, mask), // BSET
                    (0x24, 0b001) => {
                        self.ir.gen_unary(UnOp::Not, mask, mask);
                        self.ir.gen_and(a, a, mask); // BCLR
                    }
                    (0x34, _) => self.ir.gen_xor(a, a, mask), // BINV
                    _ => {
                        // BEXT
                        self.ir.gen_binary(BinOp::Shr, a, a, b);
                        self.ir.gen_andi(a, a, 1);
                    }
                }
            }
            _ => {
                self.kill_unknown();
                return;
            }
        }
        self.set_gpr(rd, a);
    }

    /// M-extension ops (funct7 0x01). The divide family steers its operands
    /// with `movcond` so the architectural sentinels come out of a single
    /// host division: on divide-by-zero the quotient is all-ones and the
    /// remainder is the dividend; on signed overflow the quotient is the
    /// dividend and the remainder is zero.
    fn gen_mul_div(&mut self, rd: u32, rs1: u32, rs2: u32, funct3: u32, word: bool) {
        if !self.ensure_extension(RiscvFeatures::RVM) {
            return;
        }
        let a = self.get_gpr(rs1);
        let b = self.get_gpr(rs2);
        let narrow = word || !self.rv64();
        if word {
            match funct3 {
                0b101 | 0b111 => {
                    self.ir.gen_ext32u(a, a);
                    self.ir.gen_ext32u(b, b);
                }
                _ => {
                    self.ir.gen_ext32s(a, a);
                    self.ir.gen_ext32s(b, b);
                }
            }
        }
        let min = if narrow { 0xffff_ffff_8000_0000u64 } else { 1u64 << 63 };
        match funct3 {
            0b000 => self.ir.gen_binary(BinOp::Mul, a, a, b),
            0b001 => {
                // MULH
                if narrow {
                    self.ir.gen_binary(BinOp::Mul, a, a, b);
                    self.ir.gen_binary_imm(BinOp::Sar, a, a, 32);
                } else {
                    let lo = self.ir.temp_new();
                    self.ir.gen_mul2(true, lo, a, a, b);
                }
            }
            0b010 => {
                // MULHSU
                if narrow {
                    self.ir.gen_ext32u(b, b);
                    self.ir.gen_binary(BinOp::Mul, a, a, b);
                    self.ir.gen_binary_imm(BinOp::Sar, a, a, 32);
                } else {
                    let lo = self.ir.temp_new();
                    let hi = self.ir.temp_new();
                    self.ir.gen_mul2(false, lo, hi, a, b);
                    let sign = self.ir.temp_new();
                    self.ir.gen_binary_imm(BinOp::Sar, sign, a, 63);
                    self.ir.gen_and(sign, sign, b);
                    self.ir.gen_sub(a, hi, sign);
                }
            }
            0b011 => {
                // MULHU
                if narrow {
                    self.ir.gen_ext32u(a, a);
                    self.ir.gen_ext32u(b, b);
                    self.ir.gen_binary(BinOp::Mul, a, a, b);
                    self.ir.gen_binary_imm(BinOp::Shr, a, a, 32);
                } else {
                    let lo = self.ir.temp_new();
                    self.ir.gen_mul2(false, lo, a, a, b);
                }
            }
            0b100 => {
                // DIV
                let zero = self.ir.constant(0);
                let neg1 = self.ir.constant(u64::MAX);
                let one = self.ir.constant(1);
                let overflow = self.ir.temp_new();
                let div0 = self.ir.temp_new();
                self.ir.gen_setcondi(Cond::Eq, overflow, a, min);
                self.ir.gen_setcondi(Cond::Eq, div0, b, u64::MAX);
                self.ir.gen_and(overflow, overflow, div0);
                self.ir.gen_setcondi(Cond::Eq, div0, b, 0);
                self.ir.gen_movcond(Cond::Eq, a, div0, zero, a, neg1);
                let steer = self.ir.temp_new();
                self.ir.gen_or(steer, overflow, div0);
                self.ir.gen_movcond(Cond::Eq, b, steer, zero, b, one);
                self.ir.gen_binary(BinOp::Div, a, a, b);
            }
            0b101 => {
                // DIVU
                let zero = self.ir.constant(0);
                let neg1 = self.ir.constant(u64::MAX);
                let one = self.ir.constant(1);
                if narrow && !word {
                    self.ir.gen_ext32u(a, a);
                    self.ir.gen_ext32u(b, b);
                }
                let div0 = self.ir.temp_new();
                self.ir.gen_setcondi(Cond::Eq, div0, b, 0);
                self.ir.gen_movcond(Cond::Eq, a, div0, zero, a, neg1);
                self.ir.gen_movcond(Cond::Eq, b, div0, zero, b, one);
                self.ir.gen_binary(BinOp::Divu, a, a, b);
            }
            0b110 => {
                // REM
                let zero = self.ir.constant(0);
                let one = self.ir.constant(1);
                let overflow = self.ir.temp_new();
                let div0 = self.ir.temp_new();
                self.ir.gen_setcondi(Cond::Eq, overflow, a, min);
                self.ir.gen_setcondi(Cond::Eq, div0, b, u64::MAX);
                self.ir.gen_and(overflow, overflow, div0);
                self.ir.gen_setcondi(Cond::Eq, div0, b, 0);
                let steer = self.ir.temp_new();
                self.ir.gen_or(steer, overflow, div0);
                self.ir.gen_movcond(Cond::Eq, b, steer, zero, b, one);
                let rem = self.ir.temp_new();
                self.ir.gen_binary(BinOp::Rem, rem, a, b);
                self.ir.gen_movcond(Cond::Eq, a, div0, zero, rem, a);
            }
            _ => {
                // REMU
                let zero = self.ir.constant(0);
                let one = self.ir.constant(1);
                if narrow && !word {
                    self.ir.gen_ext32u(a, a);
                    self.ir.gen_ext32u(b, b);
                }
                let div0 = self.ir.temp_new();
                self.ir.gen_setcondi(Cond::Eq, div0, b, 0);
                self.ir.gen_movcond(Cond::Eq, b, div0, zero, b, one);
                let rem = self.ir.temp_new();
                self.ir.gen_binary(BinOp::Remu, rem, a, b);
                self.ir.gen_movcond(Cond::Eq, a, div0, zero, rem, a);
            }
        }
        if word || !self.rv64() {
            self.ir.gen_ext32s(a, a);
        }
        self.set_gpr(rd, a);
    }

    fn gen_op_imm32(&mut self, insn: u32, rd: u32, rs1: u32, funct3: u32) {
        if !self.rv64() {
            self.kill_unknown();
            return;
        }
        let imm = imm_i(insn);
        let shamt = ((insn >> 20) & 0x1f) as u64;
        let funct7 = insn >> 25;
        let t = self.get_gpr(rs1);
        match funct3 {
            0b000 => {
                self.ir.gen_addi(t, t, imm as u64);
                self.ir.gen_ext32s(t, t);
            }
            0b001 => {
                if funct7 & !1 == 0x02 {
                    // SLLI.UW
                    if !self.ensure_additional(AdditionalFeatures::ZBA, "Zba") {
                        return;
                    }
                    let shamt6 = ((insn >> 20) & 0x3f) as u64;
                    self.ir.gen_ext32u(t, t);
                    self.ir.gen_binary_imm(BinOp::Shl, t, t, shamt6);
                } else if funct7 == 0x30 {
                    // CLZW/CTZW/CPOPW
                    if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                        return;
                    }
                    match (insn >> 20) & 0x1f {
                        0 => {
                            self.ir.gen_ext32u(t, t);
                            self.ir.gen_unary(UnOp::Clz, t, t);
                            self.ir.gen_addi(t, t, (-32i64) as u64);
                        }
                        1 => {
                            self.ir.gen_ext32u(t, t);
                            self.ir.gen_ori(t, t, 1u64 << 32);
                            self.ir.gen_unary(UnOp::Ctz, t, t);
                        }
                        2 => {
                            self.ir.gen_ext32u(t, t);
                            self.ir.gen_unary(UnOp::Popcnt, t, t);
                        }
                        _ => {
                            self.kill_unknown();
                            return;
                        }
                    }
                } else if funct7 == 0x00 {
                    // SLLIW
                    self.ir.gen_binary_imm(BinOp::Shl, t, t, shamt);
                    self.ir.gen_ext32s(t, t);
                } else {
                    self.kill_unknown();
                    return;
                }
            }
            0b101 => match funct7 {
                0x00 => {
                    // SRLIW
                    self.ir.gen_ext32u(t, t);
                    self.ir.gen_binary_imm(BinOp::Shr, t, t, shamt);
                    self.ir.gen_ext32s(t, t);
                }
                0x20 => {
                    // SRAIW
                    self.ir.gen_ext32s(t, t);
                    self.ir.gen_binary_imm(BinOp::Sar, t, t, shamt);
                }
                0x30 => {
                    // RORIW
                    if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                        return;
                    }
                    let amount = self.ir.constant(shamt);
                    self.gen_ror_w(t, amount);
                }
                _ => {
                    self.kill_unknown();
                    return;
                }
            },
            _ => {
                self.kill_unknown();
                return;
            }
        }
        self.set_gpr(rd, t);
    }

    fn gen_op_reg32(&mut self, insn: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32) {
        if !self.rv64() {
            self.kill_unknown();
            return;
        }
        let funct7 = insn >> 25;
        if funct7 == 0x01 {
            self.gen_mul_div(rd, rs1, rs2, funct3, true);
            return;
        }
        let a = self.get_gpr(rs1);
        let b = self.get_gpr(rs2);
        match (funct7, funct3) {
            (0x00, 0b000) => self.ir.gen_add(a, a, b),
            (0x20, 0b000) => self.ir.gen_sub(a, a, b),
            (0x00, 0b001) => {
                self.ir.gen_andi(b, b, 0x1f);
                self.ir.gen_binary(BinOp::Shl, a, a, b);
            }
            (0x00, 0b101) => {
                self.ir.gen_andi(b, b, 0x1f);
                self.ir.gen_ext32u(a, a);
                self.ir.gen_binary(BinOp::Shr, a, a, b);
            }
            (0x20, 0b101) => {
                self.ir.gen_andi(b, b, 0x1f);
                self.ir.gen_ext32s(a, a);
                self.ir.gen_binary(BinOp::Sar, a, a, b);
            }
            // ADD.UW
            (0x04, 0b000) => {
                if !self.ensure_additional(AdditionalFeatures::ZBA, "Zba") {
                    return;
                }
                self.ir.gen_ext32u(a, a);
                self.ir.gen_add(a, a, b);
                self.set_gpr(rd, a);
                return;
            }
            // SH1ADD.UW / SH2ADD.UW / SH3ADD.UW
            (0x10, 0b010) | (0x10, 0b100) | (0x10, 0b110) => {
                if !self.ensure_additional(AdditionalFeatures::ZBA, "Zba") {
                    return;
                }
                let shift = (funct3 >> 1) as u64;
                self.ir.gen_ext32u(a, a);
                self.ir.gen_binary_imm(BinOp::Shl, a, a, shift);
                self.ir.gen_add(a, a, b);
                self.set_gpr(rd, a);
                return;
            }
            // ROLW / RORW
            (0x30, 0b001) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                let neg = self.ir.temp_new();
                self.ir.gen_movi(neg, 32);
                self.ir.gen_sub(neg, neg, b);
                self.gen_ror_w(a, neg);
                self.set_gpr(rd, a);
                return;
            }
            (0x30, 0b101) => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.gen_ror_w(a, b);
                self.set_gpr(rd, a);
                return;
            }
            (0x04, 0b100) if rs2 == 0 => {
                if !self.ensure_additional(AdditionalFeatures::ZBB, "Zbb") {
                    return;
                }
                self.ir.gen_unary(UnOp::Ext16U, a, a); // ZEXT.H
                self.set_gpr(rd, a);
                return;
            }
            _ => {
                self.kill_unknown();
                return;
            }
        }
        self.ir.gen_ext32s(a, a);
        self.set_gpr(rd, a);
    }

    fn gen_misc_mem(&mut self, funct3: u32) {
        match funct3 {
            0b000 => {
                // FENCE is a NOP on an in-order core.
            }
            0b001 => {
                // FENCE.I ends the block unchained so regenerated code for
                // this PC is re-resolved.
                if !self.ensure_additional(AdditionalFeatures::ZIFENCEI, "Zifencei") {
                    return;
                }
                self.base.is_jmp = DisasJumpType::Stop;
            }
            _ => self.kill_unknown(),
        }
    }

    fn gen_system(&mut self, insn: u32, rd: u32, rs1: u32, funct3: u32) {
        if funct3 == 0 {
            let funct12 = insn >> 20;
            let funct7 = insn >> 25;
            match funct12 {
                0x000 => {
                    // ECALL
                    let cause = self.ir.constant(excp::ECALL);
                    self.ir.gen_helper(HelperId::RaiseException, None, &[cause]);
                    self.base.is_jmp = DisasJumpType::Stop;
                }
                0x001 => {
                    // EBREAK
                    let cause = self.ir.constant(excp::BREAKPOINT);
                    self.ir.gen_helper(HelperId::RaiseException, None, &[cause]);
                    self.base.is_jmp = DisasJumpType::Stop;
                }
                0x302 => {
                    // MRET
                    if self.cpu.privilege != PrivilegeMode::Machine {
                        self.kill_unknown();
                        return;
                    }
                    self.ir.gen_helper(HelperId::Mret, None, &[]);
                    self.ir.gen_exit_tb_no_chaining(0);
                    self.base.is_jmp = DisasJumpType::Branch;
                }
                0x102 => {
                    // SRET
                    if !self.cpu.has_feature(RiscvFeatures::RVS)
                        || self.cpu.privilege < PrivilegeMode::Supervisor
                    {
                        self.kill_unknown();
                        return;
                    }
                    self.ir.gen_helper(HelperId::Sret, None, &[]);
                    self.ir.gen_exit_tb_no_chaining(0);
                    self.base.is_jmp = DisasJumpType::Branch;
                }
                0x105 => {
                    // WFI parks the core; resumption is at the next
                    // instruction, which the helper records itself.
                    let next = self.ir.constant(self.canonical_imm(self.next_pc()));
                    self.ir.gen_helper(HelperId::Wfi, None, &[next]);
                    self.base.is_jmp = DisasJumpType::Stop;
                }
                _ if funct7 == 0x09 => {
                    // SFENCE.VMA: translation caches are external; just end
                    // the block unchained.
                    self.base.is_jmp = DisasJumpType::Stop;
                }
                _ => self.kill_unknown(),
            }
            return;
        }

        // Zicsr. When the extension is disabled this logs a diagnostic and
        // raises IllegalInstruction.
        if !self.ensure_additional(AdditionalFeatures::ZICSR, "Zicsr") {
            return;
        }
        let csr = insn >> 20;
        let csr_c = self.ir.constant(csr as u64);
        let src = if funct3 & 0b100 != 0 {
            self.ir.constant(rs1 as u64)
        } else {
            self.get_gpr(rs1)
        };
        let mut wrote = false;
        match funct3 & 0b11 {
            0b01 => {
                // CSRRW reads only when rd != x0; it always writes.
                if rd != 0 {
                    let old = self.ir.temp_new();
                    self.ir.gen_helper(HelperId::CsrRead, Some(old), &[csr_c]);
                    self.ir.gen_helper(HelperId::CsrWrite, None, &[csr_c, src]);
                    self.set_gpr(rd, old);
                } else {
                    self.ir.gen_helper(HelperId::CsrWrite, None, &[csr_c, src]);
                }
                wrote = true;
            }
            0b10 => {
                // CSRRS always reads; it writes only when rs1 != x0.
                let old = self.ir.temp_new();
                self.ir.gen_helper(HelperId::CsrRead, Some(old), &[csr_c]);
                if rs1 != 0 {
                    let new = self.ir.temp_new();
                    self.ir.gen_or(new, old, src);
                    self.ir.gen_helper(HelperId::CsrWrite, None, &[csr_c, new]);
                    wrote = true;
                }
                self.set_gpr(rd, old);
            }
            _ => {
                // CSRRC
                let old = self.ir.temp_new();
                self.ir.gen_helper(HelperId::CsrRead, Some(old), &[csr_c]);
                if rs1 != 0 {
                    let new = self.ir.temp_new();
                    self.ir.gen_unary(UnOp::Not, new, src);
                    self.ir.gen_and(new, old, new);
                    self.ir.gen_helper(HelperId::CsrWrite, None, &[csr_c, new]);
                    wrote = true;
                }
                self.set_gpr(rd, old);
            }
        }
        if wrote {
            // A CSR write can change the translation regime.
            self.base.is_jmp = DisasJumpType::Stop;
        }
    }

    fn gen_atomic(&mut self, insn: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32) {
        if !self.ensure_extension(RiscvFeatures::RVA) {
            return;
        }
        let funct5 = insn >> 27;
        let size = match funct3 {
            0b010 => AccessSize::Long,
            0b011 if self.rv64() || funct5 == 0x05 => AccessSize::Quad,
            0b100 if funct5 == 0x05 => {
                self.gen_amocas_q(rd, rs1, rs2);
                return;
            }
            _ => {
                self.kill_unknown();
                return;
            }
        };
        match funct5 {
            0x02 => {
                // LR reserves the address, not a region.
                if rs2 != 0 {
                    self.kill_unknown();
                    return;
                }
                let addr = self.gen_addr(rs1, 0);
                let value = self.ir.temp_new();
                self.ir.gen_qemu_ld(value, addr, size, true, self.base.mem_idx);
                self.ir.gen_helper(HelperId::ReserveAddress, None, &[addr]);
                self.set_gpr(rd, value);
            }
            0x03 => {
                // SC proceeds only when the reservation probe reports 0.
                let addr = self.gen_addr(rs1, 0);
                let result = self.ir.temp_new();
                self.ir
                    .gen_helper(HelperId::CheckAddressReservation, Some(result), &[addr]);
                let finish = self.ir.new_label();
                self.ir.gen_brcondi(Cond::Ne, result, 0, finish);
                let value = self.get_gpr(rs2);
                self.ir.gen_qemu_st(value, addr, size, self.base.mem_idx);
                // The successful store invalidates other cores' reservations.
                self.ir.gen_helper(HelperId::RegisterAddressAccess, None, &[addr]);
                self.ir.set_label(finish);
                self.ir.gen_helper(HelperId::CancelReservation, None, &[]);
                self.set_gpr(rd, result);
            }
            0x05 => {
                // AMOCAS.W/.D (Zacas)
                if !self.ensure_additional(AdditionalFeatures::ZACAS, "Zacas") {
                    return;
                }
                if size == AccessSize::Quad && !self.rv64() {
                    self.gen_amocas_d_rv32(rd, rs1, rs2);
                } else {
                    self.gen_amocas(rd, rs1, rs2, size);
                }
            }
            0x01 => {
                // AMOADD prefers the host fetch-add intrinsic.
                let has_intrinsic = match size {
                    AccessSize::Long => self.caps.atomic_fetch_add_i32,
                    _ => self.caps.atomic_fetch_add_i64,
                };
                let addr = self.gen_addr(rs1, 0);
                let value = self.get_gpr(rs2);
                let old = self.ir.temp_new();
                if has_intrinsic {
                    self.ir.gen_atomic_fetch_add(size, old, addr, value, self.base.mem_idx);
                    hst::gen_store_table_set(&mut self.ir, addr);
                } else {
                    hst::gen_store_table_lock(&mut self.ir, addr);
                    self.ir.gen_qemu_ld(old, addr, size, true, self.base.mem_idx);
                    let new = self.ir.temp_new();
                    self.ir.gen_add(new, old, value);
                    self.ir.gen_qemu_st(new, addr, size, self.base.mem_idx);
                    hst::gen_store_table_set(&mut self.ir, addr);
                    hst::gen_store_table_unlock(&mut self.ir, addr);
                }
                if size == AccessSize::Long {
                    self.ir.gen_ext32s(old, old);
                }
                self.set_gpr(rd, old);
            }
            0x00 | 0x04 | 0x08 | 0x0c | 0x10 | 0x14 | 0x18 | 0x1c => {
                self.gen_amo_locked(funct5, rd, rs1, rs2, size);
            }
            _ => self.kill_unknown(),
        }
    }

    /// The remaining AMOs run as load-op-store under the entry's
    /// fine-grained lock.
    fn gen_amo_locked(&mut self, funct5: u32, rd: u32, rs1: u32, rs2: u32, size: AccessSize) {
        let addr = self.gen_addr(rs1, 0);
        let value = self.get_gpr(rs2);
        hst::gen_store_table_lock(&mut self.ir, addr);
        let old = self.ir.temp_new();
        self.ir.gen_qemu_ld(old, addr, size, true, self.base.mem_idx);
        let new = self.ir.temp_new();
        match funct5 {
            0x00 => self.ir.gen_mov(new, value), // AMOSWAP
            0x04 => self.ir.gen_xor(new, old, value),
            0x0c => self.ir.gen_and(new, old, value),
            0x08 => self.ir.gen_or(new, old, value),
            0x10 => self.ir.gen_movcond(Cond::Lt, new, old, value, old, value), // AMOMIN
            0x14 => self.ir.gen_movcond(Cond::Gt, new, old, value, old, value), // AMOMAX
            0x18 => self.ir.gen_movcond(Cond::Ltu, new, old, value, old, value), // AMOMINU
            _ => self.ir.gen_movcond(Cond::Gtu, new, old, value, old, value),   // AMOMAXU
        }
        self.ir.gen_qemu_st(new, addr, size, self.base.mem_idx);
        hst::gen_store_table_set(&mut self.ir, addr);
        hst::gen_store_table_unlock(&mut self.ir, addr);
        if size == AccessSize::Long {
            self.ir.gen_ext32s(old, old);
        }
        self.set_gpr(rd, old);
    }

    /// Single-width AMOCAS through the host intrinsic, or the locked
    /// compare-and-swap sequence when the back-end lacks one.
    fn gen_amocas(&mut self, rd: u32, rs1: u32, rs2: u32, size: AccessSize) {
        let has_intrinsic = match size {
            AccessSize::Long => self.caps.atomic_cmpxchg_i32,
            _ => self.caps.atomic_cmpxchg_i64,
        };
        let addr = self.gen_addr(rs1, 0);
        let expected = self.get_gpr(rd);
        let new_value = self.get_gpr(rs2);
        if size == AccessSize::Long {
            self.ir.gen_ext32u(expected, expected);
            self.ir.gen_ext32u(new_value, new_value);
        }
        let old = self.ir.temp_new();
        if has_intrinsic {
            self.ir
                .gen_atomic_cmpxchg(size, old, addr, expected, new_value, self.base.mem_idx);
            hst::gen_store_table_set(&mut self.ir, addr);
        } else {
            hst::gen_store_table_lock(&mut self.ir, addr);
            self.ir.gen_qemu_ld(old, addr, size, false, self.base.mem_idx);
            let skip = self.ir.new_label();
            self.ir.gen_brcond(Cond::Ne, old, expected, skip);
            self.ir.gen_qemu_st(new_value, addr, size, self.base.mem_idx);
            hst::gen_store_table_set(&mut self.ir, addr);
            self.ir.set_label(skip);
            hst::gen_store_table_unlock(&mut self.ir, addr);
        }
        if size == AccessSize::Long {
            self.ir.gen_ext32s(old, old);
        }
        self.set_gpr(rd, old);
    }

    /// Register pairs for the double-width CAS forms must be even-aligned.
    fn ensure_even_pair(&mut self, reg: u32) -> bool {
        if reg % 2 != 0 {
            self.kill_unknown();
            return false;
        }
        true
    }

    /// AMOCAS.D on RV32: the 64-bit expected and new values live in even
    /// register pairs; the memory operation itself is a 64-bit CAS.
    fn gen_amocas_d_rv32(&mut self, rd: u32, rs1: u32, rs2: u32) {
        if !self.ensure_even_pair(rd) || !self.ensure_even_pair(rs2) {
            return;
        }
        let addr = self.gen_addr(rs1, 0);
        let expected = self.gen_pair64(rd);
        let new_value = self.gen_pair64(rs2);
        let old = self.ir.temp_new();
        if self.caps.atomic_cmpxchg_i64 {
            self.ir.gen_atomic_cmpxchg(
                AccessSize::Quad,
                old,
                addr,
                expected,
                new_value,
                self.base.mem_idx,
            );
            hst::gen_store_table_set(&mut self.ir, addr);
        } else {
            hst::gen_store_table_lock(&mut self.ir, addr);
            self.ir.gen_qemu_ld(old, addr, AccessSize::Quad, false, self.base.mem_idx);
            let skip = self.ir.new_label();
            self.ir.gen_brcond(Cond::Ne, old, expected, skip);
            self.ir.gen_qemu_st(new_value, addr, AccessSize::Quad, self.base.mem_idx);
            hst::gen_store_table_set(&mut self.ir, addr);
            self.ir.set_label(skip);
            hst::gen_store_table_unlock(&mut self.ir, addr);
        }
        self.set_pair64(rd, old);
    }

    /// Composes a 64-bit value from an even register pair (an x0 pair
    /// reads as zero).
    fn gen_pair64(&mut self, reg: u32) -> Temp {
        let lo = self.get_gpr(reg);
        self.ir.gen_ext32u(lo, lo);
        if reg != 0 {
            let hi = self.get_gpr(reg + 1);
            self.ir.gen_binary_imm(BinOp::Shl, hi, hi, 32);
            self.ir.gen_or(lo, lo, hi);
        }
        lo
    }

    fn set_pair64(&mut self, reg: u32, value: Temp) {
        if reg == 0 {
            return;
        }
        let lo = self.ir.temp_new();
        self.ir.gen_ext32s(lo, value);
        self.set_gpr(reg, lo);
        let hi = self.ir.temp_new();
        self.ir.gen_binary_imm(BinOp::Sar, hi, value, 32);
        self.set_gpr(reg + 1, hi);
    }

    /// AMOCAS.Q: a 128-bit CAS over two adjacent doublewords, locked in
    /// fixed low-address-first order when no host intrinsic exists.
    fn gen_amocas_q(&mut self, rd: u32, rs1: u32, rs2: u32) {
        if !self.ensure_additional(AdditionalFeatures::ZACAS, "Zacas") {
            return;
        }
        if !self.rv64() {
            self.kill_unknown();
            return;
        }
        if !self.ensure_even_pair(rd) || !self.ensure_even_pair(rs2) {
            return;
        }
        let addr_lo = self.gen_addr(rs1, 0);
        let addr_hi = self.ir.temp_new();
        self.ir.gen_addi(addr_hi, addr_lo, 8);
        let exp_lo = self.get_gpr(rd);
        let exp_hi = if rd == 0 { self.ir.constant(0) } else { self.get_gpr(rd + 1) };
        let new_lo = self.get_gpr(rs2);
        let new_hi = if rs2 == 0 { self.ir.constant(0) } else { self.get_gpr(rs2 + 1) };
        let old_lo = self.ir.temp_new();
        let old_hi = self.ir.temp_new();
        if self.caps.atomic_cmpxchg_i128 {
            self.ir.gen_atomic_cmpxchg_128(
                [old_lo, old_hi],
                addr_lo,
                [exp_lo, exp_hi],
                [new_lo, new_hi],
                self.base.mem_idx,
            );
            hst::gen_store_table_set(&mut self.ir, addr_lo);
            hst::gen_store_table_set(&mut self.ir, addr_hi);
        } else {
            hst::gen_store_table_lock_128(&mut self.ir, addr_lo, addr_hi);
            self.ir.gen_qemu_ld(old_lo, addr_lo, AccessSize::Quad, false, self.base.mem_idx);
            self.ir.gen_qemu_ld(old_hi, addr_hi, AccessSize::Quad, false, self.base.mem_idx);
            let matches = self.ir.temp_new();
            let hi_match = self.ir.temp_new();
            self.ir.gen_setcond(Cond::Eq, matches, old_lo, exp_lo);
            self.ir.gen_setcond(Cond::Eq, hi_match, old_hi, exp_hi);
            self.ir.gen_and(matches, matches, hi_match);
            let skip = self.ir.new_label();
            self.ir.gen_brcondi(Cond::Eq, matches, 0, skip);
            self.ir.gen_qemu_st(new_lo, addr_lo, AccessSize::Quad, self.base.mem_idx);
            self.ir.gen_qemu_st(new_hi, addr_hi, AccessSize::Quad, self.base.mem_idx);
            hst::gen_store_table_set(&mut self.ir, addr_lo);
            hst::gen_store_table_set(&mut self.ir, addr_hi);
            self.ir.set_label(skip);
            hst::gen_store_table_unlock_128(&mut self.ir, addr_lo, addr_hi);
        }
        if rd != 0 {
            self.set_gpr(rd, old_lo);
            self.set_gpr(rd + 1, old_hi);
        }
    }

    fn fp_gate(&mut self, funct3: u32) -> Option<AccessSize> {
        match funct3 {
            0b001 => {
                if !self.ensure_additional(AdditionalFeatures::ZFH, "Zfh") {
                    return None;
                }
                Some(AccessSize::Word)
            }
            0b010 => {
                if !self.ensure_extension(RiscvFeatures::RVF) {
                    return None;
                }
                Some(AccessSize::Long)
            }
            0b011 => {
                if !self.ensure_extension(RiscvFeatures::RVD) {
                    return None;
                }
                Some(AccessSize::Quad)
            }
            _ => {
                self.kill_unknown();
                None
            }
        }
    }

    fn gen_fp_load(&mut self, funct3: u32, rd: u32, rs1: u32, imm: i64) {
        let size = match self.fp_gate(funct3) {
            Some(size) => size,
            None => return,
        };
        self.gen_fs_check();
        let addr = self.gen_addr(rs1, imm);
        self.gen_stack_hook(rs1, addr, size.bits(), false);
        let value = self.ir.temp_new();
        self.ir.gen_qemu_ld(value, addr, size, false, self.base.mem_idx);
        if size != AccessSize::Quad {
            // Narrower values are NaN-boxed in the 64-bit register.
            self.ir.gen_ori(value, value, !size.mask());
        }
        self.ir.gen_mov(self.fpr[rd as usize], value);
    }

    fn gen_fp_store(&mut self, funct3: u32, rs1: u32, rs2: u32, imm: i64) {
        let size = match self.fp_gate(funct3) {
            Some(size) => size,
            None => return,
        };
        self.gen_fs_check();
        let addr = self.gen_addr(rs1, imm);
        self.gen_stack_hook(rs1, addr, size.bits(), true);
        let value = self.ir.temp_new();
        self.ir.gen_mov(value, self.fpr[rs2 as usize]);
        self.ir.gen_qemu_st(value, addr, size, self.base.mem_idx);
        hst::gen_store_table_set(&mut self.ir, addr);
    }

    /// The move and sign-injection subset of OP-FP; the arithmetic kernels
    /// belong to the external softfloat collaborator.
    fn gen_op_fp(&mut self, insn: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32) {
        let funct7 = insn >> 25;
        let double = funct7 & 1 != 0;
        if double {
            if !self.ensure_extension(RiscvFeatures::RVD) {
                return;
            }
        } else if !self.ensure_extension(RiscvFeatures::RVF) {
            return;
        }
        self.gen_fs_check();
        let sign_bit = if double { 1u64 << 63 } else { 1u64 << 31 };
        match funct7 & !1 {
            0x10 => {
                // FSGNJ / FSGNJN / FSGNJX
                let a = self.ir.temp_new();
                self.ir.gen_mov(a, self.fpr[rs1 as usize]);
                let b = self.ir.temp_new();
                self.ir.gen_mov(b, self.fpr[rs2 as usize]);
                match funct3 {
                    0b000 => {
                        self.ir.gen_andi(a, a, !sign_bit);
                        self.ir.gen_andi(b, b, sign_bit);
                        self.ir.gen_or(a, a, b);
                    }
                    0b001 => {
                        self.ir.gen_andi(a, a, !sign_bit);
                        self.ir.gen_unary(UnOp::Not, b, b);
                        self.ir.gen_andi(b, b, sign_bit);
                        self.ir.gen_or(a, a, b);
                    }
                    0b010 => {
                        self.ir.gen_andi(b, b, sign_bit);
                        self.ir.gen_xor(a, a, b);
                    }
                    _ => {
                        self.kill_unknown();
                        return;
                    }
                }
                self.ir.gen_mov(self.fpr[rd as usize], a);
            }
            0x70 if rs2 == 0 && funct3 == 0 => {
                // FMV.X.W / FMV.X.D
                let t = self.ir.temp_new();
                self.ir.gen_mov(t, self.fpr[rs1 as usize]);
                if !double {
                    self.ir.gen_ext32s(t, t);
                }
                self.set_gpr(rd, t);
            }
            0x78 if rs2 == 0 && funct3 == 0 => {
                // FMV.W.X / FMV.D.X
                let t = self.get_gpr(rs1);
                if !double {
                    self.ir.gen_ext32u(t, t);
                    self.ir.gen_ori(t, t, 0xffff_ffff_0000_0000);
                }
                self.ir.gen_mov(self.fpr[rd as usize], t);
            }
            _ => {
                // The arithmetic kernels route to the external softfloat
                // collaborator, which this core does not carry.
                self.kill_unknown();
            }
        }
    }
}

fn imm_i(insn: u32) -> i64 {
    (insn as i32 >> 20) as i64
}

fn imm_s(insn: u32) -> i64 {
    (((insn >> 7) & 0x1f) as i64) | (((insn as i32 >> 25) as i64) << 5)
}

fn imm_b(insn: u32) -> i64 {
    let imm = (((insn >> 8) & 0xf) << 1) | (((insn >> 25) & 0x3f) << 5) | (((insn >> 7) & 1) << 11);
    let sign = (insn as i32 >> 31) as i64;
    (imm as i64) | (sign << 12)
}

fn imm_j(insn: u32) -> i64 {
    let imm = (((insn >> 21) & 0x3ff) << 1) | (((insn >> 20) & 1) << 11) | (((insn >> 12) & 0xff) << 12);
    let sign = (insn as i32 >> 31) as i64;
    (imm as i64) | (sign << 20)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::riscv::CoreBuilder;
    use crate::ir::ops_call_helper;
    use crate::memory::FlatMemory;
    use proptest::prelude::*;

    fn rv64_core() -> CpuState {
        CoreBuilder::new()
            .with_features(
                RiscvFeatures::RVM | RiscvFeatures::RVA | RiscvFeatures::RVC | RiscvFeatures::RVV,
            )
            .with_additional_features(
                AdditionalFeatures::ZICSR | AdditionalFeatures::ZIFENCEI | AdditionalFeatures::ZACAS,
            )
            .build()
            .unwrap()
    }

    fn translate(cpu: &CpuState, code: &[u8]) -> (TranslationBlock, Vec<Op>) {
        let mut mem = FlatMemory::new(0x1000, 4096);
        mem.write(0x1000, code);
        translate_block(cpu, &mut mem, BackendCaps::all(), 0x1000, 16)
    }

    #[test]
    fn length_decoder_matches_encoding_rules() {
        assert_eq!(decode_instruction_length(0x0001), 2);
        assert_eq!(decode_instruction_length(0x0013), 4); // addi
        assert_eq!(decode_instruction_length(0x001f), 6);
        assert_eq!(decode_instruction_length(0x003f), 8);
        assert_eq!(decode_instruction_length(0x107f), 12); // nnn = 001
        assert_eq!(decode_instruction_length(0xffff), 0); // reserved
    }

    proptest! {
        #[test]
        fn length_decoder_is_total_and_even(parcel: u16) {
            let len = decode_instruction_length(parcel);
            prop_assert!(len % 2 == 0);
            prop_assert!(len <= 22);
            // Only the nnn = 111 tail encodings are reserved.
            if len == 0 {
                prop_assert_eq!(parcel & 0b111_0000_0111_1111, 0b111_0000_0111_1111);
            }
        }
    }

    #[test]
    fn all_ones_word_raises_illegal_with_full_mtval() {
        let cpu = rv64_core();
        let (_, ops) = translate(&cpu, &[0xff, 0xff, 0xff, 0xff]);
        assert!(ops_call_helper(&ops, HelperId::RaiseException));
        // The opcode global receives the full 32-bit word.
        assert!(ops
            .iter()
            .any(|op| matches!(op, Op::MovImm { value: 0xffff_ffff, .. })));
    }

    #[test]
    fn writes_to_x0_are_dropped() {
        let cpu = rv64_core();
        // addi x0, x1, 1
        let (_, ops) = translate(&cpu, &0x0010_8013u32.to_le_bytes());
        assert!(!ops.iter().any(|op| matches!(
            op,
            Op::Mov { dst: Temp(0), .. } | Op::MovImm { dst: Temp(0), .. }
        )));
    }

    #[test]
    fn compressed_requires_rvc() {
        let cpu = CoreBuilder::new().build().unwrap();
        // c.li x10, 1
        let (_, ops) = translate(&cpu, &[0x05, 0x45]);
        assert!(ops_call_helper(&ops, HelperId::RaiseException));
    }

    #[test]
    fn branch_to_misaligned_target_without_rvc_traps() {
        let cpu = CoreBuilder::new().build().unwrap();
        // beq x0, x0, +2 (2-byte-aligned, not 4-byte-aligned)
        let insn: u32 = 0x0000_0163;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops_call_helper(&ops, HelperId::RaiseExceptionBadAddr));
    }

    #[test]
    fn branch_to_misaligned_target_with_rvc_is_fine() {
        let cpu = rv64_core();
        let insn: u32 = 0x0000_0163;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(!ops_call_helper(&ops, HelperId::RaiseExceptionBadAddr));
    }

    #[test]
    fn lr_emits_reservation_and_sc_checks_it() {
        let cpu = rv64_core();
        // lr.w t0, (a0); sc.w t1, t2, (a0)
        let lr: u32 = 0x1005_22af;
        let sc: u32 = 0x1875_232f;
        let code: Vec<u8> = lr
            .to_le_bytes()
            .iter()
            .chain(sc.to_le_bytes().iter())
            .copied()
            .collect();
        let (_, ops) = translate(&cpu, &code);
        assert!(ops_call_helper(&ops, HelperId::ReserveAddress));
        assert!(ops_call_helper(&ops, HelperId::CheckAddressReservation));
        assert!(ops_call_helper(&ops, HelperId::RegisterAddressAccess));
        assert!(ops_call_helper(&ops, HelperId::CancelReservation));
    }

    #[test]
    fn amoadd_uses_intrinsic_when_available() {
        let cpu = rv64_core();
        // amoadd.w t0, t1, (a0)
        let insn: u32 = 0x0065_22af;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops.iter().any(|op| matches!(op, Op::AtomicFetchAdd { .. })));
        assert!(!ops_call_helper(&ops, HelperId::StoreTableLock));
    }

    #[test]
    fn amoadd_falls_back_to_locked_sequence() {
        let cpu = rv64_core();
        let insn: u32 = 0x0065_22af;
        let mut mem = FlatMemory::new(0x1000, 4096);
        mem.write(0x1000, &insn.to_le_bytes());
        let (_, ops) = translate_block(&cpu, &mut mem, BackendCaps::default(), 0x1000, 1);
        assert!(!ops.iter().any(|op| matches!(op, Op::AtomicFetchAdd { .. })));
        assert!(ops_call_helper(&ops, HelperId::StoreTableLock));
        assert!(ops_call_helper(&ops, HelperId::StoreTableUnlock));
    }

    #[test]
    fn stores_publish_to_the_store_table() {
        let cpu = rv64_core();
        // sw t2, 0(a0)
        let insn: u32 = 0x0075_2023;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops_call_helper(&ops, HelperId::StoreTableSet));
    }

    #[test]
    fn csr_write_ends_the_block_unchained() {
        let cpu = rv64_core();
        // csrrw x1, mscratch, x2
        let insn: u32 = 0x3401_10f3;
        let (tb, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(tb.no_chain);
        assert!(ops.iter().any(|op| matches!(op, Op::ExitTbNoChaining { .. })));
    }

    #[test]
    fn zicsr_disabled_raises_illegal() {
        let cpu = CoreBuilder::new().build().unwrap();
        let insn: u32 = 0x3401_10f3;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops_call_helper(&ops, HelperId::RaiseException));
        assert!(!ops_call_helper(&ops, HelperId::CsrWrite));
    }

    #[test]
    fn direct_jump_chains_within_the_page() {
        let cpu = rv64_core();
        // jal x0, +8
        let insn: u32 = 0x0080_006f;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops.iter().any(|op| matches!(op, Op::GotoTb { slot: 0 })));
    }

    #[test]
    fn jalr_exits_without_chaining() {
        let cpu = rv64_core();
        // jalr x0, 0(x1)
        let insn: u32 = 0x0000_8067;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops.iter().any(|op| matches!(op, Op::ExitTbNoChaining { .. })));
        assert!(!ops.iter().any(|op| matches!(op, Op::GotoTb { .. })));
    }

    #[test]
    fn vector_op_emits_vill_check_and_helper() {
        let cpu = rv64_core();
        // vadd.vv v3, v2, v1
        let insn: u32 = 0x0220_81d7;
        let mut mem = FlatMemory::new(0x1000, 4096);
        mem.write(0x1000, &insn.to_le_bytes());
        let (_, ops) = translate_block(&cpu, &mut mem, BackendCaps::all(), 0x1000, 1);
        assert!(ops_call_helper(&ops, HelperId::VOpIvv));
        assert!(ops_call_helper(&ops, HelperId::RaiseException));
    }

    #[test]
    fn amocas_q_locks_both_entries_without_intrinsics() {
        let cpu = rv64_core();
        // amocas.q a2, a4, (a0)
        let insn: u32 = 0x28e5_462f;
        let mut mem = FlatMemory::new(0x1000, 4096);
        mem.write(0x1000, &insn.to_le_bytes());
        let (_, ops) = translate_block(&cpu, &mut mem, BackendCaps::default(), 0x1000, 1);
        assert!(ops_call_helper(&ops, HelperId::StoreTableLock128));
        assert!(ops_call_helper(&ops, HelperId::StoreTableUnlock128));
    }

    #[test]
    fn amocas_q_odd_pair_is_illegal() {
        let cpu = rv64_core();
        // amocas.q with odd rd (a3)
        let insn: u32 = 0x28e5_46af;
        let (_, ops) = translate(&cpu, &insn.to_le_bytes());
        assert!(ops_call_helper(&ops, HelperId::RaiseException));
    }
}
