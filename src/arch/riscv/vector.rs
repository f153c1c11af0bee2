//! This module provides the translation side of the vector engine: the
//! `vset{i}vl{i}` configuration instructions and the decode of vector
//! loads, stores, and integer arithmetic into runtime helper calls.

use crate::ir::HelperId;

use super::translate::RiscvTranslator;
use super::AdditionalFeatures;

// Unit-stride lumop values (the rs2 field of unit-stride vector memory ops).
const LUMOP_UNIT: u32 = 0b00000;
const LUMOP_WHOLE: u32 = 0b01000;
const LUMOP_MASK: u32 = 0b01011;
const LUMOP_FAULT_FIRST: u32 = 0b10000;

fn vm_bit(insn: u32) -> bool {
    insn & (1 << 25) != 0
}

fn mop(insn: u32) -> u32 {
    (insn >> 26) & 3
}

fn mew(insn: u32) -> bool {
    insn & (1 << 28) != 0
}

fn nf(insn: u32) -> u32 {
    (insn >> 29) & 7
}

/// Element width encoded in the memory op's width field; `None` for the
/// scalar FP encodings that share the opcode.
pub(super) fn vector_eew(width: u32) -> Option<u32> {
    match width {
        0b000 => Some(8),
        0b101 => Some(16),
        0b110 => Some(32),
        0b111 => Some(64),
        _ => None,
    }
}

impl RiscvTranslator<'_> {
    /// Checks that the configured vector extension covers the element
    /// width; `Zve32*` cores cannot touch 64-bit lanes.
    fn ensure_vector_for_eew(&mut self, eew: u32) -> bool {
        if !self.cpu.has_vector() {
            self.log_disabled_vector();
            return false;
        }
        if eew > self.cpu.elen() {
            self.kill_unknown();
            return false;
        }
        true
    }

    fn log_disabled_vector(&mut self) {
        if !self.cpu.is_silenced(AdditionalFeatures::ZVE32X) {
            log::error!(
                "PC: {:#x}, opcode: {:#x}, the vector extension is not enabled for this CPU",
                self.base.pc_next,
                self.opcode
            );
        }
        self.kill_unknown();
    }

    /// `vsetvl` / `vsetvli` / `vsetivli` (OP-V with funct3 0b111).
    pub(super) fn gen_v_cfg(&mut self, insn: u32) {
        if !self.cpu.has_vector() {
            self.log_disabled_vector();
            return;
        }
        let rd = (insn >> 7) & 0x1f;
        let rs1 = (insn >> 15) & 0x1f;

        let (avl, vtype, is_imm) = if insn >> 31 == 0 {
            // vsetvli: vtype immediate in [30:20].
            let zimm = ((insn >> 20) & 0x7ff) as u64;
            let avl = self.get_gpr(rs1);
            (avl, self.ir.constant(zimm), false)
        } else if insn >> 30 == 0b11 {
            // vsetivli: uimm AVL in rs1, vtype immediate in [29:20].
            let zimm = ((insn >> 20) & 0x3ff) as u64;
            let avl = self.ir.constant(rs1 as u64);
            (avl, self.ir.constant(zimm), true)
        } else if (insn >> 25) == 0b1000000 {
            // vsetvl: vtype from rs2.
            let avl = self.get_gpr(rs1);
            let rs2 = (insn >> 20) & 0x1f;
            let vtype = self.get_gpr(rs2);
            (avl, vtype, false)
        } else {
            self.kill_unknown();
            return;
        };

        let rd_c = self.ir.constant(rd as u64);
        let rs1_c = self.ir.constant(rs1 as u64);
        let imm_c = self.ir.constant(is_imm as u64);
        let new_vl = self.ir.temp_new();
        self.ir.gen_helper(HelperId::Vsetvl, Some(new_vl), &[rd_c, rs1_c, avl, vtype, imm_c]);
        self.set_gpr(rd, new_vl);
    }

    /// Vector load decode (LOAD-FP opcode with a vector width encoding).
    pub(super) fn gen_v_load(&mut self, insn: u32, eew: u32) {
        if !self.ensure_vector_for_eew(eew) {
            return;
        }
        if mew(insn) {
            // mew is a reserved encoding.
            self.kill_unknown();
            return;
        }
        let vd = (insn >> 7) & 0x1f;
        let rs1 = (insn >> 15) & 0x1f;
        let rs2 = (insn >> 20) & 0x1f;
        let masked = !vm_bit(insn);
        let nf = nf(insn);

        // Every vector op other than configuration and whole-register moves
        // executes under a vill check.
        let whole = mop(insn) == 0 && rs2 == LUMOP_WHOLE;
        if !whole {
            self.gen_vill_check();
        }

        let vd_c = self.ir.constant(vd as u64);
        let rs1_c = self.ir.constant(rs1 as u64);
        let nf_c = self.ir.constant(nf as u64);
        let eew_c = self.ir.constant(eew as u64);
        let masked_c = self.ir.constant(masked as u64);
        match mop(insn) {
            0b00 => match rs2 {
                LUMOP_UNIT | LUMOP_FAULT_FIRST => {
                    let ff = self.ir.constant((rs2 == LUMOP_FAULT_FIRST) as u64);
                    self.ir.gen_helper(
                        HelperId::VLoadUnit,
                        None,
                        &[vd_c, rs1_c, nf_c, eew_c, masked_c, ff],
                    );
                }
                LUMOP_WHOLE => {
                    let fields = nf + 1;
                    if masked || !fields.is_power_of_two() {
                        self.kill_unknown();
                        return;
                    }
                    let fields_c = self.ir.constant(fields as u64);
                    self.ir.gen_helper(HelperId::VLoadWhole, None, &[vd_c, rs1_c, fields_c]);
                }
                LUMOP_MASK => {
                    if masked || eew != 8 || nf != 0 {
                        self.kill_unknown();
                        return;
                    }
                    self.ir.gen_helper(HelperId::VLoadMask, None, &[vd_c, rs1_c]);
                }
                _ => self.kill_unknown(),
            },
            0b10 => {
                let rs2_c = self.ir.constant(rs2 as u64);
                self.ir.gen_helper(
                    HelperId::VLoadStride,
                    None,
                    &[vd_c, rs1_c, rs2_c, nf_c, eew_c, masked_c],
                );
            }
            // Ordered and unordered indexed forms execute identically on a
            // single in-order core.
            _ => {
                if eew == 64 && self.cpu.xlen == super::Xlen::Rv32 {
                    // EEW=64 indexes with XLEN=32 are not supported.
                    self.kill_unknown();
                    return;
                }
                let vs2_c = self.ir.constant(rs2 as u64);
                self.ir.gen_helper(
                    HelperId::VLoadIndexed,
                    None,
                    &[vd_c, rs1_c, vs2_c, nf_c, eew_c, masked_c],
                );
            }
        }
    }

    /// Vector store decode (STORE-FP opcode with a vector width encoding).
    pub(super) fn gen_v_store(&mut self, insn: u32, eew: u32) {
        if !self.ensure_vector_for_eew(eew) {
            return;
        }
        if mew(insn) {
            self.kill_unknown();
            return;
        }
        let vs3 = (insn >> 7) & 0x1f;
        let rs1 = (insn >> 15) & 0x1f;
        let rs2 = (insn >> 20) & 0x1f;
        let masked = !vm_bit(insn);
        let nf = nf(insn);

        let whole = mop(insn) == 0 && rs2 == LUMOP_WHOLE;
        if !whole {
            self.gen_vill_check();
        }

        let vs3_c = self.ir.constant(vs3 as u64);
        let rs1_c = self.ir.constant(rs1 as u64);
        let nf_c = self.ir.constant(nf as u64);
        let eew_c = self.ir.constant(eew as u64);
        let masked_c = self.ir.constant(masked as u64);
        match mop(insn) {
            0b00 => match rs2 {
                LUMOP_UNIT => {
                    self.ir.gen_helper(
                        HelperId::VStoreUnit,
                        None,
                        &[vs3_c, rs1_c, nf_c, eew_c, masked_c],
                    );
                }
                LUMOP_WHOLE => {
                    let fields = nf + 1;
                    if masked || !fields.is_power_of_two() || eew != 8 {
                        self.kill_unknown();
                        return;
                    }
                    let fields_c = self.ir.constant(fields as u64);
                    self.ir.gen_helper(HelperId::VStoreWhole, None, &[vs3_c, rs1_c, fields_c]);
                }
                LUMOP_MASK => {
                    if masked || eew != 8 || nf != 0 {
                        self.kill_unknown();
                        return;
                    }
                    self.ir.gen_helper(HelperId::VStoreMask, None, &[vs3_c, rs1_c]);
                }
                _ => self.kill_unknown(),
            },
            0b10 => {
                let rs2_c = self.ir.constant(rs2 as u64);
                self.ir.gen_helper(
                    HelperId::VStoreStride,
                    None,
                    &[vs3_c, rs1_c, rs2_c, nf_c, eew_c, masked_c],
                );
            }
            _ => {
                if eew == 64 && self.cpu.xlen == super::Xlen::Rv32 {
                    self.kill_unknown();
                    return;
                }
                let vs2_c = self.ir.constant(rs2 as u64);
                self.ir.gen_helper(
                    HelperId::VStoreIndexed,
                    None,
                    &[vs3_c, rs1_c, vs2_c, nf_c, eew_c, masked_c],
                );
            }
        }
    }

    /// OP-V arithmetic decode. The integer OPIVV/OPIVX/OPIVI forms collapse
    /// onto one generic lane helper keyed by funct6.
    pub(super) fn gen_v_arith(&mut self, insn: u32) {
        if !self.cpu.has_vector() {
            self.log_disabled_vector();
            return;
        }
        let funct3 = (insn >> 12) & 7;
        if funct3 == 0b111 {
            self.gen_v_cfg(insn);
            return;
        }
        self.gen_vill_check();

        let vd = (insn >> 7) & 0x1f;
        let vs2 = (insn >> 20) & 0x1f;
        let funct6 = (insn >> 26) & 0x3f;
        let masked = !vm_bit(insn);

        let f6_c = self.ir.constant(funct6 as u64);
        let vd_c = self.ir.constant(vd as u64);
        let vs2_c = self.ir.constant(vs2 as u64);
        let masked_c = self.ir.constant(masked as u64);
        match funct3 {
            0b000 => {
                // OPIVV
                let vs1 = (insn >> 15) & 0x1f;
                let vs1_c = self.ir.constant(vs1 as u64);
                self.ir
                    .gen_helper(HelperId::VOpIvv, None, &[f6_c, vd_c, vs1_c, vs2_c, masked_c]);
            }
            0b100 => {
                // OPIVX
                let rs1 = (insn >> 15) & 0x1f;
                let rs1_c = self.ir.constant(rs1 as u64);
                self.ir
                    .gen_helper(HelperId::VOpIvx, None, &[f6_c, vd_c, rs1_c, vs2_c, masked_c]);
            }
            0b011 => {
                // OPIVI: the 5-bit immediate sign-extends.
                let imm = ((insn >> 15) & 0x1f) as i32;
                let imm = (imm << 27) >> 27;
                let imm_c = self.ir.constant(imm as i64 as u64);
                self.ir
                    .gen_helper(HelperId::VOpIvi, None, &[f6_c, vd_c, imm_c, vs2_c, masked_c]);
            }
            _ => {
                // OPMVV/OPMVX/OPFVV/OPFVF are not modelled.
                self.kill_unknown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_field_maps_to_element_width() {
        assert_eq!(vector_eew(0b000), Some(8));
        assert_eq!(vector_eew(0b101), Some(16));
        assert_eq!(vector_eew(0b110), Some(32));
        assert_eq!(vector_eew(0b111), Some(64));
        // Scalar FP widths do not decode as vector.
        assert_eq!(vector_eew(0b010), None);
        assert_eq!(vector_eew(0b011), None);
    }
}
