//! This module provides the compressed (RVC) expansion: each 16-bit parcel
//! is rewritten into its 32-bit equivalent at decode time, so the scalar
//! decoder only ever sees full-width encodings. Reserved patterns expand to
//! an error and the caller raises IllegalInstruction.

use super::Xlen;

/// Expansion failure: the parcel is a reserved RVC encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReservedEncoding;

fn bit(value: u16, n: u32) -> u32 {
    ((value >> n) & 1) as u32
}

fn bits(value: u16, lo: u32, count: u32) -> u32 {
    ((value >> lo) as u32) & ((1 << count) - 1)
}

/// x8..x15, the registers reachable from the 3-bit fields.
fn creg(field: u32) -> u32 {
    field + 8
}

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xfff) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 5) & 0x7f) << 25 | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm & 0x1f) << 7 | opcode
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 1) << 7
        | opcode
}

fn u_type(imm: i32, rd: u32, opcode: u32) -> u32 {
    ((imm as u32) & 0xfffff000) | (rd << 7) | opcode
}

fn j_type(imm: i32, rd: u32, opcode: u32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & 0xff) << 12
        | (rd << 7)
        | opcode
}

/// Expands one RVC parcel into its 32-bit equivalent.
pub fn expand(parcel: u16, xlen: Xlen) -> Result<u32, ReservedEncoding> {
    if parcel == 0 {
        return Err(ReservedEncoding);
    }
    match parcel & 3 {
        0 => expand_c0(parcel, xlen),
        1 => expand_c1(parcel, xlen),
        2 => expand_c2(parcel, xlen),
        _ => Err(ReservedEncoding),
    }
}

fn expand_c0(parcel: u16, xlen: Xlen) -> Result<u32, ReservedEncoding> {
    let rd = creg(bits(parcel, 2, 3));
    let rs1 = creg(bits(parcel, 7, 3));
    match bits(parcel, 13, 3) {
        0b000 => {
            // c.addi4spn -> addi rd', x2, nzuimm
            let imm = (bits(parcel, 11, 2) << 4
                | bits(parcel, 7, 4) << 6
                | bit(parcel, 6) << 2
                | bit(parcel, 5) << 3) as i32;
            if imm == 0 {
                return Err(ReservedEncoding);
            }
            Ok(i_type(imm, 2, 0b000, rd, 0x13))
        }
        0b001 => {
            // c.fld
            let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 5, 2) << 6) as i32;
            Ok(i_type(imm, rs1, 0b011, rd, 0x07))
        }
        0b010 => {
            // c.lw
            let imm = (bits(parcel, 10, 3) << 3 | bit(parcel, 6) << 2 | bit(parcel, 5) << 6) as i32;
            Ok(i_type(imm, rs1, 0b010, rd, 0x03))
        }
        0b011 => {
            let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 5, 2) << 6) as i32;
            match xlen {
                // c.flw
                Xlen::Rv32 => {
                    let imm = (bits(parcel, 10, 3) << 3 | bit(parcel, 6) << 2 | bit(parcel, 5) << 6) as i32;
                    Ok(i_type(imm, rs1, 0b010, rd, 0x07))
                }
                // c.ld
                Xlen::Rv64 => Ok(i_type(imm, rs1, 0b011, rd, 0x03)),
            }
        }
        0b101 => {
            // c.fsd
            let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 5, 2) << 6) as i32;
            Ok(s_type(imm, rd, rs1, 0b011, 0x27))
        }
        0b110 => {
            // c.sw
            let imm = (bits(parcel, 10, 3) << 3 | bit(parcel, 6) << 2 | bit(parcel, 5) << 6) as i32;
            Ok(s_type(imm, rd, rs1, 0b010, 0x23))
        }
        0b111 => {
            let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 5, 2) << 6) as i32;
            match xlen {
                // c.fsw
                Xlen::Rv32 => {
                    let imm = (bits(parcel, 10, 3) << 3 | bit(parcel, 6) << 2 | bit(parcel, 5) << 6) as i32;
                    Ok(s_type(imm, rd, rs1, 0b010, 0x27))
                }
                // c.sd
                Xlen::Rv64 => Ok(s_type(imm, rd, rs1, 0b011, 0x23)),
            }
        }
        _ => Err(ReservedEncoding),
    }
}

fn expand_c1(parcel: u16, xlen: Xlen) -> Result<u32, ReservedEncoding> {
    let rd = bits(parcel, 7, 5);
    let imm6 = ((bit(parcel, 12) << 5 | bits(parcel, 2, 5)) as i32) << 26 >> 26;
    match bits(parcel, 13, 3) {
        0b000 => {
            // c.addi (c.nop when rd == 0)
            Ok(i_type(imm6, rd, 0b000, rd, 0x13))
        }
        0b001 => match xlen {
            // c.jal
            Xlen::Rv32 => Ok(j_type(c_j_imm(parcel), 1, 0x6f)),
            // c.addiw
            Xlen::Rv64 => {
                if rd == 0 {
                    return Err(ReservedEncoding);
                }
                Ok(i_type(imm6, rd, 0b000, rd, 0x1b))
            }
        },
        0b010 => {
            // c.li -> addi rd, x0, imm
            Ok(i_type(imm6, 0, 0b000, rd, 0x13))
        }
        0b011 => {
            if rd == 2 {
                // c.addi16sp
                let imm = ((bit(parcel, 12) << 9
                    | bit(parcel, 6) << 4
                    | bit(parcel, 5) << 6
                    | bits(parcel, 3, 2) << 7
                    | bit(parcel, 2) << 5) as i32)
                    << 22
                    >> 22;
                if imm == 0 {
                    return Err(ReservedEncoding);
                }
                Ok(i_type(imm, 2, 0b000, 2, 0x13))
            } else {
                // c.lui
                if imm6 == 0 {
                    return Err(ReservedEncoding);
                }
                Ok(u_type(imm6 << 12, rd, 0x37))
            }
        }
        0b100 => {
            let rd = creg(bits(parcel, 7, 3));
            let shamt = (bit(parcel, 12) << 5 | bits(parcel, 2, 5)) as i32;
            match bits(parcel, 10, 2) {
                0b00 => Ok(i_type(shamt, rd, 0b101, rd, 0x13)), // c.srli
                0b01 => Ok(i_type(shamt | 0x400, rd, 0b101, rd, 0x13)), // c.srai
                0b10 => Ok(i_type(imm6, rd, 0b111, rd, 0x13)),  // c.andi
                _ => {
                    let rs2 = creg(bits(parcel, 2, 3));
                    match (bit(parcel, 12), bits(parcel, 5, 2)) {
                        (0, 0b00) => Ok(r_type(0x20, rs2, rd, 0b000, rd, 0x33)), // c.sub
                        (0, 0b01) => Ok(r_type(0x00, rs2, rd, 0b100, rd, 0x33)), // c.xor
                        (0, 0b10) => Ok(r_type(0x00, rs2, rd, 0b110, rd, 0x33)), // c.or
                        (0, 0b11) => Ok(r_type(0x00, rs2, rd, 0b111, rd, 0x33)), // c.and
                        (1, 0b00) if xlen == Xlen::Rv64 => {
                            Ok(r_type(0x20, rs2, rd, 0b000, rd, 0x3b)) // c.subw
                        }
                        (1, 0b01) if xlen == Xlen::Rv64 => {
                            Ok(r_type(0x00, rs2, rd, 0b000, rd, 0x3b)) // c.addw
                        }
                        _ => Err(ReservedEncoding),
                    }
                }
            }
        }
        0b101 => Ok(j_type(c_j_imm(parcel), 0, 0x6f)), // c.j
        0b110 => {
            // c.beqz
            Ok(b_type(c_b_imm(parcel), 0, creg(bits(parcel, 7, 3)), 0b000, 0x63))
        }
        _ => {
            // c.bnez
            Ok(b_type(c_b_imm(parcel), 0, creg(bits(parcel, 7, 3)), 0b001, 0x63))
        }
    }
}

fn c_j_imm(parcel: u16) -> i32 {
    ((bit(parcel, 12) << 11
        | bit(parcel, 11) << 4
        | bits(parcel, 9, 2) << 8
        | bit(parcel, 8) << 10
        | bit(parcel, 7) << 6
        | bit(parcel, 6) << 7
        | bits(parcel, 3, 3) << 1
        | bit(parcel, 2) << 5) as i32)
        << 20
        >> 20
}

fn c_b_imm(parcel: u16) -> i32 {
    ((bit(parcel, 12) << 8
        | bits(parcel, 10, 2) << 3
        | bits(parcel, 5, 2) << 6
        | bits(parcel, 3, 2) << 1
        | bit(parcel, 2) << 5) as i32)
        << 23
        >> 23
}

fn expand_c2(parcel: u16, xlen: Xlen) -> Result<u32, ReservedEncoding> {
    let rd = bits(parcel, 7, 5);
    let rs2 = bits(parcel, 2, 5);
    match bits(parcel, 13, 3) {
        0b000 => {
            // c.slli
            let shamt = (bit(parcel, 12) << 5 | bits(parcel, 2, 5)) as i32;
            Ok(i_type(shamt, rd, 0b001, rd, 0x13))
        }
        0b001 => {
            // c.fldsp
            let imm = (bit(parcel, 12) << 5 | bits(parcel, 5, 2) << 3 | bits(parcel, 2, 3) << 6) as i32;
            Ok(i_type(imm, 2, 0b011, rd, 0x07))
        }
        0b010 => {
            // c.lwsp
            if rd == 0 {
                return Err(ReservedEncoding);
            }
            let imm = (bit(parcel, 12) << 5 | bits(parcel, 4, 3) << 2 | bits(parcel, 2, 2) << 6) as i32;
            Ok(i_type(imm, 2, 0b010, rd, 0x03))
        }
        0b011 => match xlen {
            // c.flwsp
            Xlen::Rv32 => {
                let imm = (bit(parcel, 12) << 5 | bits(parcel, 4, 3) << 2 | bits(parcel, 2, 2) << 6) as i32;
                Ok(i_type(imm, 2, 0b010, rd, 0x07))
            }
            // c.ldsp
            Xlen::Rv64 => {
                if rd == 0 {
                    return Err(ReservedEncoding);
                }
                let imm = (bit(parcel, 12) << 5 | bits(parcel, 5, 2) << 3 | bits(parcel, 2, 3) << 6) as i32;
                Ok(i_type(imm, 2, 0b011, rd, 0x03))
            }
        },
        0b100 => {
            if bit(parcel, 12) == 0 {
                if rs2 == 0 {
                    // c.jr
                    if rd == 0 {
                        return Err(ReservedEncoding);
                    }
                    Ok(i_type(0, rd, 0b000, 0, 0x67))
                } else {
                    // c.mv -> add rd, x0, rs2
                    Ok(r_type(0x00, rs2, 0, 0b000, rd, 0x33))
                }
            } else if rs2 == 0 {
                if rd == 0 {
                    // c.ebreak
                    Ok(i_type(1, 0, 0b000, 0, 0x73))
                } else {
                    // c.jalr
                    Ok(i_type(0, rd, 0b000, 1, 0x67))
                }
            } else {
                // c.add
                Ok(r_type(0x00, rs2, rd, 0b000, rd, 0x33))
            }
        }
        0b101 => {
            // c.fsdsp
            let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 7, 3) << 6) as i32;
            Ok(s_type(imm, rs2, 2, 0b011, 0x27))
        }
        0b110 => {
            // c.swsp
            let imm = (bits(parcel, 9, 4) << 2 | bits(parcel, 7, 2) << 6) as i32;
            Ok(s_type(imm, rs2, 2, 0b010, 0x23))
        }
        _ => match xlen {
            // c.fswsp
            Xlen::Rv32 => {
                let imm = (bits(parcel, 9, 4) << 2 | bits(parcel, 7, 2) << 6) as i32;
                Ok(s_type(imm, rs2, 2, 0b010, 0x27))
            }
            // c.sdsp
            Xlen::Rv64 => {
                let imm = (bits(parcel, 10, 3) << 3 | bits(parcel, 7, 3) << 6) as i32;
                Ok(s_type(imm, rs2, 2, 0b011, 0x23))
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addi4spn_zero_immediate_is_reserved() {
        // funct3 000, op 00, rd' = x8, imm = 0.
        assert_eq!(expand(0x0000, Xlen::Rv64), Err(ReservedEncoding));
        assert_eq!(expand(0x0004, Xlen::Rv64), Err(ReservedEncoding));
    }

    #[test]
    fn addi4spn_expands_to_addi_off_sp() {
        // c.addi4spn x8, 16: nzuimm[5:4] = 01 in bits [12:11], rd' = x8.
        let parcel: u16 = 0b000_01_0000_0_0_000_00;
        let word = expand(parcel, Xlen::Rv64).unwrap();
        assert_eq!(word & 0x7f, 0x13); // addi opcode
        assert_eq!((word >> 15) & 0x1f, 2); // rs1 = sp
        assert_eq!((word >> 7) & 0x1f, 8); // rd = x8
        assert_eq!(word >> 20, 16);
    }

    #[test]
    fn c_li_expands_to_addi_from_zero() {
        // c.li x10, -1: funct3 010, rd=10, imm=-1 (bit12=1, bits6:2=11111).
        let parcel: u16 = 0b010_1_01010_11111_01;
        let word = expand(parcel, Xlen::Rv64).unwrap();
        assert_eq!(word & 0x7f, 0x13);
        assert_eq!((word >> 7) & 0x1f, 10);
        assert_eq!((word >> 15) & 0x1f, 0);
        assert_eq!(word >> 20, 0xfff); // -1 as a 12-bit immediate
    }

    #[test]
    fn c_lui_zero_immediate_is_reserved() {
        // c.lui x5, 0.
        let parcel: u16 = 0b011_0_00101_00000_01;
        assert_eq!(expand(parcel, Xlen::Rv64), Err(ReservedEncoding));
    }

    #[test]
    fn c_addi16sp_zero_immediate_is_reserved() {
        let parcel: u16 = 0b011_0_00010_00000_01;
        assert_eq!(expand(parcel, Xlen::Rv64), Err(ReservedEncoding));
    }

    #[test]
    fn c_jr_with_zero_rs1_is_reserved() {
        let parcel: u16 = 0b100_0_00000_00000_10;
        assert_eq!(expand(parcel, Xlen::Rv64), Err(ReservedEncoding));
    }

    #[test]
    fn c_jr_expands_to_jalr() {
        // c.jr x1 (ret).
        let parcel: u16 = 0b100_0_00001_00000_10;
        let word = expand(parcel, Xlen::Rv64).unwrap();
        assert_eq!(word & 0x7f, 0x67);
        assert_eq!((word >> 7) & 0x1f, 0); // rd = x0
        assert_eq!((word >> 15) & 0x1f, 1);
    }

    #[test]
    fn c_ebreak_expands() {
        let parcel: u16 = 0b100_1_00000_00000_10;
        let word = expand(parcel, Xlen::Rv64).unwrap();
        assert_eq!(word, 0x0010_0073);
    }

    #[test]
    fn c_addiw_with_zero_rd_is_reserved_on_rv64() {
        let parcel: u16 = 0b001_0_00000_00001_01;
        assert_eq!(expand(parcel, Xlen::Rv64), Err(ReservedEncoding));
        // The same parcel is c.jal on RV32.
        assert!(expand(parcel, Xlen::Rv32).is_ok());
    }

    #[test]
    fn c_sub_expands_to_sub() {
        // c.sub x8, x9: funct3 100, bits11:10 = 11, bit12 = 0, bits6:5 = 00.
        let parcel: u16 = 0b100_0_11_000_00_001_01;
        let word = expand(parcel, Xlen::Rv64).unwrap();
        assert_eq!(word & 0x7f, 0x33);
        assert_eq!(word >> 25, 0x20);
        assert_eq!((word >> 7) & 0x1f, 8);
        assert_eq!((word >> 20) & 0x1f, 9);
    }
}
