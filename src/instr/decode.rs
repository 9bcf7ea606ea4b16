//! Instruction classification and field extraction
//!
//! A 32-bit instruction word is matched against an ordered catalogue
//! of mask/value rules covering the supported A64 integer subset.
//! The first matching rule supplies the semantic opcode tag; rules
//! for more tightly constrained encodings (exact words, the multiply
//! alias of madd, the zero-shift subtract) are listed before the
//! general patterns they specialise. After classification every
//! field any form could reference is sliced out of the word.

use crate::cpu::ExecutionError;
use crate::instr::{Cond, Instr, Opcode};
use crate::utils::{extract_field, mask, ror, sign_extend, width_mask};

/// One classification rule: the instruction matches when
/// `word & mask == value`
struct DecodeRule {
    mask: u32,
    value: u32,
    op: Opcode,
}

fn rule(mask: u32, value: u32, op: Opcode) -> DecodeRule {
    DecodeRule { mask, value, op }
}

/// Catalogue of classification rules, tried in order
pub struct Decoder {
    rules: Vec<DecodeRule>,
}

impl Decoder {
    pub fn new() -> Self {
        use Opcode::*;
        let rules = vec![
            // Exact words first
            rule(0xffff_ffff, 0xd503_201f, Nop),
            rule(0xffe0_001f, 0xd400_0001, Svc),
            rule(0xffff_fc1f, 0xd65f_0000, Ret),
            // Branches
            rule(0xff00_0010, 0x5400_0000, BCond(Cond::Eq)),
            rule(0x7f00_0000, 0x3400_0000, Cbz),
            rule(0x7f00_0000, 0x3500_0000, Cbnz),
            rule(0xfc00_0000, 0x1400_0000, B),
            rule(0xfc00_0000, 0x9400_0000, Bl),
            // Wide moves
            rule(0x7f80_0000, 0x5280_0000, Movz),
            rule(0x7f80_0000, 0x7280_0000, Movk),
            // Divides, then the mul alias of madd, then general madd
            rule(0xffe0_fc00, 0x1ac0_0800, Udiv32),
            rule(0xffe0_fc00, 0x9ac0_0800, Udiv64),
            rule(0xffe0_fc00, 0x1ac0_0c00, Sdiv32),
            rule(0xffe0_fc00, 0x9ac0_0c00, Sdiv64),
            rule(0xffe0_fc00, 0x1b00_7c00, Mul32),
            rule(0xffe0_fc00, 0x9b00_7c00, Mul64),
            rule(0x7fe0_8000, 0x1b00_0000, Madd),
            // Immediate arithmetic and logic
            rule(0x7f80_0000, 0x1100_0000, AddImm),
            rule(0x7f80_0000, 0x5100_0000, SubImm),
            rule(0x7f80_0000, 0x7100_0000, SubsImm),
            rule(0x7f80_0000, 0x1200_0000, AndImm),
            rule(0x7f80_0000, 0x3200_0000, OrrImm),
            rule(0x7f80_0000, 0x5300_0000, Ubfm),
            // Register arithmetic and logic; the plain subtract is
            // the shifted form with a zero shift
            rule(0x7f20_0000, 0x0b00_0000, AddReg),
            rule(0x7fe0_fc00, 0x4b00_0000, SubReg),
            rule(0x7f20_0000, 0x4b00_0000, SubShifted),
            rule(0x7f20_0000, 0x6b00_0000, SubsShifted),
            rule(0x7f20_0000, 0x2a00_0000, OrrReg),
            // PC-relative loads
            rule(0xff00_0000, 0x1800_0000, LdrPc32),
            rule(0xff00_0000, 0x5800_0000, LdrPc64),
            rule(0xff00_0000, 0x9800_0000, LdrPc32s),
            // Pair transfers
            rule(0x3e40_0000, 0x2840_0000, Ldp),
            rule(0x3e40_0000, 0x2800_0000, Stp),
            // Byte loads and stores
            //   00111001.1............ unsigned offset
            //   00111000.10......?1.. pre/post indexed
            //   00111000.11......10.. register offset
            rule(0xffc0_0000, 0x3940_0000, LdrbImm),
            rule(0xffe0_0400, 0x3840_0400, LdrbImm),
            rule(0xffe0_0c00, 0x3860_0800, LdrbReg),
            rule(0xffc0_0000, 0x3900_0000, StrbImm),
            rule(0xffe0_0400, 0x3800_0400, StrbImm),
            rule(0xffe0_0c00, 0x3820_0800, StrbReg),
            // Word/doubleword loads and stores
            //   1.111001?1............ unsigned offset
            //   1.111000?10......?1.. pre/post indexed
            //   1.111000?11.....ooS10.. register offset
            //   1.111000?10......00.. unscaled offset
            rule(0xbfc0_0000, 0xb940_0000, LdrImm),
            rule(0xbfe0_0400, 0xb840_0400, LdrImm),
            rule(0xbfe0_0c00, 0xb860_0800, LdrReg),
            rule(0xbfe0_0c00, 0xb840_0000, LdrUnscaled),
            rule(0xbfc0_0000, 0xb900_0000, StrImm),
            rule(0xbfe0_0c00, 0xb800_0c00, StrPre),
            rule(0xbfe0_0c00, 0xb800_0400, StrPost),
            rule(0xbfe0_0c00, 0xb820_0800, StrReg),
        ];
        Self { rules }
    }

    /// Classify a word into its semantic opcode tag. An unmatched
    /// word classifies as Unknown rather than failing.
    pub fn classify(&self, word: u32) -> Opcode {
        for rule in &self.rules {
            if word & rule.mask == rule.value {
                return match rule.op {
                    // The condition is sliced from the word after the
                    // pattern match
                    Opcode::BCond(_) => match Cond::from_field(extract_field(word, 3, 0)) {
                        Some(cond) => Opcode::BCond(cond),
                        None => Opcode::Unknown,
                    },
                    op => op,
                };
            }
        }
        Opcode::Unknown
    }

    /// Classify a word and slice out every operand field
    pub fn decode(&self, word: u32) -> Instr {
        let op = self.classify(word);
        let regsize = if extract_field(word, 31, 31) == 1 {
            64
        } else {
            32
        };
        Instr {
            word,
            op,
            rm: extract_field(word, 20, 16) as u8,
            rn: extract_field(word, 9, 5) as u8,
            rd: extract_field(word, 4, 0) as u8,
            rt: extract_field(word, 4, 0) as u8,
            rt2: extract_field(word, 14, 10) as u8,
            shamt: extract_field(word, 15, 10),
            shift: extract_field(word, 23, 22),
            lshift: extract_field(word, 22, 22),
            hw: extract_field(word, 22, 21),
            n: extract_field(word, 22, 22),
            immr: extract_field(word, 21, 16),
            imms: extract_field(word, 15, 10),
            uimm6: extract_field(word, 15, 10).into(),
            uimm12: extract_field(word, 21, 10).into(),
            imm16: extract_field(word, 20, 5).into(),
            simm7: sign_extend(extract_field(word, 21, 15).into(), 7),
            simm9: sign_extend(extract_field(word, 20, 12).into(), 9),
            imm19: sign_extend(extract_field(word, 23, 5).into(), 19),
            imm26: sign_extend(extract_field(word, 25, 0).into(), 26),
            sizebits: extract_field(word, 31, 30),
            regsize,
            regsize_mask: width_mask(regsize),
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconstruct the wmask/tmask pair of a logical-immediate or
/// bitfield encoding from its N, imms and immr fields.
///
/// The element length is given by the position of the highest set
/// bit of N:NOT(imms); an element of S+1 ones is rotated right by R
/// and replicated across the operand width. Encodings with no set
/// length bit, an element wider than the operand, or (in the
/// immediate forms) an all-ones element are reserved.
pub fn decode_bit_masks(
    n: u32,
    imms: u32,
    immr: u32,
    immediate: bool,
    width: u32,
) -> Result<(u64, u64), ExecutionError> {
    let combined = (n << 6) | (!imms & 0x3f);
    if combined < 2 {
        return Err(ExecutionError::MalformedImmediate);
    }
    let len = 31 - combined.leading_zeros();
    let esize = 1 << len;
    if esize > width {
        return Err(ExecutionError::MalformedImmediate);
    }
    let levels = mask::<u32>(len);
    let s = imms & levels;
    let r = immr & levels;
    if immediate && s == levels {
        return Err(ExecutionError::MalformedImmediate);
    }
    let diff = s.wrapping_sub(r) & levels;
    let welem = width_mask(s + 1);
    let telem = width_mask(diff + 1);
    let wmask = replicate(ror(welem, esize, r), esize, width);
    let tmask = replicate(telem, esize, width);
    Ok((wmask, tmask))
}

fn replicate(element: u64, esize: u32, width: u32) -> u64 {
    let mut value = 0;
    let mut shift = 0;
    while shift < width {
        value |= element << shift;
        shift += esize;
    }
    value
}
