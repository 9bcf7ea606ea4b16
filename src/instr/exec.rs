//! Instruction execution
//!
//! Applies the effect of a decoded instruction to the processor
//! state. Dispatch is a match over the opcode tag; each arm reads
//! only the operand fields its form defines. Operand width is
//! selected by the instruction's size flag: 32-bit results are
//! masked and stored zero-extended, so the upper half of a
//! destination register is always cleared by a 32-bit write.
//!
//! Register index 31 is the zero register for data-processing
//! register forms, and the stack pointer for the add/sub immediate
//! destinations/sources, the logical immediate destinations, and
//! every load/store base.

use std::io::{self, Read};

use crate::cpu::{Cpu, ExecutionError};
use crate::instr::decode::decode_bit_masks;
use crate::instr::{Instr, Opcode};
use crate::memory::Wordsize;
use crate::utils::{
    extract_field, interpret_i64_as_unsigned, ror, sign_extend, width_mask,
};

// AArch64 Linux system call numbers
const SYS_READ: u64 = 0x3f;
const SYS_WRITE: u64 = 0x40;
const SYS_EXIT: u64 = 0x5d;

/// Read a register as an operand, with index 31 denoting the stack
/// pointer (add/sub immediate sources and load/store bases)
fn reg_or_sp(cpu: &Cpu, which: u8) -> u64 {
    if which == 31 {
        cpu.sp
    } else {
        cpu.registers.get(which)
    }
}

/// Write a register, with index 31 denoting the stack pointer
fn set_reg_or_sp(cpu: &mut Cpu, which: u8, value: u64) {
    if which == 31 {
        cpu.sp = value
    } else {
        cpu.registers.set(which, value)
    }
}

/// Set the APSR flags for the subtraction a - b (operands already
/// masked to the operand width)
fn set_flags(cpu: &mut Cpu, result: u64, a: u64, b: u64, mask: u64) {
    let sign_bit = (mask >> 1) + 1;
    cpu.apsr.negative = result & sign_bit != 0;
    cpu.apsr.zero = result == 0;
    cpu.apsr.overflow = (a ^ b) & sign_bit != 0 && (result ^ a) & sign_bit != 0;
    cpu.apsr.carry = a >= b;
}

/// Shift a second operand by the two-bit shift-type field
/// (0 lsl, 1 lsr, 2 asr)
fn shifted_operand(
    value: u64,
    shift_type: u32,
    amount: u32,
    regsize: u32,
) -> Result<u64, ExecutionError> {
    let mask = width_mask(regsize);
    let value = value & mask;
    let shifted = match shift_type {
        0b00 => value << amount,
        0b01 => value >> amount,
        0b10 => interpret_i64_as_unsigned(sign_extend(value, regsize) >> amount),
        _ => return Err(ExecutionError::UnimplementedVariant("ror-shifted operand")),
    };
    Ok(shifted & mask)
}

/// The add/sub immediate operand, optionally shifted up 12 bits
fn imm12_operand(ir: &Instr) -> u64 {
    if ir.lshift == 1 {
        ir.uimm12 << 12
    } else {
        ir.uimm12
    }
}

pub fn execute(cpu: &mut Cpu, ir: &Instr) -> Result<(), ExecutionError> {
    let m = ir.regsize_mask;
    match ir.op {
        Opcode::Nop => Ok(()),

        Opcode::AddReg => {
            let value = cpu
                .registers
                .get(ir.rn)
                .wrapping_add(cpu.registers.get(ir.rm));
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::AddImm => {
            let value = reg_or_sp(cpu, ir.rn).wrapping_add(imm12_operand(ir));
            set_reg_or_sp(cpu, ir.rd, value & m);
            Ok(())
        }
        Opcode::SubReg => {
            let value = cpu
                .registers
                .get(ir.rn)
                .wrapping_sub(cpu.registers.get(ir.rm));
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::SubImm => {
            let value = reg_or_sp(cpu, ir.rn).wrapping_sub(imm12_operand(ir));
            set_reg_or_sp(cpu, ir.rd, value & m);
            Ok(())
        }
        Opcode::SubShifted | Opcode::SubsShifted => {
            let a = cpu.registers.get(ir.rn) & m;
            let b = shifted_operand(cpu.registers.get(ir.rm), ir.shift, ir.shamt, ir.regsize)?;
            let result = a.wrapping_sub(b) & m;
            if ir.op == Opcode::SubsShifted {
                set_flags(cpu, result, a, b, m);
            }
            cpu.registers.set(ir.rd, result);
            Ok(())
        }
        Opcode::SubsImm => {
            let a = reg_or_sp(cpu, ir.rn) & m;
            let b = imm12_operand(ir) & m;
            let result = a.wrapping_sub(b) & m;
            set_flags(cpu, result, a, b, m);
            cpu.registers.set(ir.rd, result);
            Ok(())
        }

        Opcode::AndImm | Opcode::OrrImm => {
            let (imm, _) = decode_bit_masks(ir.n, ir.imms, ir.immr, true, ir.regsize)?;
            let a = cpu.registers.get(ir.rn) & m;
            let result = if ir.op == Opcode::AndImm {
                a & imm
            } else {
                a | imm
            };
            // The destination may be the stack pointer for the
            // logical immediates
            set_reg_or_sp(cpu, ir.rd, result & m);
            Ok(())
        }
        Opcode::OrrReg => {
            let b = match ir.shift {
                0b00 | 0b01 => {
                    shifted_operand(cpu.registers.get(ir.rm), ir.shift, ir.shamt, ir.regsize)?
                }
                0b10 => {
                    return Err(ExecutionError::UnimplementedVariant(
                        "asr shift in the or-register form",
                    ))
                }
                _ => {
                    return Err(ExecutionError::UnimplementedVariant(
                        "ror shift in the or-register form",
                    ))
                }
            };
            let a = cpu.registers.get(ir.rn) & m;
            cpu.registers.set(ir.rd, (a | b) & m);
            Ok(())
        }
        Opcode::Ubfm => {
            let (wmask, tmask) = decode_bit_masks(ir.n, ir.imms, ir.immr, false, ir.regsize)?;
            let src = cpu.registers.get(ir.rn) & m;
            let bot = ror(src, ir.regsize, ir.immr) & wmask;
            cpu.registers.set(ir.rd, bot & tmask);
            Ok(())
        }

        Opcode::Madd => {
            let product = cpu
                .registers
                .get(ir.rn)
                .wrapping_mul(cpu.registers.get(ir.rm));
            let value = cpu.registers.get(ir.rt2).wrapping_add(product);
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::Mul32 | Opcode::Mul64 => {
            let value = cpu
                .registers
                .get(ir.rn)
                .wrapping_mul(cpu.registers.get(ir.rm));
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::Udiv32 | Opcode::Udiv64 => {
            let a = cpu.registers.get(ir.rn) & m;
            let b = cpu.registers.get(ir.rm) & m;
            // Division by zero yields zero, not a fault
            let value = if b == 0 { 0 } else { a / b };
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::Sdiv32 | Opcode::Sdiv64 => {
            let a = sign_extend(cpu.registers.get(ir.rn) & m, ir.regsize);
            let b = sign_extend(cpu.registers.get(ir.rm) & m, ir.regsize);
            // Division by zero yields zero; dividing the most
            // negative value by -1 wraps
            let value = if b == 0 { 0 } else { a.wrapping_div(b) };
            cpu.registers.set(ir.rd, interpret_i64_as_unsigned(value) & m);
            Ok(())
        }

        Opcode::Movz => {
            let value = ir.imm16 << (16 * ir.hw);
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }
        Opcode::Movk => {
            let hole = 0xffffu64 << (16 * ir.hw);
            let old = cpu.registers.get(ir.rd);
            let value = (old & !hole) | ir.imm16 << (16 * ir.hw);
            cpu.registers.set(ir.rd, value & m);
            Ok(())
        }

        Opcode::LdrbImm => {
            let (addr, writeback) = indexed_address(cpu, ir, 0);
            let value = cpu.memory.read(addr, Wordsize::Byte)?;
            cpu.registers.set(ir.rt, value);
            commit_writeback(cpu, ir, writeback);
            Ok(())
        }
        Opcode::LdrbReg => {
            let addr = reg_or_sp(cpu, ir.rn).wrapping_add(cpu.registers.get(ir.rm));
            let value = cpu.memory.read(addr, Wordsize::Byte)?;
            cpu.registers.set(ir.rt, value);
            Ok(())
        }
        Opcode::LdrImm => {
            let (addr, writeback) = indexed_address(cpu, ir, ir.sizebits);
            let value = cpu.memory.read(addr, Wordsize::from_scale(ir.sizebits))?;
            cpu.registers.set(ir.rt, value);
            commit_writeback(cpu, ir, writeback);
            Ok(())
        }
        Opcode::LdrReg => {
            let addr = register_offset_address(cpu, ir);
            let value = cpu.memory.read(addr, Wordsize::from_scale(ir.sizebits))?;
            cpu.registers.set(ir.rt, value);
            Ok(())
        }
        Opcode::LdrUnscaled => {
            let addr = reg_or_sp(cpu, ir.rn).wrapping_add_signed(ir.simm9);
            let value = cpu.memory.read(addr, Wordsize::from_scale(ir.sizebits))?;
            cpu.registers.set(ir.rt, value);
            Ok(())
        }
        Opcode::LdrPc32 | Opcode::LdrPc32s | Opcode::LdrPc64 => {
            let addr = cpu.pc.wrapping_add_signed(ir.imm19 << 2);
            let value = match ir.op {
                Opcode::LdrPc64 => cpu.memory.read(addr, Wordsize::Doubleword)?,
                Opcode::LdrPc32 => cpu.memory.read(addr, Wordsize::Word)?,
                _ => {
                    let word = cpu.memory.read(addr, Wordsize::Word)?;
                    interpret_i64_as_unsigned(sign_extend(word, 32))
                }
            };
            cpu.registers.set(ir.rt, value);
            Ok(())
        }
        Opcode::Ldp => {
            let (size, signed) = match ir.sizebits {
                0b00 => (Wordsize::Word, false),
                0b01 => (Wordsize::Word, true),
                0b10 => (Wordsize::Doubleword, false),
                other => return Err(ExecutionError::BadSize(other)),
            };
            let (addr, writeback) = pair_address(cpu, ir, size);
            let mut first = cpu.memory.read(addr, size)?;
            let mut second = cpu.memory.read(addr.wrapping_add(size.width()), size)?;
            if signed {
                first = interpret_i64_as_unsigned(sign_extend(first, 32));
                second = interpret_i64_as_unsigned(sign_extend(second, 32));
            }
            cpu.registers.set(ir.rt, first);
            cpu.registers.set(ir.rt2, second);
            commit_writeback(cpu, ir, writeback);
            Ok(())
        }

        Opcode::StrbImm => {
            let (addr, writeback) = indexed_address(cpu, ir, 0);
            let value = cpu.registers.get(ir.rt);
            cpu.memory.write(addr, value & 0xff, Wordsize::Byte)?;
            commit_writeback(cpu, ir, writeback);
            Ok(())
        }
        Opcode::StrbReg => {
            let addr = reg_or_sp(cpu, ir.rn).wrapping_add(cpu.registers.get(ir.rm));
            let value = cpu.registers.get(ir.rt);
            cpu.memory.write(addr, value & 0xff, Wordsize::Byte)?;
            Ok(())
        }
        Opcode::StrImm => {
            let offset = ir.uimm12 << ir.sizebits;
            let addr = reg_or_sp(cpu, ir.rn).wrapping_add(offset);
            let value = cpu.registers.get(ir.rt);
            cpu.memory
                .write(addr, value, Wordsize::from_scale(ir.sizebits))?;
            Ok(())
        }
        Opcode::StrReg => {
            let addr = register_offset_address(cpu, ir);
            let value = cpu.registers.get(ir.rt);
            cpu.memory
                .write(addr, value, Wordsize::from_scale(ir.sizebits))?;
            Ok(())
        }
        Opcode::StrPre => {
            let addr = reg_or_sp(cpu, ir.rn).wrapping_add_signed(ir.simm9);
            let value = cpu.registers.get(ir.rt);
            cpu.memory
                .write(addr, value, Wordsize::from_scale(ir.sizebits))?;
            set_reg_or_sp(cpu, ir.rn, addr);
            Ok(())
        }
        Opcode::StrPost => {
            let base = reg_or_sp(cpu, ir.rn);
            let value = cpu.registers.get(ir.rt);
            cpu.memory
                .write(base, value, Wordsize::from_scale(ir.sizebits))?;
            set_reg_or_sp(cpu, ir.rn, base.wrapping_add_signed(ir.simm9));
            Ok(())
        }
        Opcode::Stp => {
            let size = match ir.sizebits {
                0b00 => Wordsize::Word,
                0b10 => Wordsize::Doubleword,
                other => return Err(ExecutionError::BadSize(other)),
            };
            let (addr, writeback) = pair_address(cpu, ir, size);
            cpu.memory.write(addr, cpu.registers.get(ir.rt), size)?;
            cpu.memory.write(
                addr.wrapping_add(size.width()),
                cpu.registers.get(ir.rt2),
                size,
            )?;
            commit_writeback(cpu, ir, writeback);
            Ok(())
        }

        Opcode::B => {
            cpu.branch_to(cpu.pc.wrapping_add_signed(ir.imm26 << 2));
            Ok(())
        }
        Opcode::Bl => {
            cpu.registers.set(30, cpu.pc.wrapping_add(4));
            cpu.branch_to(cpu.pc.wrapping_add_signed(ir.imm26 << 2));
            Ok(())
        }
        Opcode::Ret => {
            cpu.branch_to(cpu.registers.get(ir.rn));
            Ok(())
        }
        Opcode::BCond(cond) => {
            if cond.holds(&cpu.apsr) {
                cpu.branch_to(cpu.pc.wrapping_add_signed(ir.imm19 << 2));
            }
            Ok(())
        }
        Opcode::Cbz => {
            if cpu.registers.get(ir.rt) & m == 0 {
                cpu.branch_to(cpu.pc.wrapping_add_signed(ir.imm19 << 2));
            }
            Ok(())
        }
        Opcode::Cbnz => {
            if cpu.registers.get(ir.rt) & m != 0 {
                cpu.branch_to(cpu.pc.wrapping_add_signed(ir.imm19 << 2));
            }
            Ok(())
        }

        Opcode::Svc => supervisor_call(cpu),

        Opcode::Unknown => Err(ExecutionError::UnknownInstruction(ir.word)),
    }
}

/// Resolve the address of an immediate-offset load/store and
/// return it with the writeback value, if any. Bit 24 selects the
/// unsigned-offset form; otherwise bit 11 picks pre- over
/// post-indexing, both of which write the updated base back.
fn indexed_address(cpu: &Cpu, ir: &Instr, scale: u32) -> (u64, Option<u64>) {
    let base = reg_or_sp(cpu, ir.rn);
    if extract_field(ir.word, 24, 24) == 1 {
        (base.wrapping_add(ir.uimm12 << scale), None)
    } else {
        let updated = base.wrapping_add_signed(ir.simm9);
        let preindex = extract_field(ir.word, 11, 11) == 1;
        let addr = if preindex { updated } else { base };
        (addr, Some(updated))
    }
}

/// Resolve the address of a register-offset load/store; bit 12
/// scales the offset register by the transfer size
fn register_offset_address(cpu: &Cpu, ir: &Instr) -> u64 {
    let shift = if extract_field(ir.word, 12, 12) == 1 {
        ir.sizebits
    } else {
        0
    };
    let offset = cpu.registers.get(ir.rm) << shift;
    reg_or_sp(cpu, ir.rn).wrapping_add(offset)
}

/// Resolve the address of a pair transfer and return it with the
/// writeback value, if any. Bits 24:23 encode post-index (01),
/// signed offset (10) and pre-index (11).
fn pair_address(cpu: &Cpu, ir: &Instr, size: Wordsize) -> (u64, Option<u64>) {
    let scale = if size == Wordsize::Doubleword { 3 } else { 2 };
    let offset = ir.simm7 << scale;
    let base = reg_or_sp(cpu, ir.rn);
    let updated = base.wrapping_add_signed(offset);
    let prepost = extract_field(ir.word, 24, 23);
    let addr = if prepost == 0b01 { base } else { updated };
    let writeback = (prepost & 0b01 != 0).then_some(updated);
    (addr, writeback)
}

fn commit_writeback(cpu: &mut Cpu, ir: &Instr, writeback: Option<u64>) {
    if let Some(updated) = writeback {
        set_reg_or_sp(cpu, ir.rn, updated);
    }
}

/// Dispatch a supervisor call on the number in x8. Unknown numbers
/// are reported and skipped.
fn supervisor_call(cpu: &mut Cpu) -> Result<(), ExecutionError> {
    match cpu.registers.get(8) {
        SYS_READ => {
            let buf = cpu.registers.get(1);
            let len = cpu.registers.get(2);
            let dst = cpu.memory.region_mut(buf, len)?;
            // Host stdin regardless of the descriptor in x0
            let count = io::stdin().read(dst).unwrap_or(0);
            // Terminate the input where space allows
            let end = buf.wrapping_add(count as u64);
            if cpu.memory.contains(end, 1) {
                cpu.memory.write(end, 0, Wordsize::Byte)?;
            }
            cpu.registers.set(0, count as u64);
        }
        SYS_WRITE => {
            let fd = cpu.registers.get(0);
            let buf = cpu.registers.get(1);
            let len = cpu.registers.get(2);
            let data = cpu.memory.region(buf, len)?.to_vec();
            match fd {
                1 => {
                    for byte in data {
                        cpu.console_push(byte);
                    }
                }
                2 => eprint!("{}", String::from_utf8_lossy(&data)),
                _ => eprintln!("write to unsupported file descriptor {fd}"),
            }
        }
        SYS_EXIT => cpu.halt(),
        other => eprintln!("unknown supervisor call 0x{other:x}"),
    }
    Ok(())
}
