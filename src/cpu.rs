//! AArch64 user-mode processor core
//!
//! The core owns the architectural state (general registers, APSR
//! flags, program counter, stack pointer) and the simulated memory
//! image, and advances by whole instructions: one step() fetches the
//! word at the program counter, classifies it, applies its effect,
//! and commits the next program counter. The front-end drives the
//! core by calling step() and may inspect any state between steps.

use std::fmt;
use std::io::{self, Write};

use queues::{IsQueue, Queue};
use thiserror::Error;

use crate::instr::decode::Decoder;
use crate::instr::exec::execute;
use crate::memory::{MemoryError, MemoryImage, Wordsize};

use self::registers::RegisterFile;

pub mod registers;

/// Collected status flags (N, Z, C, V), set by the flag-setting
/// subtract forms and tested by the conditional branches.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Apsr {
    pub negative: bool,
    pub zero: bool,
    pub carry: bool,
    pub overflow: bool,
}

impl fmt::Display for Apsr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "negative:{} zero:{} carry:{} overflow:{}",
            u8::from(self.negative),
            u8::from(self.zero),
            u8::from(self.carry),
            u8::from(self.overflow)
        )
    }
}

/// Driver-level execution state. Idle becomes Running on the first
/// step; Halted is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Running,
    Halted,
}

#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("no decoding rule matches instruction 0x{0:08x}")]
    UnknownInstruction(u32),
    #[error("unimplemented {0}")]
    UnimplementedVariant(&'static str),
    #[error("malformed logical immediate (reserved encoding)")]
    MalformedImmediate,
    #[error(transparent)]
    OutOfRangeMemory(#[from] MemoryError),
    #[error("unsupported operand size field {0:#b}")]
    BadSize(u32),
}

impl ExecutionError {
    /// Out-of-range accesses halt the core; everything else is
    /// reported and execution continues.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ExecutionError::OutOfRangeMemory(_))
    }
}

/// The simulated processor
///
/// Built over a loaded memory image; the program counter starts at
/// the image entry point and the stack pointer at the top of the
/// image buffer.
pub struct Cpu {
    pub registers: RegisterFile,
    pub apsr: Apsr,
    pub pc: u64,
    pub sp: u64,
    pub memory: MemoryImage,
    next_pc: u64,
    state: State,
    trace: bool,
    decoder: Decoder,
    console: Queue<char>,
}

impl Cpu {
    pub fn new(image: MemoryImage) -> Self {
        let pc = image.entry;
        let sp = image.program_start + image.nbytes();
        Self {
            registers: RegisterFile::new(),
            apsr: Apsr::default(),
            pc,
            sp,
            memory: image,
            next_pc: pc,
            state: State::Idle,
            trace: false,
            decoder: Decoder::new(),
            console: Queue::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn running(&self) -> bool {
        self.state != State::Halted
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    /// Stop execution; any later step() is a no-op
    pub fn halt(&mut self) {
        self.state = State::Halted;
    }

    /// Redirect the program counter for the cycle in progress. The
    /// target takes effect when the step commits.
    pub fn branch_to(&mut self, target: u64) {
        self.next_pc = target;
    }

    /// Queue a byte of simulated console output
    pub fn console_push(&mut self, byte: u8) {
        self.console
            .add(byte as char)
            .expect("insert into queue should work");
    }

    /// Return the buffered console output and empty the buffer
    pub fn flush_console(&mut self) -> String {
        let mut out = String::new();
        while let Ok(ch) = self.console.remove() {
            out.push(ch);
        }
        out
    }

    /// One fetch-decode-execute cycle
    ///
    /// Fetches the word at the program counter, decodes and executes
    /// it, and commits the next program counter. A program counter
    /// outside the memory image halts the core; a fatal execution
    /// error halts the core and is returned; any other execution
    /// error is reported and the cycle still commits.
    pub fn step(&mut self) -> Result<(), ExecutionError> {
        match self.state {
            State::Halted => return Ok(()),
            State::Idle => self.state = State::Running,
            State::Running => (),
        }

        if !self.memory.contains(self.pc, 4) {
            eprintln!("program counter 0x{:x} left the memory image", self.pc);
            self.halt();
            return Ok(());
        }

        let word = self.memory.read(self.pc, Wordsize::Word)? as u32;
        let ir = self.decoder.decode(word);

        if self.trace {
            println!("pc=0x{:x}: fetched 0x{word:08x}, decoded {:?}", self.pc, ir.op);
        }

        // Default to the next instruction; the executed instruction
        // may redirect
        self.next_pc = self.pc + 4;

        match execute(self, &ir) {
            Ok(()) => (),
            Err(e) if e.is_fatal() => {
                eprintln!("{e} at pc=0x{:x}", self.pc);
                self.halt();
                return Err(e);
            }
            Err(e) => eprintln!("{e} at pc=0x{:x}", self.pc),
        }

        self.pc = self.next_pc;

        if self.trace {
            print!("{}", self.registers);
            println!("{}", self.apsr);
        }
        Ok(())
    }

    /// Step until the core halts, draining the console buffer to the
    /// host at each cycle boundary
    pub fn run(&mut self) -> Result<(), ExecutionError> {
        while self.running() {
            self.step()?;
            let out = self.flush_console();
            if !out.is_empty() {
                print!("{out}");
                io::stdout().flush().ok();
            }
        }
        Ok(())
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.registers)?;
        writeln!(f, "  {}", self.apsr)?;
        writeln!(
            f,
            "  program counter:0x{:08x}  stack pointer:0x{:08x}",
            self.pc, self.sp
        )
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::encode::*;

    /// A bare core over a small zeroed image starting at a typical
    /// text base address
    fn bare_cpu(nbytes: u64) -> Cpu {
        let image = MemoryImage::new(0x40_0000, 0x40_0000, nbytes);
        Cpu::new(image)
    }

    fn load_program(cpu: &mut Cpu, words: &[u32]) {
        for (n, word) in words.iter().enumerate() {
            cpu.memory
                .write(cpu.memory.entry + 4 * n as u64, (*word).into(), Wordsize::Word)
                .unwrap();
        }
    }

    #[test]
    fn check_initial_state() {
        let cpu = bare_cpu(64);
        assert_eq!(cpu.state(), State::Idle);
        assert_eq!(cpu.pc, 0x40_0000);
        assert_eq!(cpu.sp, 0x40_0040);
        assert!(cpu.running());
    }

    #[test]
    fn check_movz_single_cycle() {
        // A one-instruction image: movz x0, #42
        let mut cpu = bare_cpu(64);
        load_program(&mut cpu, &[0xd280_0540]);
        cpu.step().unwrap();
        assert_eq!(cpu.registers.get(0), 42);
        for n in 1..31 {
            assert_eq!(cpu.registers.get(n), 0);
        }
        assert_eq!(cpu.pc, 0x40_0004);
        assert_eq!(cpu.state(), State::Running);
    }

    #[test]
    fn check_pc_leaving_image_halts() {
        let mut cpu = bare_cpu(4);
        load_program(&mut cpu, &[nop()]);
        cpu.step().unwrap();
        assert!(cpu.running());
        // The next fetch would fall outside the 4-byte image
        cpu.step().unwrap();
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn check_exit_syscall_halts_and_step_becomes_noop() {
        let mut cpu = bare_cpu(64);
        load_program(&mut cpu, &[movz(true, 8, 0x5d, 0), svc(0)]);
        cpu.step().unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        assert!(!cpu.running());
        let pc = cpu.pc;
        cpu.step().unwrap();
        assert_eq!(cpu.pc, pc);
        assert_eq!(cpu.state(), State::Halted);
    }

    #[test]
    fn check_unknown_instruction_is_not_fatal() {
        let mut cpu = bare_cpu(64);
        load_program(&mut cpu, &[0, nop()]);
        cpu.step().unwrap();
        assert!(cpu.running());
        assert_eq!(cpu.pc, 0x40_0004);
    }

    #[test]
    fn check_zero_register_reads_zero_every_cycle() {
        // Writes aimed at x31 in a non-sp form are discarded
        let mut cpu = bare_cpu(64);
        load_program(
            &mut cpu,
            &[movz(true, 0, 7, 0), add_reg(true, 31, 0, 0), add_reg(true, 1, 31, 31)],
        );
        for _ in 0..3 {
            cpu.step().unwrap();
            assert_eq!(cpu.registers.get(31), 0);
        }
        assert_eq!(cpu.registers.get(1), 0);
    }

    #[test]
    fn check_pc_stays_aligned_while_running() {
        let mut cpu = bare_cpu(64);
        load_program(&mut cpu, &[b(8), nop(), nop(), bl(-4)]);
        for _ in 0..4 {
            cpu.step().unwrap();
            assert_eq!(cpu.pc % 4, 0);
        }
    }

    #[test]
    fn check_run_to_exit() {
        let mut cpu = bare_cpu(64);
        load_program(
            &mut cpu,
            &[
                movz(true, 0, 1, 0),
                movz(true, 8, 0x5d, 0),
                svc(0),
            ],
        );
        cpu.run().unwrap();
        assert_eq!(cpu.state(), State::Halted);
        assert_eq!(cpu.registers.get(0), 1);
    }
}
