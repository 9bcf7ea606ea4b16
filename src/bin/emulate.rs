use std::fs;
use std::io::{self, Write};
use std::process::ExitCode;

use clap::Parser;
use clap_num::maybe_hex;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use arm64emu::cpu::Cpu;
use arm64emu::elf_utils::load_elf;

/// Emulate a 64-bit ARM processor running a statically linked
/// Linux executable
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Args {
    /// Path to input executable file
    input: String,

    /// Run to completion instead of prompting between instructions
    #[arg(short, long)]
    batch: bool,

    /// Print a trace of every fetch-decode-execute cycle
    #[arg(short, long)]
    trace: bool,

    /// Print the loaded memory image before execution
    #[arg(short, long)]
    print_memory: bool,

    /// Dump memory to memory-begin.dump and memory-end.dump around
    /// the run
    #[arg(short, long)]
    memory_dump: bool,

    /// In batch mode, drop to the interactive stepper when the
    /// program counter reaches this address (use 0x prefix for
    /// hexadecimal)
    #[arg(short = 'c', long, value_parser = maybe_hex::<u64>)]
    pc_breakpoint: Option<u64>,
}

fn flush_console(cpu: &mut Cpu) {
    let out = cpu.flush_console();
    if !out.is_empty() {
        print!("{out}");
        io::stdout().flush().ok();
    }
}

fn step_once(cpu: &mut Cpu) {
    if let Err(e) = cpu.step() {
        eprintln!("execution failed: {e}");
    }
    flush_console(cpu);
}

fn batch_loop(cpu: &mut Cpu, pc_breakpoint: Option<u64>) {
    while cpu.running() {
        if let Some(breakpoint) = pc_breakpoint {
            if cpu.pc == breakpoint {
                println!("breakpoint at pc=0x{breakpoint:x}");
                interactive_loop(cpu);
                return;
            }
        }
        step_once(cpu);
    }
}

const HELP: &str = "\
h - help (this output)
s or <Enter> - step through the next instruction
S - step through the next instruction and show the state
i - show the register state
p - print the program memory
v - toggle the per-cycle trace
r - run the rest of the program without prompting
q - quit";

fn interactive_loop(cpu: &mut Cpu) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("could not start line editor: {e}");
            return;
        }
    };
    while cpu.running() {
        let line = match editor.readline(&format!("pc=0x{:08x}> ", cpu.pc)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return,
            Err(e) => {
                eprintln!("input error: {e}");
                return;
            }
        };
        let _ = editor.add_history_entry(line.as_str());
        match line.trim() {
            "" | "s" => step_once(cpu),
            "S" => {
                step_once(cpu);
                print!("{cpu}");
            }
            "i" => print!("{cpu}"),
            "p" => print!("{}", cpu.memory),
            "v" => {
                let trace = !cpu.trace();
                cpu.set_trace(trace);
                println!("trace: {trace}");
            }
            "r" => {
                batch_loop(cpu, None);
                return;
            }
            "q" => {
                cpu.halt();
                return;
            }
            _ => println!("{HELP}"),
        }
    }
}

fn dump_memory(path: &str, cpu: &Cpu) {
    if let Err(e) = fs::write(path, cpu.memory.bytes()) {
        eprintln!("could not write {path}: {e}");
    }
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders its own usage or help text
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let image = match load_elf(&args.input) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("error loading {}: {e}", args.input);
            return ExitCode::from(1);
        }
    };
    println!(
        "loaded {}: entry=0x{:x} base=0x{:x} size=0x{:x}",
        args.input,
        image.entry,
        image.program_start,
        image.nbytes()
    );

    let mut cpu = Cpu::new(image);
    cpu.set_trace(args.trace);

    if args.print_memory {
        print!("{}", cpu.memory);
    }
    if args.memory_dump {
        dump_memory("memory-begin.dump", &cpu);
    }

    if args.batch {
        batch_loop(&mut cpu, args.pc_breakpoint);
    } else {
        interactive_loop(&mut cpu);
    }

    if args.memory_dump {
        dump_memory("memory-end.dump", &cpu);
    }
    ExitCode::SUCCESS
}
