use std::{
    fs::File,
    io::{self, Write},
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    process::ExitCode,
    time::Instant,
};

use clap::{Parser, ValueEnum};
use colored::Colorize;

use tapeflow::{
    backend::{compiler, interp::Interpreter},
    frontend::{compile, Config, Program, DEFAULT_TAPE_SIZE, MAX_TAPE_SIZE},
};

/// Compiles tape-language programs to LLVM IR or x86-64 ELF executables
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The source file to compile
    file: PathBuf,

    /// What to produce
    #[arg(short, long, value_enum, default_value_t = Emit::Llvm)]
    emit: Emit,

    /// Output path (stdout when omitted, `a.out` for ELF)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of cells on the tape
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_TAPE_SIZE,
        value_parser = clap::value_parser!(u64).range(1..=MAX_TAPE_SIZE)
    )]
    tape_size: u64,

    /// Interpret the program instead of emitting anything
    #[arg(short, long)]
    run: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Emit {
    /// Textual LLVM IR
    Llvm,
    /// Static x86-64 Linux executable
    Elf,
    /// Block labels and their successors
    Blocks,
}

fn fail(message: impl std::fmt::Display) -> ExitCode {
    eprintln!("{}: {message}", "error".red().bold());
    ExitCode::FAILURE
}

fn write_output(path: Option<&PathBuf>, bytes: &[u8]) -> io::Result<()> {
    match path {
        Some(path) => File::create(path)?.write_all(bytes),
        None => io::stdout().write_all(bytes),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let source = match std::fs::read(&args.file) {
        Ok(source) => source,
        Err(e) => return fail(format!("cannot read {}: {e}", args.file.display())),
    };

    let program = Program::from(&source[..]);
    let config = Config {
        tape_size: args.tape_size,
    };

    eprintln!("{} {}", "Compiling".blue(), args.file.display());
    let now = Instant::now();
    let module = match compile(&program, &config) {
        Ok(module) => module,
        Err(e) => return fail(e),
    };
    eprintln!(
        "{} {} commands in {:.2?}",
        "Translated".green(),
        program.len(),
        now.elapsed()
    );

    if args.run {
        let stdin = io::stdin();
        let stdout = io::stdout();
        return match Interpreter::new(&module).run(&mut stdin.lock(), &mut stdout.lock()) {
            Ok(outcome) => ExitCode::from(outcome.status as u8),
            Err(e) => fail(e),
        };
    }

    let written = match args.emit {
        Emit::Llvm => write_output(args.output.as_ref(), module.to_string().as_bytes()),
        Emit::Blocks => {
            let mut text = String::new();
            for block in &module.functions[0].blocks {
                let succ: Vec<_> = block
                    .terminator
                    .iter()
                    .flat_map(|t| t.successors())
                    .filter_map(|id| module.block(id))
                    .map(|b| b.label.as_str())
                    .collect();
                text.push_str(&format!("{} -> [{}]\n", block.label, succ.join(", ")));
            }
            write_output(args.output.as_ref(), text.as_bytes())
        }
        Emit::Elf => {
            let binary = match compiler::compile(&module) {
                Ok(binary) => binary,
                Err(e) => return fail(e),
            };
            let path = args.output.clone().unwrap_or_else(|| "a.out".into());
            write_output(Some(&path), &binary).and_then(|()| {
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            })
        }
    };

    match written {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(e),
    }
}
