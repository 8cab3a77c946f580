use std::{
    fs, io,
    path::{Path, PathBuf},
    process::ExitCode,
};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum, command};
use pasm::{Assembler, AssemblyResult, InstructionSet, Policy, Severity};
use tracing::Level;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// One of `TRACE`, `DEBUG`, `INFO`, `WARN`, or `ERROR`
    #[arg(short, long, global = true, default_value_t = Level::WARN)]
    log_level: Level,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Assemble a `.s` file")]
    Assemble {
        /// `.s` file to assemble
        file: PathBuf,

        /// Where to write the image; without it a hex dump is printed
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Instruction set description (JSON); defaults to the bundled demo machine
        #[arg(long)]
        isa: Option<PathBuf>,

        /// Lowest severity to print: `info`, `warning`, `error` or `fatal`
        #[arg(long, default_value = "warning")]
        threshold: Severity,

        #[arg(long)]
        warnings_as_errors: bool,

        /// Treat values that do not fit their field as fatal
        #[arg(long)]
        fatal_range_errors: bool,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },
    #[command(about = "Validate an instruction set description")]
    CheckIsa {
        /// JSON instruction set description
        file: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Text,
    Json,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(io::stderr)
        .init();

    match run(cli.command) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether the command succeeded.
fn run(command: Command) -> anyhow::Result<bool> {
    match command {
        Command::Assemble {
            file,
            output,
            isa,
            threshold,
            warnings_as_errors,
            fatal_range_errors,
            format,
        } => {
            let isa = match isa {
                Some(path) => load_isa(&path)?,
                None => InstructionSet::demo()?,
            };
            let assembler = Assembler::new(isa)?.with_policy(Policy {
                warnings_as_errors,
                fatal_range_errors,
            });
            let source = fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let result = assembler.assemble(&file.display().to_string(), &source, threshold);

            match format {
                Format::Text => {
                    for diagnostic in &result.diagnostics {
                        eprintln!("{diagnostic}");
                    }
                }
                Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
            }

            if result.succeeded() {
                match output {
                    Some(path) => fs::write(&path, &result.bytes)
                        .with_context(|| format!("cannot write {}", path.display()))?,
                    None if matches!(format, Format::Text) => print_hex(&result),
                    None => {}
                }
            }
            tracing::info!(
                "{} error(s), {} warning(s)",
                result.errors,
                result.warnings
            );
            Ok(result.succeeded())
        }
        Command::CheckIsa { file } => {
            let isa = load_isa(&file)?;
            println!(
                "{}: {} mnemonics, {} registers, {} directives",
                isa.name,
                isa.instructions.len(),
                isa.registers.len(),
                isa.directives.len()
            );
            Ok(true)
        }
    }
}

fn load_isa(path: &Path) -> anyhow::Result<InstructionSet> {
    let text =
        fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    InstructionSet::from_json(&text).with_context(|| format!("in {}", path.display()))
}

fn print_hex(result: &AssemblyResult) {
    for (row, chunk) in result.bytes.chunks(16).enumerate() {
        let address = result.base + row as u64 * 16;
        let bytes = chunk
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect::<Vec<_>>()
            .join(" ");
        println!("{address:08x}: {bytes}");
    }
}
