use anyhow::bail;
use clap::{Parser, Subcommand};
use opal::backend::x86::regs::{Target, TargetOs};
use opal::driver::Driver;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "opalc", about = "The Opal compiler", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile source files into a single executable.
    Build {
        /// Source files (.opal).
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Optimization level (0-2).
        #[arg(short = 'O', default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=2))]
        opt_level: u32,
        /// Output path; defaults to `app` or `app.exe` per target.
        #[arg(short = 'o')]
        output: Option<PathBuf>,
        /// Target triple: x86_64-linux or x86_64-windows.
        #[arg(long, default_value = "x86_64-linux")]
        target: String,
        /// Print the optimized IR before code generation.
        #[arg(long)]
        emit_ir: bool,
    },
}

fn parse_target(name: &str) -> anyhow::Result<Target> {
    match name {
        "x86_64-linux" => Ok(Target::new(TargetOs::Linux)),
        "x86_64-windows" => Ok(Target::new(TargetOs::Windows)),
        _ => bail!("unsupported target `{}` (expected x86_64-linux or x86_64-windows)", name),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Build { files, opt_level, output, target, emit_ir } => {
            parse_target(&target).and_then(|target| {
                let mut driver = Driver::new();
                driver.input_files = files;
                driver.opt_level = opt_level;
                driver.output_path = output;
                driver.target = target;
                driver.emit_ir = emit_ir;
                driver.run()
            })
        }
    };

    if let Err(error) = result {
        eprintln!("error: {:#}", error);
        std::process::exit(1);
    }
}
