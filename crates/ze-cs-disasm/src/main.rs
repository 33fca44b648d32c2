#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use ze_cmdqueue::DriverConfig;
use ze_cs_disasm::{disassemble, run_demo};
use ze_gpu_cmd::CapsRegistry;

#[derive(Parser, Debug)]
#[command(
    name = "ze-cs-disasm",
    about = "Disassemble GPU command streams, or build one from a demo submission."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every packet in a raw command stream file
    Disasm {
        /// Little-endian packet stream
        file: PathBuf,
    },
    /// Submit a ThreadGroup list then a MidThread list and print the queue's batch
    Demo {
        /// Device generation (see `gens`)
        #[arg(long = "gen", value_name = "NAME", default_value = "gen12lp")]
        generation: String,

        /// Driver config JSON
        #[arg(long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Also write the raw batch bytes to this path
        #[arg(long, value_name = "PATH")]
        out: Option<PathBuf>,
    },
    /// List known device generations
    Gens,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    run(Args::parse())
}

fn run(args: Args) -> anyhow::Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let registry = CapsRegistry::with_builtin();

    match args.command {
        Command::Disasm { file } => {
            let bytes = fs::read(&file).with_context(|| format!("read {}", file.display()))?;
            let count = disassemble(&bytes, &mut out)?;
            tracing::debug!(packets = count, bytes = bytes.len(), "disassembled");
        }
        Command::Demo {
            generation,
            config,
            out: out_path,
        } => {
            let caps = registry
                .get(&generation)
                .cloned()
                .ok_or_else(|| anyhow!("unknown device generation {generation:?}"))?;
            let config = match config {
                Some(path) => {
                    let json = fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?;
                    DriverConfig::from_json(&json)
                        .with_context(|| format!("parse {}", path.display()))?
                }
                None => DriverConfig::default(),
            };

            let batch = run_demo(caps, config)?;
            disassemble(&batch, &mut out)?;
            if let Some(path) = out_path {
                fs::write(&path, &batch).with_context(|| format!("write {}", path.display()))?;
            }
        }
        Command::Gens => {
            for name in registry.names() {
                writeln!(out, "{name}")?;
            }
        }
    }
    Ok(())
}
