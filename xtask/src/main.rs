use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(name = "xtask", about = "Workspace build tasks for the whatif profiler")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Parser)]
enum Cmd {
    /// Cross-compile the sched_switch probe to eBPF bytecode.
    ///
    /// The runtime loads the bytecode at startup from
    /// `target/<target>/release/whatif` (overridable with WHATIF_PROBE or
    /// the `probe=` option), so this must run before profiling with
    /// off-CPU collection enabled.
    BuildEbpf {
        #[arg(long, default_value = "bpfel-unknown-none")]
        target: String,
        /// Copy the bytecode to this path after building.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Cmd::BuildEbpf { target, out } => build_ebpf(&target, out.as_deref()),
    }
}

fn build_ebpf(target: &str, out: Option<&Path>) -> Result<()> {
    // The probe only builds in release: debug builds pull in formatting
    // code the BPF linker rejects, and unoptimized map accesses can blow
    // the verifier's instruction budget.
    let status = Command::new("cargo")
        .args([
            "+nightly",
            "build",
            "--package",
            "whatif-ebpf",
            "--target",
            target,
            "-Z",
            "build-std=core",
            "--release",
        ])
        .status()
        .context("Failed to run cargo for the probe build")?;

    if !status.success() {
        bail!("Failed to build the sched_switch probe");
    }

    let artifact = PathBuf::from(format!("target/{target}/release/whatif"));
    let loaded_from = match out {
        Some(out) => {
            std::fs::copy(&artifact, out).with_context(|| {
                format!("Failed to copy {} to {}", artifact.display(), out.display())
            })?;
            out.to_path_buf()
        }
        None => artifact,
    };

    println!("✓ sched_switch probe built");
    println!("  Bytecode: {}", loaded_from.display());
    println!("  The runtime loads this path by default; override with WHATIF_PROBE");

    Ok(())
}
