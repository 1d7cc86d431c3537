use std::path::PathBuf;

use clap::{ArgGroup, Parser};

/// Hypervisor-assisted generic unpacker.
///
/// Attaches to a process inside a running virtual machine and dumps its
/// address space every time it executes memory it previously wrote.
#[derive(Debug, Parser)]
#[command(name = "hvunpack", version)]
#[command(group = ArgGroup::new("target").required(true).multiple(false))]
pub struct Cli {
    /// Name of the virtual machine to attach to.
    #[arg(long)]
    pub vm: String,

    /// Path to the kernel-structure profile (JSON).
    #[arg(long)]
    pub profile: PathBuf,

    /// Directory dump artifacts are written to.
    #[arg(short, long)]
    pub output: PathBuf,

    /// PID of the process to monitor.
    #[arg(long, group = "target")]
    pub pid: Option<u32>,

    /// Image name of the process to monitor.
    #[arg(long = "name", group = "target")]
    pub process_name: Option<String>,

    /// Enlist child processes as they are created.
    #[arg(long)]
    pub follow_children: bool,

    /// Also instrument file-backed library mappings.
    #[arg(long)]
    pub include_libraries: bool,

    /// Also instrument private heap memory.
    #[arg(long)]
    pub include_heap: bool,

    /// Also instrument stack and guard regions.
    #[arg(long)]
    pub include_stack: bool,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,
}
