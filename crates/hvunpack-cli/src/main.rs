mod backend;
mod cli;

use std::process::ExitCode;

use clap::Parser;
use hvunpack::{Target, UnpackConfig, Unpacker, classify::FilterPolicy, dump};
use hvunpack_core::{Pid, Vmi, profile::Profile};

use crate::cli::Cli;

fn main() -> ExitCode {
    let args = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            tracing::Level::DEBUG
        }
        else {
            tracing::Level::INFO
        })
        .with_target(false)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let profile = Profile::load(&args.profile)?;
    std::fs::create_dir_all(&args.output)?;

    let target = match (args.pid, args.process_name) {
        (Some(pid), None) => Target::Pid(Pid(pid)),
        (None, Some(name)) => Target::Name(name),
        // clap enforces exactly one.
        _ => unreachable!(),
    };

    let mut config = UnpackConfig::new(&args.output, target);
    config.follow_children = args.follow_children;
    config.filter = FilterPolicy {
        libraries: args.include_libraries,
        heap: args.include_heap,
        stack: args.include_stack,
    };

    let driver = backend::connect(&args.vm)?;
    let vmi = Vmi::new(driver);

    tracing::info!(vm = %args.vm, output = %args.output.display(), "attaching");

    let (dumps, writer) = dump::spawn_writer(&config.output_dir, config.queue_capacity);
    let mut unpacker = Unpacker::new(&vmi, &profile, config, dumps)?;

    let result = unpacker.run();

    // Dropping the session drops the queue producer; the writer drains
    // what is left and exits.
    drop(unpacker);
    writer.finish();

    result?;
    Ok(())
}
