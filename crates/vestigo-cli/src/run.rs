use std::path::PathBuf;
use std::sync::Arc;

use miette::IntoDiagnostic;
use vestigo_capstone::{Arch, CapstoneDecoder};
use vestigo_tracer::engine::{Console, Register, RegisterSnapshot};
use vestigo_tracer::format::PrintOptions;
use vestigo_tracer::tracer::{AttachOptions, AttachStatus, TraceSession};

use crate::handler::PrintingHandler;
use crate::replay::{ImageProcess, ReplayEngine, ReplayOutcome};
use crate::{RegisterValue, parse_replay_config};

/// Runs the subcommand for replaying a code image.
///
/// Every traced instruction is written to `console`.
pub fn evaluate_replay(
    config: &str,
    arch: Arch,
    base: u64,
    entry: Option<u64>,
    image: PathBuf,
    console: Arc<dyn Console>,
) -> miette::Result<ReplayOutcome> {
    let config = parse_replay_config(config)?;
    let entry = entry.unwrap_or(base);

    let code = std::fs::read(&image).into_diagnostic()?;

    let pointer_width = match arch {
        Arch::X86 => 4,
        Arch::X86_64 | Arch::Aarch64 => 8,
    };

    let process = Arc::new(ImageProcess::new(image, base, code, pointer_width));

    tracing::info!(
        image = %process.module().path.display(),
        base = format_args!("{base:#x}"),
        "image mapped"
    );

    let decoder = CapstoneDecoder::new(arch);
    let engine = ReplayEngine::new(Arc::clone(&process), decoder);

    let regs = initial_registers(&config.registers, entry)?;

    let session = TraceSession::builder()
        .with_engine(engine.clone())
        .with_process(process)
        .with_decoder(decoder)
        .with_console(console)
        .build();

    let options = PrintOptions::default()
        .colored(config.colored)
        .details(config.details);

    let attach_options = AttachOptions {
        instruction_limit: config.count,
        module_exclusions: config
            .exclusions
            .into_iter()
            .map(|exclusion| exclusion.pattern)
            .collect(),
    };

    let status = session
        .attach(
            entry,
            PrintingHandler::new(options, config.annotate),
            attach_options,
        )
        .into_diagnostic()?;

    if status != AttachStatus::Started {
        miette::bail!("failed to arm the trace at {entry:#x}");
    }

    let outcome = engine
        .replay(entry, &regs, config.max_steps)
        .into_diagnostic()?;

    session.detach();

    tracing::info!(steps = outcome.steps, stop = ?outcome.stop, "replay done");

    Ok(outcome)
}

fn initial_registers(values: &[RegisterValue], pc: u64) -> miette::Result<RegisterSnapshot> {
    let mut regs = RegisterSnapshot::new(pc);

    for value in values {
        let Some(reg) = Register::from_name(&value.name) else {
            miette::bail!("unknown register: {}", value.name);
        };

        regs.set(reg, value.value);
    }

    Ok(regs)
}
