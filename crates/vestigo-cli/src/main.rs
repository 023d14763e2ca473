#![allow(missing_docs)]
#![allow(clippy::print_stderr)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use vestigo_cli::{CliAction, CliOpts, WriterConsole};

fn main() {
    let cli = CliOpts::parse_from_cmdline();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("VESTIGO_LOG")
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let res = match cli.action {
        CliAction::Replay {
            config,
            arch,
            base,
            entry,
            image,
        } => {
            let console = Arc::new(WriterConsole::new(std::io::stdout()));
            vestigo_cli::evaluate_replay(&config, arch.into(), base, entry, image, console)
        }
    };

    if let Err(e) = res {
        eprintln!("{e:?}");
        std::process::exit(1);
    }
}
