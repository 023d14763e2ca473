//! Crate implementing the CLI commands.

mod cli;
mod config;
mod handler;
pub mod replay;
mod run;

pub use self::cli::{CliAction, CliArch, CliOpts};
pub use self::config::{ModuleExclusion, RegisterValue, ReplayConfig, parse_replay_config};
pub use self::handler::{PrintingHandler, WriterConsole};
pub use self::run::evaluate_replay;
