use std::ffi::OsStr;
use std::path::Path;

use miette::IntoDiagnostic;

/// Configuration of a replay.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ReplayConfig {
    /// Maximum number of traced instructions (unlimited if unset).
    #[knus(child, unwrap(argument))]
    pub count: Option<usize>,

    /// Modules whose instructions are not traced.
    #[knus(children(name = "exclude"))]
    pub exclusions: Vec<ModuleExclusion>,

    /// Whether to colorize the trace.
    #[knus(child)]
    pub colored: bool,

    /// Whether to print the registers referenced by each instruction.
    #[knus(child)]
    pub details: bool,

    /// Whether to annotate each line with its hit index.
    #[knus(child)]
    pub annotate: bool,

    /// Initial register values.
    #[knus(children(name = "register"))]
    pub registers: Vec<RegisterValue>,

    /// Maximum number of replayed instructions.
    #[knus(child, default = 10000, unwrap(argument))]
    pub max_steps: usize,
}

/// Module excluded from tracing.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct ModuleExclusion {
    /// Substring of the module name.
    #[knus(argument)]
    pub pattern: String,
}

/// Initial value of a register.
#[derive(Debug, PartialEq, knus::Decode)]
pub struct RegisterValue {
    /// Register name (e.g., `rdi`).
    #[knus(argument)]
    pub name: String,

    /// Register value.
    #[knus(argument)]
    pub value: u64,
}

/// Parses the replay configuration.
///
/// If `config` ends with `.kdl`, it is treated as a path to a configuration
/// file. Otherwise it is directly parsed as KDL.
pub fn parse_replay_config(config: &str) -> miette::Result<ReplayConfig> {
    let path = Path::new(config);

    let config = if let Some((filename, "kdl")) = path
        .file_name()
        .and_then(OsStr::to_str)
        .zip(path.extension().and_then(OsStr::to_str))
    {
        let content = std::fs::read_to_string(path).into_diagnostic()?;
        knus::parse(filename, &content)?
    } else {
        knus::parse("<content>", config)?
    };

    Ok(config)
}
