use std::num::ParseIntError;
use std::path::PathBuf;

use vestigo_capstone::Arch;

/// The Vestigo tracer.
#[derive(clap::Parser)]
pub struct CliOpts {
    /// The command to run.
    #[clap(subcommand)]
    pub action: CliAction,
}

/// The command to run.
#[derive(clap::Subcommand)]
pub enum CliAction {
    /// Command to replay a raw code image and trace its execution.
    Replay {
        /// Tracing configuration (KDL format).
        ///
        /// If it ends with `.kdl`, it is treated as a path to a configuration
        /// file for the tracing operation. Otherwise it is directly parsed as
        /// inline KDL-formatted configuration.
        #[clap(short, long, value_name = "CONTENT/PATH", default_value = "")]
        config: String,

        /// CPU architecture of the code image.
        #[clap(short, long, value_enum, default_value_t = CliArch::X86_64)]
        arch: CliArch,

        /// Address at which the code image is mapped.
        #[clap(short, long, value_name = "ADDR", value_parser = parse_address)]
        base: u64,

        /// Address at which tracing starts (defaults to the base address).
        #[clap(short, long, value_name = "ADDR", value_parser = parse_address)]
        entry: Option<u64>,

        /// Path to the raw code image.
        image: PathBuf,
    },
}

/// CPU architecture of a code image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum CliArch {
    /// IA-32.
    #[value(name = "x86")]
    X86,

    /// x86-64.
    #[value(name = "x86-64")]
    X86_64,

    /// AArch64.
    #[value(name = "aarch64")]
    Aarch64,
}

impl From<CliArch> for Arch {
    fn from(arch: CliArch) -> Self {
        match arch {
            CliArch::X86 => Self::X86,
            CliArch::X86_64 => Self::X86_64,
            CliArch::Aarch64 => Self::Aarch64,
        }
    }
}

impl CliOpts {
    /// Parses the CLI from the command-line.
    ///
    /// # Warning
    ///
    /// Exits on error.
    pub fn parse_from_cmdline() -> Self {
        <Self as clap::Parser>::parse()
    }
}

/// Parses an address, in hexadecimal (with or without `0x`).
fn parse_address(s: &str) -> Result<u64, ParseIntError> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    u64::from_str_radix(digits, 16)
}
