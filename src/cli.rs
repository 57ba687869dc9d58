use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::InspectionSpan;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanArg {
    Full,
    Half,
}

impl From<SpanArg> for InspectionSpan {
    fn from(value: SpanArg) -> Self {
        match value {
            SpanArg::Full => InspectionSpan::Full,
            SpanArg::Half => InspectionSpan::Half,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    /// Block device or raw image to scan
    #[arg(short, long)]
    pub device: PathBuf,

    /// Known copy of the file to recover
    #[arg(short, long)]
    pub source: PathBuf,

    /// Output directory for the rebuilt file and the event log
    #[arg(short, long, default_value = "./output")]
    pub output: PathBuf,

    /// Byte offset where the skim starts (decimal or 0x-prefixed hex)
    #[arg(long, default_value = "0", value_parser = parse_offset)]
    pub start_offset: u64,

    /// Number of match worker threads
    #[arg(long, default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Optional path to config file (YAML)
    #[arg(long)]
    pub config_path: Option<PathBuf>,

    /// Close-inspection reach (overrides config when set)
    #[arg(long, value_enum)]
    pub inspection_span: Option<SpanArg>,

    /// Stop at the end of the device instead of wrapping to offset zero
    #[arg(long)]
    pub no_wrap_around: bool,

    /// Start a follow-up inspection when one ends while still matching
    #[arg(long)]
    pub chain_inspections: bool,

    /// Write job events as JSON lines to this file
    #[arg(long)]
    pub event_log: Option<PathBuf>,
}

/// Parse a byte offset given as decimal or `0x` hex.
pub fn parse_offset(value: &str) -> Result<u64, String> {
    let trimmed = value.trim().replace('_', "");
    let parsed = match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => trimmed.parse::<u64>(),
    };
    parsed.map_err(|err| format!("invalid offset '{value}': {err}"))
}

pub fn parse() -> CliOptions {
    CliOptions::parse()
}
