//! `sbrtool`: convert Serial Boot Records to and from editable text.
//!
//! ```text
//! USAGE:
//!   sbrtool parse <sbr.bin> <sbr.cfg>    Decode a record into key = value lines
//!   sbrtool build <sbr.cfg> <sbr.bin>    Encode a record, checksums included
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lsi_chip::SbrImage;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sbrtool", about = "LSI Serial Boot Record converter", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Decode a binary SBR into a config file.
    Parse {
        /// 256-byte SBR image.
        input: PathBuf,
        /// Config file to write.
        output: PathBuf,
    },
    /// Encode a config file into a binary SBR.
    Build {
        /// Config file.
        input: PathBuf,
        /// SBR image to write.
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(usage_exit_code(&e));
        }
    };

    let result = match &cli.command {
        Cmd::Parse { input, output } => cmd_parse(input, output),
        Cmd::Build { input, output } => cmd_build(input, output),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Exit status for a parse error: 1 for usage errors, 0 for `--help`/`--version`.
fn usage_exit_code(e: &clap::Error) -> u8 {
    u8::from(e.use_stderr())
}

fn cmd_parse(input: &Path, output: &Path) -> Result<()> {
    let raw = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let (image, warnings) = SbrImage::parse(&raw)?;
    for w in &warnings {
        tracing::warn!("{w}");
    }
    fs::write(output, image.to_config())
        .with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}

fn cmd_build(input: &Path, output: &Path) -> Result<()> {
    let text = fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let image = SbrImage::from_config(&text).with_context(|| input.display().to_string())?;
    fs::write(output, image.build()).with_context(|| format!("writing {}", output.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsi_chip::SBR_SIZE;

    #[test]
    fn parse_then_build_reproduces_record() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("sbr.cfg");
        let bin = dir.path().join("sbr.bin");
        fs::write(
            &cfg,
            "PCIVID = 0x1000\nPCIPID = 0x0072\nSASAddr = 0x500605b001234567\n",
        )
        .unwrap();

        cmd_build(&cfg, &bin).unwrap();
        let first = fs::read(&bin).unwrap();
        assert_eq!(first.len(), SBR_SIZE);

        let cfg2 = dir.path().join("again.cfg");
        let bin2 = dir.path().join("again.bin");
        cmd_parse(&bin, &cfg2).unwrap();
        cmd_build(&cfg2, &bin2).unwrap();
        assert_eq!(fs::read(&bin2).unwrap(), first);
    }

    #[test]
    fn build_reports_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = dir.path().join("sbr.cfg");
        fs::write(&cfg, "Bogus = 1\n").unwrap();
        let err = cmd_build(&cfg, &dir.path().join("out.bin")).unwrap_err();
        assert!(format!("{err:#}").contains("Unknown key Bogus"));
    }

    #[test]
    fn usage_errors_exit_one_and_help_exits_zero() {
        let missing = Cli::try_parse_from(["sbrtool", "parse", "sbr.bin"]).unwrap_err();
        assert_eq!(usage_exit_code(&missing), 1);
        let unknown = Cli::try_parse_from(["sbrtool", "flash"]).unwrap_err();
        assert_eq!(usage_exit_code(&unknown), 1);
        let help = Cli::try_parse_from(["sbrtool", "--help"]).unwrap_err();
        assert_eq!(usage_exit_code(&help), 0);
    }

    #[test]
    fn parse_rejects_short_record() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("short.bin");
        fs::write(&bin, [0u8; 16]).unwrap();
        assert!(cmd_parse(&bin, &dir.path().join("out.cfg")).is_err());
    }
}
