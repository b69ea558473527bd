//! sbl-flash - secondary-bootloader flashing over CAN
//!
//! ```bash
//! sbl-flash inspect app.vbf
//! sbl-flash derive-key --seed 1A2B3C --fixed-key 0102030405
//! sbl-flash --config flash.toml unlock
//! sbl-flash --config flash.toml flash --simulate
//! ```

mod commands;
mod link;
mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sbl_uds::FlashConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::output::{OutputContext, OutputFormat};

#[derive(Parser)]
#[command(name = "sbl-flash")]
#[command(author, version, about = "Secondary-bootloader flashing over CAN")]
#[command(propagate_version = true)]
struct Cli {
    /// Flash configuration file (TOML or YAML)
    #[arg(short, long, env = "SBL_FLASH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Minimal output (for scripting)
    #[arg(short, long)]
    quiet: bool,

    /// Verbose logging (RUST_LOG wins when set)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show a VBF file's header and blocks and verify its checksums
    Inspect {
        /// VBF file
        file: PathBuf,
    },

    /// Compute the legacy SecurityAccess key for a seed
    DeriveKey {
        /// 3-byte seed as hex (e.g. 1A2B3C)
        #[arg(long)]
        seed: String,

        /// 5-byte fixed key as hex
        #[arg(long)]
        fixed_key: String,
    },

    /// Unlock the ECU with the configured security profile
    Unlock {
        /// requestSeed level; defaults to the profile for the active session
        #[arg(short, long, value_parser = parse_level)]
        level: Option<u8>,

        /// Talk to an in-process simulated ECU instead of the CAN interface
        #[arg(long)]
        simulate: bool,
    },

    /// Download SBL, ESS and application files
    Flash {
        /// Directory of VBF files; overrides the configured sources
        #[arg(long)]
        vbf_dir: Option<PathBuf>,

        /// Talk to an in-process simulated ECU instead of the CAN interface
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("sbl_uds=debug,sbl_security=debug,sbl_transport=debug,sbl_vbf=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let ctx = OutputContext::new(cli.output, cli.no_color, cli.quiet);

    let result = match &cli.command {
        Commands::Inspect { file } => commands::inspect(file, &ctx),

        Commands::DeriveKey { seed, fixed_key } => commands::derive_key(seed, fixed_key, &ctx),

        Commands::Unlock { level, simulate } => {
            let config = load_config(cli.config.as_ref())?;
            commands::unlock(&config, *level, *simulate, &ctx).await
        }

        Commands::Flash { vbf_dir, simulate } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(dir) = vbf_dir {
                config.vbf.directory = Some(dir.clone());
            }
            commands::flash(&config, *simulate, &ctx).await
        }
    };

    if let Err(e) = &result {
        ctx.error(&format!("{:#}", e));
    }
    result
}

fn load_config(path: Option<&PathBuf>) -> Result<FlashConfig> {
    let path = path.context("--config (or SBL_FLASH_CONFIG) is required for this command")?;
    FlashConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

fn parse_level(text: &str) -> std::result::Result<u8, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    let level = if digits.len() != text.len() {
        u8::from_str_radix(digits, 16)
    } else {
        text.parse()
    }
    .map_err(|e| format!("invalid level '{}': {}", text, e))?;
    if level % 2 == 0 {
        return Err(format!("level 0x{:02X} is not a requestSeed level (must be odd)", level));
    }
    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("1"), Ok(1));
        assert_eq!(parse_level("0x05"), Ok(5));
        assert_eq!(parse_level("0x11"), Ok(0x11));
        assert!(parse_level("2").is_err());
        assert!(parse_level("zz").is_err());
    }

    #[test]
    fn test_flash_arguments() {
        let cli = Cli::try_parse_from([
            "sbl-flash",
            "--config",
            "flash.toml",
            "flash",
            "--simulate",
            "--vbf-dir",
            "images",
        ])
        .unwrap();
        match cli.command {
            Commands::Flash { vbf_dir, simulate } => {
                assert!(simulate);
                assert_eq!(vbf_dir, Some(PathBuf::from("images")));
            }
            _ => panic!("expected flash"),
        }
    }
}
