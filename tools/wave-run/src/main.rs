//! wave-run: load a WebAssembly module and call one of its exports.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wave_jit::{Instance, WasmType, WasmValue, WaveConfig};

#[derive(Parser)]
#[command(name = "wave-run")]
#[command(author, version, about = "Run a WebAssembly module with the WAVE JIT", long_about = None)]
struct Cli {
    /// Module to load
    module: PathBuf,

    /// Export to call after the start function
    #[arg(short, long, default_value = "main")]
    invoke: String,

    /// Arguments, parsed as the export's parameter types
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,

    /// Executable arena size in MiB
    #[arg(long, default_value_t = 64)]
    arena_mib: usize,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn parse_arg(ty: WasmType, text: &str) -> Result<WasmValue> {
    let value = match ty {
        // Accept the unsigned spelling of 32- and 64-bit integers too.
        WasmType::I32 => match text.parse::<i32>() {
            Ok(v) => WasmValue::I32(v),
            Err(_) => WasmValue::I32(text.parse::<u32>()? as i32),
        },
        WasmType::I64 => match text.parse::<i64>() {
            Ok(v) => WasmValue::I64(v),
            Err(_) => WasmValue::I64(text.parse::<u64>()? as i64),
        },
        WasmType::F32 => WasmValue::F32(text.parse()?),
        WasmType::F64 => WasmValue::F64(text.parse()?),
    };
    Ok(value)
}

fn format_value(value: WasmValue) -> String {
    match value {
        WasmValue::I32(v) => v.to_string(),
        WasmValue::I64(v) => v.to_string(),
        WasmValue::F32(v) => v.to_string(),
        WasmValue::F64(v) => v.to_string(),
    }
}

fn run(cli: Cli) -> Result<()> {
    let bytes = fs::read(&cli.module)
        .with_context(|| format!("failed to read {}", cli.module.display()))?;

    let config = WaveConfig {
        arena_size: cli
            .arena_mib
            .checked_mul(1024 * 1024)
            .ok_or_else(|| anyhow!("arena of {} MiB is too large", cli.arena_mib))?,
        ..WaveConfig::default()
    };
    let instance = Instance::new(&bytes, config)
        .with_context(|| format!("failed to instantiate {}", cli.module.display()))?;
    tracing::debug!(module = %cli.module.display(), "instantiated");

    let signature = instance
        .module()
        .export(&cli.invoke)
        .and_then(|export| instance.module().signature(export.index))
        .ok_or_else(|| anyhow!("no exported function named {:?}", cli.invoke))?
        .clone();
    if signature.params.len() != cli.args.len() {
        bail!(
            "{} takes {} arguments {}, got {}",
            cli.invoke,
            signature.params.len(),
            signature,
            cli.args.len()
        );
    }
    let args = signature
        .params
        .iter()
        .zip(&cli.args)
        .enumerate()
        .map(|(i, (ty, text))| {
            parse_arg(*ty, text).with_context(|| format!("argument {} is not a valid {}", i, ty))
        })
        .collect::<Result<Vec<_>>>()?;

    let result = instance
        .invoke(&cli.invoke, &args)
        .with_context(|| format!("{} failed", cli.invoke))?;
    tracing::debug!(stats = ?instance.stats(), "finished");

    if let Some(value) = result {
        println!("{}", format_value(value));
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    run(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_by_type() {
        assert_eq!(parse_arg(WasmType::I32, "-5").unwrap(), WasmValue::I32(-5));
        assert_eq!(
            parse_arg(WasmType::I32, "4294967295").unwrap(),
            WasmValue::I32(-1)
        );
        assert_eq!(
            parse_arg(WasmType::I64, "18446744073709551615").unwrap(),
            WasmValue::I64(-1)
        );
        assert_eq!(parse_arg(WasmType::F64, "2.5").unwrap(), WasmValue::F64(2.5));
        assert!(parse_arg(WasmType::F32, "abc").is_err());
        assert!(parse_arg(WasmType::I32, "1.5").is_err());
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(WasmValue::I32(-3)), "-3");
        assert_eq!(format_value(WasmValue::F64(0.5)), "0.5");
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "wave-run",
            "prog.wasm",
            "--invoke",
            "add",
            "--arena-mib",
            "8",
            "3",
            "-4",
        ])
        .unwrap();
        assert_eq!(cli.invoke, "add");
        assert_eq!(cli.arena_mib, 8);
        assert_eq!(cli.args, vec!["3", "-4"]);
    }
}
