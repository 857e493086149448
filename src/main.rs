//! # Ribosome - A Neovim Plugin Host
//!
//! Runs a plugin described by a manifest, talking to the editor over
//! stdin/stdout.
//!
//! ## Quick Start
//!
//! ```vim
//! " In the editor
//! let job = jobstart(['ribosome', '/path/to/plugin.toml'], {'rpc': v:true})
//! ```
//!
//! ```bash
//! # Log to a file while debugging
//! RIBOSOME_LOG_FILE=/tmp/ribosome.log RIBOSOME_FILE_LOG_FMT=json ribosome plugin.toml -vv
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use ribosome_core::RuntimeConfig;
use ribosome_host::{PluginManifest, start_plugin};

/// Ribosome - runs a Neovim plugin from a manifest
#[derive(Parser, Debug)]
#[command(name = "ribosome")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plugin manifest
    #[arg(value_name = "MANIFEST")]
    manifest: PathBuf,

    /// Runtime config file (default: <config dir>/ribosome/runtime.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Args {
    /// The runtime config with the verbosity flags applied.
    fn runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let mut config = match &self.config {
            Some(path) => RuntimeConfig::load_from(path)
                .map_err(|e| anyhow::anyhow!("cannot load {}: {}", path.display(), e))?,
            None => RuntimeConfig::load(),
        };
        match self.verbose {
            0 => {}
            1 => config.log.level = "debug".to_string(),
            _ => config.log.level = "trace".to_string(),
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    match run(args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ribosome: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<ExitCode> {
    let runtime_config = args.runtime_config()?;
    let manifest = PluginManifest::load(&args.manifest)
        .map_err(|e| anyhow::anyhow!("cannot load {}: {}", args.manifest.display(), e))?;
    let config = manifest.plugin_config();

    let runtime = tokio::runtime::Runtime::new()?;
    Ok(runtime.block_on(start_plugin(config, manifest.data, runtime_config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["ribosome", "plugin.toml"]);
        assert_eq!(args.manifest, PathBuf::from("plugin.toml"));
        assert!(args.config.is_none());
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_verbosity_raises_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, "[log]\nlevel = \"warn\"\n").unwrap();
        let config_arg = path.display().to_string();

        let quiet = Args::parse_from(["ribosome", "plugin.toml", "--config", &config_arg]);
        assert_eq!(quiet.runtime_config().unwrap().log.level, "warn");

        let loud = Args::parse_from(["ribosome", "plugin.toml", "--config", &config_arg, "-vv"]);
        assert_eq!(loud.runtime_config().unwrap().log.level, "trace");
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let args = Args::parse_from(["ribosome", "plugin.toml", "--config", "/nonexistent/runtime.toml"]);
        assert!(args.runtime_config().is_err());
    }
}
