pub mod control;
pub mod detect;
pub mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use kiln_core::{resolve, Config, ConfigOverrides};

/// Project selection shared by every command.
#[derive(Args, Debug, Clone)]
pub struct ProjectArgs {
    /// Project root; relative paths resolve against the current directory.
    #[arg(short = 'm', long = "main-dir", value_name = "DIR", default_value = ".")]
    pub main_dir: PathBuf,

    /// Config file to read instead of `<DIR>/kiln.yaml`; relative to `DIR`.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl ProjectArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            config_file: self.config.clone(),
            ..ConfigOverrides::new(&self.main_dir)
        }
    }
}

/// Resolve `overrides` against the current directory.
pub fn resolve_config(overrides: ConfigOverrides) -> Result<Config> {
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    resolve(overrides, &cwd).context("failed to resolve kiln configuration")
}
