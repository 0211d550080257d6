//! `kiln run`: the default command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use kiln_core::{CacheWritePolicy, ConfigOverrides};
use kiln_runtime::{run_blocking, RunError};

use super::{resolve_config, ProjectArgs};

/// Environment variables set inside a hosted project container.
const HOST_MARKERS: &[&str] = &["PROJECT_DOMAIN", "PROJECT_REMIX_CHAIN"];

/// The first host marker present and non-empty according to `lookup`.
fn hosted_marker(lookup: impl Fn(&str) -> Option<String>) -> Option<&'static str> {
    HOST_MARKERS
        .iter()
        .copied()
        .find(|name| lookup(name).is_some_and(|value| !value.is_empty()))
}

/// Arguments for `kiln run`.
#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Output directory to serve; overrides framework conventions.
    #[arg(short = 'o', long = "build-dir", value_name = "DIR")]
    pub build_dir: Option<PathBuf>,

    /// Build command; overrides the detected package script.
    #[arg(short = 'b', long = "build-cmd", value_name = "CMD")]
    pub build_cmd: Option<String>,

    /// Serve command; without one the built-in static server is used.
    #[arg(short = 's', long = "serve-cmd", value_name = "CMD")]
    pub serve_cmd: Option<String>,

    /// Decide cache validity by build age only, ignoring git commits.
    #[arg(long)]
    pub no_git: bool,

    /// Name of the cache record file in the project root.
    #[arg(long, value_name = "NAME")]
    pub cache_file_name: Option<String>,

    /// How long a build stays fresh when git is not consulted.
    #[arg(long = "cache-duration", value_name = "SECS")]
    pub cache_duration_secs: Option<u64>,

    /// Port for the built-in static server.
    #[arg(short = 'p', long = "port", env = "PORT", value_name = "PORT")]
    pub port: Option<u16>,

    /// Keep an existing cache record instead of replacing it.
    #[arg(long)]
    pub fail_if_cached_record: bool,

    /// Do not open the control socket (disables `kiln stop`/`kiln status`).
    #[arg(long)]
    pub no_control_socket: bool,

    /// Suppress all log output.
    #[arg(long, conflicts_with = "verbose")]
    pub silent: bool,

    /// Log debug detail.
    #[arg(long)]
    pub verbose: bool,

    /// Run even when no hosted platform is detected.
    #[arg(long, env = "KILN_FORCE", value_parser = clap::builder::FalseyValueParser::new())]
    pub force: bool,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        // Exit 0 off-platform so a chained `&& npm start` still runs.
        if !self.force && hosted_marker(|name| std::env::var(name).ok()).is_none() {
            println!("not on a hosted platform; skipping (use --force to run anyway)");
            return Ok(());
        }
        crate::init_tracing(self.silent, self.verbose);

        let config = resolve_config(self.overrides())?;
        let silent = config.silent;
        match run_blocking(config) {
            Ok(None) => {
                if !silent {
                    eprintln!("{}", "no build pipeline detected; nothing to do".yellow());
                }
            }
            Ok(Some(reason)) | Err(RunError::Stopped { reason }) => {
                tracing::info!(reason = %reason, "kiln stopped")
            }
            Err(err) => return Err(err).context("kiln run failed"),
        }
        Ok(())
    }

    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            build_dir: self.build_dir.clone(),
            build_cmd: self.build_cmd.clone(),
            serve_cmd: self.serve_cmd.clone(),
            use_git: self.no_git.then_some(false),
            cache_file_name: self.cache_file_name.clone(),
            cache_write_policy: self
                .fail_if_cached_record
                .then_some(CacheWritePolicy::FailIfExists),
            cache_duration: self.cache_duration_secs.map(Duration::from_secs),
            serve_port: self.port,
            no_control_socket: self.no_control_socket,
            silent: self.silent,
            verbose: self.verbose,
            ..self.project.overrides()
        }
    }
}
