//! `kiln stop` / `kiln status`: talk to a running kiln over its control
//! socket.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{Local, TimeZone};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;

use kiln_cache::store;
use kiln_core::{CacheRecord, Config};

use super::{resolve_config, ProjectArgs};

#[derive(Args, Debug)]
pub struct StopArgs {
    #[command(flatten)]
    pub project: ProjectArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

fn socket_for(config: &Config) -> Result<PathBuf> {
    match &config.control_socket {
        Some(socket) => Ok(socket.clone()),
        None => bail!("the control socket is disabled for this project"),
    }
}

impl StopArgs {
    pub fn run(self) -> Result<()> {
        let config = resolve_config(self.project.overrides())?;
        let socket = socket_for(&config)?;
        stop(&socket)
    }
}

#[cfg(unix)]
fn stop(socket: &std::path::Path) -> Result<()> {
    use kiln_runtime::{protocol, ProtocolError};

    match protocol::request_stop(socket) {
        Ok(()) => println!("stop requested"),
        Err(ProtocolError::NotRunning { .. }) => println!("kiln is not running"),
        Err(err) => return Err(err).context("failed to stop kiln"),
    }
    Ok(())
}

#[cfg(not(unix))]
fn stop(_socket: &std::path::Path) -> Result<()> {
    bail!("`kiln stop` needs unix domain sockets, which this platform lacks")
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    running: bool,
    socket: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<Value>,
    cache_record: Option<CacheRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_error: Option<String>,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let config = resolve_config(self.project.overrides())?;
        let run = match &config.control_socket {
            Some(socket) => query_status(socket)?,
            None => None,
        };

        let (cache_record, cache_error) = match store::read_strict(&config) {
            Ok(record) => (record, None),
            Err(err) => (None, Some(err.to_string())),
        };

        let report = StatusReport {
            running: run.is_some(),
            socket: config.control_socket.clone(),
            run,
            cache_record,
            cache_error,
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render status JSON")?
            );
            return Ok(());
        }
        print_report(&config, &report);
        Ok(())
    }
}

#[cfg(unix)]
fn query_status(socket: &std::path::Path) -> Result<Option<Value>> {
    use kiln_runtime::{protocol, ProtocolError};

    match protocol::request_status(socket) {
        Ok(status) => Ok(Some(status)),
        Err(ProtocolError::NotRunning { .. }) => Ok(None),
        Err(err) => Err(err).context("failed to query kiln status"),
    }
}

#[cfg(not(unix))]
fn query_status(_socket: &std::path::Path) -> Result<Option<Value>> {
    Ok(None)
}

fn print_report(config: &Config, report: &StatusReport) {
    println!("{}", config.project_root_full.display().to_string().bold());

    match &report.run {
        Some(run) => {
            let state = run["state"].as_str().unwrap_or("unknown");
            println!("  {} {} (pid {})", "running".green(), state, run["pid"]);
            for role in ["build", "serve"] {
                if let Some(pid) = run["processes"][role].as_u64() {
                    println!("  {role} process: pid {pid}");
                }
            }
            if let Some(server) = run["processes"]["server"].as_str() {
                println!("  static server: {server}");
            }
        }
        None => println!("  {}", "not running".dimmed()),
    }

    match &report.cache_record {
        Some(record) => {
            let built = record
                .built_at_utc()
                .map(|t| Local.from_utc_datetime(&t.naive_utc()).format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("  last build: {built}");
            println!("  output:     {}", record.build_dir_name.display());
            if let Some(sha) = &record.commit_sha {
                println!("  revision:   {sha}");
            }
        }
        None => match &report.cache_error {
            Some(err) => println!("  last build: {} ({err})", "unreadable record".red()),
            None => println!("  last build: {}", "none recorded".yellow()),
        },
    }
}
