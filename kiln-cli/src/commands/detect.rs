//! `kiln detect`: show the inferred pipeline without running it.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use super::{resolve_config, ProjectArgs};

#[derive(Args, Debug)]
pub struct DetectArgs {
    #[command(flatten)]
    pub project: ProjectArgs,

    /// Emit machine-readable JSON (`null` when nothing was detected).
    #[arg(long)]
    pub json: bool,
}

impl DetectArgs {
    pub fn run(self) -> Result<()> {
        crate::init_tracing(false, false);
        let config = resolve_config(self.project.overrides())?;
        let pipeline = kiln_detector::detect(&config);

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&pipeline).context("failed to render pipeline JSON")?
            );
            return Ok(());
        }

        let Some(pipeline) = pipeline else {
            println!("{}", "no build pipeline detected".yellow());
            return Ok(());
        };
        println!("build:     {}", pipeline.build_cmd.bold());
        match &pipeline.serve_cmd {
            Some(serve) => println!("serve:     {}", serve.bold()),
            None => println!(
                "serve:     built-in static server on port {}",
                config.serve_port
            ),
        }
        println!(
            "output:    {}",
            config.output_dir_for(&pipeline.build_dir_name).display()
        );
        if let Some(framework) = &pipeline.framework {
            println!("framework: {framework}");
        }
        Ok(())
    }
}
