use anyhow::{Context, Result};
use clap::Args;
use dialoguer::{theme::ColorfulTheme, Confirm};
use tracing::info;

use super::GlobalArgs;
use crate::ui;

/// Forget every recorded step and secret by removing the configuration file
#[derive(Args, Debug)]
pub struct ResetCommand {
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,
}

impl ResetCommand {
    pub fn run(&self, global: &GlobalArgs) -> Result<()> {
        let path = &global.config;
        if !path.exists() {
            ui::print_info(&format!("{} does not exist, nothing to reset", path.display()));
            return Ok(());
        }
        if !self.yes {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Remove {} and all recorded progress?", path.display()))
                .default(false)
                .interact()?;
            if !proceed {
                return Ok(());
            }
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        info!(path = %path.display(), "Configuration reset");
        ui::print_success("Configuration reset");
        Ok(())
    }
}
