use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Confirm};

use super::{collaborators, GlobalArgs};
use crate::orchestrator::{
    destroy_plan, DestroyExecutor, DestroyOptions, Pipeline, PlanShape, Session,
};
use crate::state::{InstallationState, K1Paths};
use crate::ui;

/// Tear down the installation recorded in the configuration file
#[derive(Args, Debug)]
pub struct DestroyCommand {
    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Also delete the Terraform state and artifacts buckets
    #[arg(long)]
    purge_buckets: bool,

    /// Disable interactive features (device flow, prompts)
    #[arg(long)]
    ci: bool,
}

impl DestroyCommand {
    pub async fn run(&self, global: &GlobalArgs) -> Result<()> {
        let mut store = global.open_store()?;
        let mut state = InstallationState::from_store(&mut store)
            .context("No installation recorded in the configuration file")?;
        let paths = K1Paths::from_home()?;

        ui::print_section("Destroy");
        ui::print_kv("Cluster", &state.cluster_name);
        ui::print_kv("Domain", &state.domain);
        ui::print_kv("Cloud", state.cloud.as_str());

        if !self.yes && !self.ci {
            let proceed = Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(format!(
                    "Destroy cluster '{}' and everything it runs?",
                    state.cluster_name
                ))
                .default(false)
                .interact()?;
            if !proceed {
                println!("{}", "Destroy cancelled.".yellow());
                return Ok(());
            }
        }

        let deps = collaborators(&mut store, &mut state, &paths, !self.ci).await?;
        let shape = PlanShape {
            cloud: state.cloud,
            git: state.git,
        };
        let options = DestroyOptions {
            purge_buckets: self.purge_buckets,
        };
        let pipeline = Pipeline::new("Destroy", destroy_plan(shape, options)).dry_run(state.dry_run);
        let mut executor = DestroyExecutor::new(Session::new(state, paths, deps));

        let result = pipeline.run(&mut executor, &mut store).await;
        executor.shutdown().await;
        result?;

        ui::print_success("Destroy complete");
        ui::print_info("Run `kubefirst reset` to start a new installation from scratch");
        Ok(())
    }
}
