//! CLI command implementations.

pub mod run;

use crate::store::FileConfigurationStore;
use anyhow::{Context, Result};
use cadence_config::{ScheduleDefinition, load_projects_file};
use cadence_scheduler::Orchestrator;
use std::path::Path;
use std::sync::Arc;

/// Run one forced integration and fail unless it succeeded.
pub async fn build(config: &Path, project: &str) -> Result<()> {
    let store = Arc::new(FileConfigurationStore::new(config));
    let orchestrator = Orchestrator::new(store)
        .await
        .with_context(|| format!("Failed to load {}", config.display()))?;

    let result = orchestrator
        .run_integration(project)
        .await
        .with_context(|| format!("Failed to build {}", project))?;

    println!(
        "{} #{} {} in {}ms",
        result.project,
        result.number,
        result.status,
        result.duration().num_milliseconds()
    );
    if let Some(message) = &result.message {
        println!("  {}", message);
    }

    if result.status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Build of {} finished with status {}", project, result.status);
    }
}

pub fn validate(path: &Path) -> Result<()> {
    let projects = load_projects_file(path)
        .with_context(|| format!("Configuration error in {}", path.display()))?;

    let scheduled = projects.iter().filter(|p| p.schedule.is_some()).count();
    println!(
        "Configuration is valid: {} projects, {} scheduled",
        projects.len(),
        scheduled
    );
    Ok(())
}

fn describe(schedule: Option<&ScheduleDefinition>) -> String {
    match schedule {
        Some(ScheduleDefinition::Interval { every, initial: true }) => {
            format!("every {}s", every.as_secs())
        }
        Some(ScheduleDefinition::Interval {
            every,
            initial: false,
        }) => format!("every {}s, no initial build", every.as_secs()),
        Some(ScheduleDefinition::Manual) => "manual".to_string(),
        None => "-".to_string(),
    }
}

/// Print each configured project, its schedule and integrator state.
pub async fn status(config: &Path, json: bool) -> Result<()> {
    let store = FileConfigurationStore::new(config);
    let definitions = store
        .definitions()
        .with_context(|| format!("Configuration error in {}", config.display()))?;
    let orchestrator = Orchestrator::new(Arc::new(store)).await?;

    let rows: Vec<_> = definitions
        .iter()
        .map(|def| {
            let integrator = orchestrator.integrator(&def.name).map(|i| i.summary());
            (def, integrator)
        })
        .collect();

    if json {
        let value: Vec<_> = rows
            .iter()
            .map(|(def, integrator)| {
                serde_json::json!({
                    "name": def.name,
                    "schedule": def.schedule,
                    "commands": def.commands.len(),
                    "integrator": integrator,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "{:<24} {:<32} {:<10} {}",
        "PROJECT", "SCHEDULE", "STATE", "COMMANDS"
    );
    for (def, integrator) in &rows {
        let state = integrator
            .as_ref()
            .map(|s| s.state.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<32} {:<10} {}",
            def.name,
            describe(def.schedule.as_ref()),
            state,
            def.commands.len()
        );
    }
    Ok(())
}
