//! Project definition parsing.

use crate::{ConfigError, ConfigResult};
use cadence_core::{IntervalSchedule, Schedule};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A project as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectDefinition {
    /// Unique project name.
    pub name: String,
    /// Trigger policy; `None` means the project only builds on request.
    pub schedule: Option<ScheduleDefinition>,
    /// Directory the commands run in.
    pub workdir: Option<PathBuf>,
    /// Shell commands run in order; the first failure ends the build.
    pub commands: Vec<String>,
    /// Extra environment variables for every command.
    pub env: HashMap<String, String>,
    /// Maximum duration of a whole integration.
    pub timeout: Option<Duration>,
}

/// Trigger policy as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleDefinition {
    /// Build every `every`, optionally right after start.
    Interval { every: Duration, initial: bool },
    /// Build only when forced.
    Manual,
}

impl ScheduleDefinition {
    /// Create a fresh schedule instance for a newly loaded project.
    pub fn build(&self) -> ConfigResult<Arc<dyn Schedule>> {
        match self {
            ScheduleDefinition::Interval { every, initial } => {
                let schedule =
                    IntervalSchedule::new(*every).map_err(|e| ConfigError::InvalidValue {
                        field: "schedule interval".to_string(),
                        message: e.to_string(),
                    })?;
                let schedule = if *initial {
                    schedule
                } else {
                    schedule.without_initial_build()
                };
                Ok(Arc::new(schedule))
            }
            ScheduleDefinition::Manual => Ok(Arc::new(IntervalSchedule::manual())),
        }
    }
}

/// Read and parse a project file.
pub fn load_projects_file(path: &Path) -> ConfigResult<Vec<ProjectDefinition>> {
    let content = std::fs::read_to_string(path)?;
    let projects = parse_projects(&content)?;
    debug!(path = %path.display(), count = projects.len(), "Loaded project definitions");
    Ok(projects)
}

/// Parse project definitions from KDL text, preserving their order.
pub fn parse_projects(kdl: &str) -> ConfigResult<Vec<ProjectDefinition>> {
    let doc: KdlDocument = kdl.parse()?;

    let mut projects = Vec::new();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        // Ignore unknown nodes
        if node.name().value() != "project" {
            continue;
        }
        let project = parse_project(node)?;
        if !seen.insert(project.name.clone()) {
            return Err(ConfigError::Duplicate(project.name));
        }
        projects.push(project);
    }

    Ok(projects)
}

fn parse_project(node: &KdlNode) -> ConfigResult<ProjectDefinition> {
    let name = get_first_string_arg(node)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("project name".to_string()))?;

    let mut schedule = None;
    let mut workdir = None;
    let mut commands = Vec::new();
    let mut env = HashMap::new();
    let mut timeout = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "schedule" => {
                    schedule = Some(parse_schedule(&name, child)?);
                }
                "workdir" => {
                    workdir = get_first_string_arg(child).map(PathBuf::from);
                }
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "timeout" => {
                    let secs = get_first_int_arg(child).ok_or_else(|| {
                        ConfigError::MissingField(format!("timeout seconds for project '{}'", name))
                    })?;
                    timeout = Some(positive_seconds(&name, "timeout", secs)?);
                }
                "env" => {
                    if let Some(grandchildren) = child.children() {
                        for gc in grandchildren.nodes() {
                            let key = gc.name().value().to_string();
                            if let Some(val) = get_first_string_arg(gc) {
                                env.insert(key, val);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    if commands.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "run command for project '{}'",
            name
        )));
    }

    Ok(ProjectDefinition {
        name,
        schedule,
        workdir,
        commands,
        env,
        timeout,
    })
}

fn parse_schedule(project: &str, node: &KdlNode) -> ConfigResult<ScheduleDefinition> {
    if get_flag_prop(node, "manual").unwrap_or(false) {
        return Ok(ScheduleDefinition::Manual);
    }

    let secs = node
        .get("interval")
        .and_then(|v| v.as_integer())
        .or_else(|| get_first_int_arg(node))
        .ok_or_else(|| {
            ConfigError::MissingField(format!("schedule interval for project '{}'", project))
        })?;

    Ok(ScheduleDefinition::Interval {
        every: positive_seconds(project, "schedule interval", secs)?,
        initial: get_flag_prop(node, "initial").unwrap_or(true),
    })
}

fn positive_seconds(project: &str, field: &str, secs: i128) -> ConfigResult<Duration> {
    u64::try_from(secs)
        .ok()
        .filter(|s| *s > 0)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            field: format!("{} of project '{}'", field, project),
            message: format!("expected a positive number of seconds, got {}", secs),
        })
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

/// Booleans are accepted both as KDL booleans and as bare `true`/`false`
/// strings, which KDL v2 parses as identifiers.
fn get_flag_prop(node: &KdlNode, name: &str) -> Option<bool> {
    let value = node.get(name)?;
    value
        .as_bool()
        .or_else(|| match value.as_string() {
            Some("true") => Some(true),
            Some("false") => Some(false),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_projects_in_order() {
        let kdl = r#"
            project "alpha" {
                schedule interval=60
                workdir "/srv/alpha"
                run "cargo build"
                run "cargo test"
            }

            project "beta" {
                run "make"
            }
        "#;

        let projects = parse_projects(kdl).unwrap();
        assert_eq!(projects.len(), 2);

        assert_eq!(projects[0].name, "alpha");
        assert_eq!(
            projects[0].schedule,
            Some(ScheduleDefinition::Interval {
                every: Duration::from_secs(60),
                initial: true,
            })
        );
        assert_eq!(projects[0].workdir, Some(PathBuf::from("/srv/alpha")));
        assert_eq!(projects[0].commands, vec!["cargo build", "cargo test"]);

        assert_eq!(projects[1].name, "beta");
        assert_eq!(projects[1].schedule, None);
    }

    #[test]
    fn test_parse_env_and_timeout() {
        let kdl = r#"
            project "svc" {
                timeout 300
                env {
                    RUST_LOG "debug"
                    TARGET "release"
                }
                run "cargo build"
            }
        "#;

        let projects = parse_projects(kdl).unwrap();
        assert_eq!(projects[0].timeout, Some(Duration::from_secs(300)));
        assert_eq!(projects[0].env.get("RUST_LOG"), Some(&"debug".to_string()));
        assert_eq!(projects[0].env.len(), 2);
    }

    #[test]
    fn test_parse_manual_and_no_initial_schedules() {
        let kdl = r#"
            project "nightly" {
                schedule interval=86400 initial=#false
                run "make nightly"
            }
            project "release" {
                schedule manual=#true
                run "make release"
            }
        "#;

        let projects = parse_projects(kdl).unwrap();
        assert_eq!(
            projects[0].schedule,
            Some(ScheduleDefinition::Interval {
                every: Duration::from_secs(86400),
                initial: false,
            })
        );
        assert_eq!(projects[1].schedule, Some(ScheduleDefinition::Manual));
    }

    #[test]
    fn test_duplicate_project_rejected() {
        let kdl = r#"
            project "a" { run "true"; }
            project "a" { run "false"; }
        "#;

        assert!(matches!(
            parse_projects(kdl).unwrap_err(),
            ConfigError::Duplicate(name) if name == "a"
        ));
    }

    #[test]
    fn test_missing_commands_rejected() {
        let kdl = r#"
            project "empty" {
                schedule interval=60
            }
        "#;

        assert!(matches!(
            parse_projects(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_non_positive_interval_rejected() {
        let kdl = r#"
            project "zero" {
                schedule interval=0
                run "true"
            }
        "#;

        assert!(matches!(
            parse_projects(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_missing_name_rejected() {
        let kdl = r#"
            project {
                run "true"
            }
        "#;

        assert!(matches!(
            parse_projects(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_schedule_definition_builds_fresh_instances() {
        let def = ScheduleDefinition::Interval {
            every: Duration::from_secs(5),
            initial: true,
        };
        let a = def.build().unwrap();
        let b = def.build().unwrap();
        a.force_build();
        let now = tokio::time::Instant::now();
        assert_eq!(a.poll(now), Some(cadence_core::BuildCondition::Forced));
        assert_eq!(b.poll(now), Some(cadence_core::BuildCondition::Scheduled));
    }

    #[test]
    fn test_load_projects_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.kdl");
        std::fs::write(&path, "project \"x\" {\n    run \"true\"\n}\n").unwrap();

        let projects = load_projects_file(&path).unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].name, "x");

        assert!(matches!(
            load_projects_file(&dir.path().join("missing.kdl")).unwrap_err(),
            ConfigError::Io(_)
        ));
    }
}
