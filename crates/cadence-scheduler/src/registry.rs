//! Project registry: the authoritative name to project mapping.

use cadence_core::{Error, Project, Result, Schedule};
use std::collections::HashMap;
use std::sync::Arc;

/// Projects indexed by name, in the order the store returned them.
#[derive(Clone, Default)]
pub struct ProjectRegistry {
    projects: Vec<Arc<dyn Project>>,
    index: HashMap<String, usize>,
}

impl ProjectRegistry {
    /// Build a registry, rejecting duplicate names.
    pub fn new(projects: Vec<Arc<dyn Project>>) -> Result<Self> {
        let mut index = HashMap::with_capacity(projects.len());
        for (i, project) in projects.iter().enumerate() {
            if index.insert(project.name().to_string(), i).is_some() {
                return Err(Error::DuplicateProject(project.name().to_string()));
            }
        }
        Ok(Self { projects, index })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Project>> {
        self.index.get(name).map(|&i| &self.projects[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// First project in enumeration order.
    pub fn first(&self) -> Option<&Arc<dyn Project>> {
        self.projects.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Project>> {
        self.projects.iter()
    }

    /// Projects that have a schedule, paired with it.
    pub fn schedulable(&self) -> impl Iterator<Item = (&Arc<dyn Project>, Arc<dyn Schedule>)> {
        self.projects
            .iter()
            .filter_map(|p| p.schedule().map(|s| (p, s)))
    }

    pub fn names(&self) -> Vec<String> {
        self.projects.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Behavior, MockProject, projects};

    #[test]
    fn test_lookup_and_order() {
        let zeta = MockProject::new("zeta", Behavior::Succeed);
        let alpha = MockProject::unscheduled("alpha", Behavior::Succeed);
        let registry = ProjectRegistry::new(projects([&zeta, &alpha])).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["zeta", "alpha"]);
        assert_eq!(registry.first().map(|p| p.name()), Some("zeta"));
        assert!(registry.contains("alpha"));
        assert!(registry.get("missing").is_none());

        let scheduled: Vec<_> = registry.schedulable().map(|(p, _)| p.name()).collect();
        assert_eq!(scheduled, vec!["zeta"]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let first = MockProject::new("dup", Behavior::Succeed);
        let second = MockProject::unscheduled("dup", Behavior::Succeed);
        let result = ProjectRegistry::new(projects([&first, &second]));
        assert!(matches!(result, Err(Error::DuplicateProject(name)) if name == "dup"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = ProjectRegistry::default();
        assert!(registry.is_empty());
        assert!(registry.first().is_none());
    }
}
