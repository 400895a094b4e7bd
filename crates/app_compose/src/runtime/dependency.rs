//! Dependency graph construction and topological sorting

use crate::config::AppSpec;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet, VecDeque};

/// An app with its resolved direct dependencies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApp {
    /// App name
    pub name: String,
    /// Known dependencies, in `depends_on` declaration order
    pub dependencies: Vec<String>,
}

/// Dependency graph of the apps in a compose file
#[derive(Debug)]
pub struct DependencyGraph {
    /// Apps in topological order
    pub apps: Vec<ResolvedApp>,
    /// Map from app name to index
    pub index_map: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build a dependency graph, dropping dependencies on unknown apps
    pub fn build(apps: &IndexMap<String, AppSpec>) -> Result<Self, DependencyError> {
        let mut resolved: IndexMap<String, ResolvedApp> = IndexMap::new();

        for (name, app) in apps {
            let mut dependencies = Vec::new();
            for dependency in &app.depends_on {
                if !apps.contains_key(dependency) {
                    log::warn!(
                        "App '{}' depends on unknown app '{}', ignoring",
                        name,
                        dependency
                    );
                    continue;
                }
                if !dependencies.contains(dependency) {
                    dependencies.push(dependency.clone());
                }
            }

            resolved.insert(
                name.clone(),
                ResolvedApp {
                    name: name.clone(),
                    dependencies,
                },
            );
        }

        let sorted = Self::topological_sort(&resolved)?;

        let index_map: HashMap<String, usize> = sorted
            .iter()
            .enumerate()
            .map(|(i, app)| (app.name.clone(), i))
            .collect();

        Ok(Self {
            apps: sorted,
            index_map,
        })
    }

    /// Topological sort using Kahn's algorithm, stable in declaration order
    fn topological_sort(
        apps: &IndexMap<String, ResolvedApp>,
    ) -> Result<Vec<ResolvedApp>, DependencyError> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for (name, app) in apps {
            in_degree.entry(name.as_str()).or_insert(0);
            for dependency in &app.dependencies {
                *in_degree.entry(name.as_str()).or_insert(0) += 1;
                dependents
                    .entry(dependency.as_str())
                    .or_default()
                    .push(name.as_str());
            }
        }

        // Start with apps that have no dependencies
        let mut queue: VecDeque<&str> = apps
            .keys()
            .map(String::as_str)
            .filter(|name| in_degree.get(name) == Some(&0))
            .collect();

        let mut sorted: Vec<ResolvedApp> = Vec::with_capacity(apps.len());

        while let Some(name) = queue.pop_front() {
            let Some(app) = apps.get(name) else {
                continue;
            };
            sorted.push(app.clone());

            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if sorted.len() != apps.len() {
            let sorted_names: HashSet<&str> = sorted.iter().map(|app| app.name.as_str()).collect();
            let cycle_apps: Vec<String> = apps
                .keys()
                .filter(|name| !sorted_names.contains(name.as_str()))
                .cloned()
                .collect();

            return Err(DependencyError::CyclicDependency(cycle_apps));
        }

        Ok(sorted)
    }

    /// Known direct dependencies of an app
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.index_map
            .get(name)
            .map(|&i| self.apps[i].dependencies.as_slice())
            .unwrap_or_default()
    }

    /// Apps in an order where every dependency precedes its dependents
    pub fn start_order(&self) -> impl Iterator<Item = &ResolvedApp> {
        self.apps.iter()
    }
}

/// Errors that can occur when building the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Cyclic dependency detected involving apps: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}
