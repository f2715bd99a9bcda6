//! Dependency resolution over the ports tree.
//!
//! `resolve` walks the graph depth-first from each target (targets and
//! dependencies in lexical order) and emits packages in post-order, so every
//! dependency precedes its dependents and the plan is deterministic. A
//! three-colour mark detects back-edges; the offending path is reported.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use thiserror::Error;
use tracing::debug;
use zeropkg_schema::{DependencyKind, DependencyRef, PackageDefinition, PortsTree};

fn render_path(path: &[String]) -> String {
    path.join(" -> ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("dependency cycle: {}", render_path(path))]
    CycleDetected { path: Vec<String> },
    #[error("{package}: missing dependency '{missing}' ({})", render_path(path))]
    MissingDependency {
        package: String,
        missing: String,
        path: Vec<String>,
    },
    #[error("{package} {found} does not satisfy {constraint} required by {requester}")]
    VersionConflict {
        package: String,
        requester: String,
        constraint: String,
        found: String,
    },
    #[error("package not found in ports tree: {0}")]
    UnknownPackage(String),
}

impl ResolveError {
    pub fn package(&self) -> &str {
        match self {
            ResolveError::CycleDetected { path } => path.first().map_or("", String::as_str),
            ResolveError::MissingDependency { package, .. }
            | ResolveError::VersionConflict { package, .. }
            | ResolveError::UnknownPackage(package) => package.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Follow `optional` edges as well.
    pub include_optional: bool,
}

/// Package name to direct dependencies, built fresh per request.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    nodes: BTreeMap<&'a str, &'a PackageDefinition>,
    edges: BTreeMap<&'a str, Vec<&'a DependencyRef>>,
}

impl<'a> DependencyGraph<'a> {
    pub fn from_ports(ports: &'a PortsTree, options: ResolveOptions) -> Self {
        let mut nodes = BTreeMap::new();
        let mut edges = BTreeMap::new();
        for def in ports.iter() {
            let mut deps: Vec<&DependencyRef> = def
                .dependencies
                .iter()
                .filter(|d| options.include_optional || d.kind != DependencyKind::Optional)
                .collect();
            deps.sort_by(|a, b| a.name.cmp(&b.name));
            nodes.insert(def.name.as_str(), def);
            edges.insert(def.name.as_str(), deps);
        }
        Self { nodes, edges }
    }

    pub fn get(&self, name: &str) -> Option<&'a PackageDefinition> {
        self.nodes.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Direct dependency edges of `name`, sorted by dependency name.
    pub fn dependencies(&self, name: &str) -> &[&'a DependencyRef] {
        self.edges.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependency_names(&self, name: &str) -> BTreeSet<&'a str> {
        self.dependencies(name)
            .iter()
            .map(|d| d.name.as_str())
            .collect()
    }

    /// Packages in the graph that depend directly on `name`.
    pub fn dependents(&self, name: &str) -> BTreeSet<&'a str> {
        self.edges
            .iter()
            .filter(|(_, deps)| deps.iter().any(|d| d.name == *name))
            .map(|(n, _)| *n)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PlannedPackage<'a> {
    pub def: &'a PackageDefinition,
    /// Direct dependencies; all of them appear earlier in the plan.
    pub dependencies: BTreeSet<&'a str>,
    /// Requested by the caller rather than pulled in.
    pub target: bool,
}

impl<'a> PlannedPackage<'a> {
    pub fn name(&self) -> &'a str {
        self.def.name.as_str()
    }
}

/// Packages in topological order: every dependency precedes its dependents.
#[derive(Debug, Clone, Default)]
pub struct BuildPlan<'a> {
    packages: Vec<PlannedPackage<'a>>,
}

impl<'a> BuildPlan<'a> {
    pub fn packages(&self) -> &[PlannedPackage<'a>] {
        &self.packages
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlannedPackage<'a>> {
        self.packages.iter()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn names(&self) -> Vec<&'a str> {
        self.packages.iter().map(PlannedPackage::name).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.packages.iter().position(|p| p.name() == name)
    }

    /// Drop packages that need no work. Order is preserved, so the plan
    /// stays topological.
    pub fn retain(&mut self, f: impl FnMut(&PlannedPackage<'a>) -> bool) {
        self.packages.retain(f);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

struct Walk<'g, 'a> {
    graph: &'g DependencyGraph<'a>,
    marks: HashMap<&'a str, Mark>,
    stack: Vec<&'a str>,
    order: Vec<&'a str>,
}

impl<'a> Walk<'_, 'a> {
    fn visit(&mut self, name: &'a str) -> Result<(), ResolveError> {
        match self.marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = self.stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut path: Vec<String> =
                    self.stack[start..].iter().map(ToString::to_string).collect();
                path.push(name.to_owned());
                return Err(ResolveError::CycleDetected { path });
            }
            None => {}
        }
        self.marks.insert(name, Mark::Visiting);
        self.stack.push(name);

        let graph = self.graph;
        for dep in graph.dependencies(name) {
            let Some(def) = graph.get(&dep.name) else {
                let mut path: Vec<String> = self.stack.iter().map(ToString::to_string).collect();
                path.push(dep.name.to_string());
                return Err(ResolveError::MissingDependency {
                    package: name.to_owned(),
                    missing: dep.name.to_string(),
                    path,
                });
            };
            if let Some(constraint) = &dep.constraint {
                if !constraint.matches(&def.version) {
                    return Err(ResolveError::VersionConflict {
                        package: dep.name.to_string(),
                        requester: name.to_owned(),
                        constraint: constraint.to_string(),
                        found: def.version.to_string(),
                    });
                }
            }
            self.visit(def.name.as_str())?;
        }

        self.stack.pop();
        self.marks.insert(name, Mark::Done);
        self.order.push(name);
        Ok(())
    }
}

/// Compute the build order for `targets`. Fails as a whole on the first
/// cycle, missing package or unsatisfied constraint.
pub fn resolve<'a, S: AsRef<str>>(
    targets: &[S],
    graph: &DependencyGraph<'a>,
) -> Result<BuildPlan<'a>, ResolveError> {
    let mut requested: BTreeSet<&'a str> = BTreeSet::new();
    for target in targets {
        let target = target.as_ref();
        let def = graph
            .get(target)
            .ok_or_else(|| ResolveError::UnknownPackage(target.to_owned()))?;
        requested.insert(def.name.as_str());
    }

    let mut walk = Walk {
        graph,
        marks: HashMap::new(),
        stack: Vec::new(),
        order: Vec::new(),
    };
    for &target in &requested {
        walk.visit(target)?;
    }

    let mut packages = Vec::with_capacity(walk.order.len());
    for name in walk.order {
        let Some(def) = graph.get(name) else {
            continue;
        };
        packages.push(PlannedPackage {
            def,
            dependencies: graph.dependency_names(name),
            target: requested.contains(name),
        });
    }
    debug!(
        "resolved {} target(s) into {} package(s)",
        requested.len(),
        packages.len()
    );
    Ok(BuildPlan { packages })
}

/// Render the dependency tree of `target` as indented text. Missing
/// packages and back-edges are marked instead of failing.
pub fn explain(graph: &DependencyGraph<'_>, target: &str) -> Result<String, ResolveError> {
    let def = graph
        .get(target)
        .ok_or_else(|| ResolveError::UnknownPackage(target.to_owned()))?;
    let mut out = format!("{} {}\n", def.name, def.version);
    let mut stack = vec![def.name.as_str()];
    explain_into(graph, def.name.as_str(), "", &mut stack, &mut out);
    Ok(out)
}

fn explain_into<'a>(
    graph: &DependencyGraph<'a>,
    name: &str,
    prefix: &str,
    stack: &mut Vec<&'a str>,
    out: &mut String,
) {
    let deps = graph.dependencies(name);
    for (i, dep) in deps.iter().enumerate() {
        let last = i + 1 == deps.len();
        let _ = write!(out, "{prefix}{}{}", if last { "└─ " } else { "├─ " }, dep.name);
        let child = graph.get(&dep.name);
        if let Some(def) = child {
            let _ = write!(out, " {}", def.version);
        }
        let _ = write!(out, " ({}", dep.kind);
        if let Some(c) = &dep.constraint {
            let _ = write!(out, " {c}");
        }
        out.push(')');

        match child {
            None => out.push_str(" [missing]\n"),
            Some(def) if stack.contains(&def.name.as_str()) => out.push_str(" [cycle]\n"),
            Some(def) => {
                out.push('\n');
                let nested = format!("{prefix}{}", if last { "   " } else { "│  " });
                stack.push(def.name.as_str());
                explain_into(graph, def.name.as_str(), &nested, stack, out);
                stack.pop();
            }
        }
    }
}

/// Ports packages that depend on `name`, directly or transitively.
pub fn reverse_dependencies(graph: &DependencyGraph<'_>, name: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut queue = vec![name];
    while let Some(current) = queue.pop() {
        for dependent in graph.dependents(current) {
            if dependent != name && seen.insert(dependent) {
                queue.push(dependent);
            }
        }
    }
    seen.into_iter().map(ToOwned::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(name: &str, deps: &str) -> (String, String) {
        (
            format!("{name}/recipe.toml"),
            format!("name = \"{name}\"\nversion = \"1.0\"\ndependencies = [{deps}]\n"),
        )
    }

    fn tree(recipes: &[(&str, &str)]) -> PortsTree {
        PortsTree::from_listing(recipes.iter().map(|(n, d)| recipe(n, d))).unwrap()
    }

    fn plan_names(ports: &PortsTree, targets: &[&str]) -> Vec<String> {
        let graph = DependencyGraph::from_ports(ports, ResolveOptions::default());
        resolve(targets, &graph)
            .unwrap()
            .names()
            .into_iter()
            .map(ToOwned::to_owned)
            .collect()
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let ports = tree(&[("a", ""), ("b", "\"a\""), ("c", "\"a\", \"b\"")]);
        assert_eq!(plan_names(&ports, &["c"]), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_lists_each_package_once() {
        let ports = tree(&[
            ("base", ""),
            ("left", "\"base\""),
            ("right", "\"base\""),
            ("top", "\"right\", \"left\""),
        ]);
        assert_eq!(
            plan_names(&ports, &["top"]),
            vec!["base", "left", "right", "top"]
        );
    }

    #[test]
    fn independent_targets_follow_lexical_order() {
        let ports = tree(&[("zsh", ""), ("bash", ""), ("mksh", "")]);
        assert_eq!(
            plan_names(&ports, &["zsh", "mksh", "bash"]),
            vec!["bash", "mksh", "zsh"]
        );
    }

    #[test]
    fn every_dependency_precedes_its_dependents() {
        let ports = tree(&[
            ("a", ""),
            ("b", "\"a\""),
            ("c", "\"b\""),
            ("d", "\"a\", \"c\""),
            ("e", "\"d\", \"b\""),
            ("f", ""),
        ]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let plan = resolve(&["e", "f"], &graph).unwrap();
        assert_eq!(plan.len(), 6);
        for p in plan.iter() {
            let at = plan.position(p.name()).unwrap();
            for dep in &p.dependencies {
                assert!(plan.position(dep).unwrap() < at, "{dep} after {}", p.name());
            }
        }
        let targets: Vec<&str> = plan.iter().filter(|p| p.target).map(|p| p.name()).collect();
        assert_eq!(targets, vec!["e", "f"]);
    }

    #[test]
    fn cycle_reports_the_path() {
        let ports = tree(&[("a", "\"b\""), ("b", "\"c\""), ("c", "\"a\""), ("x", "\"a\"")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let err = resolve(&["x"], &graph).unwrap_err();
        assert_eq!(
            err,
            ResolveError::CycleDetected {
                path: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> c -> a");
    }

    #[test]
    fn missing_dependency_names_requester_and_path() {
        let ports = tree(&[("app", "\"lib\""), ("lib", "\"ghost\"")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        match resolve(&["app"], &graph).unwrap_err() {
            ResolveError::MissingDependency {
                package,
                missing,
                path,
            } => {
                assert_eq!(package, "lib");
                assert_eq!(missing, "ghost");
                assert_eq!(path, vec!["app", "lib", "ghost"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_target_is_rejected() {
        let ports = tree(&[("a", "")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        assert_eq!(
            resolve(&["nope"], &graph).unwrap_err(),
            ResolveError::UnknownPackage("nope".into())
        );
    }

    #[test]
    fn version_constraint_checked_against_ports_version() {
        let ports = tree(&[("lib", ""), ("app", "\"lib>=2.0\"")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        match resolve(&["app"], &graph).unwrap_err() {
            ResolveError::VersionConflict {
                package,
                requester,
                found,
                ..
            } => {
                assert_eq!(package, "lib");
                assert_eq!(requester, "app");
                assert_eq!(found, "1.0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn build_dependencies_are_planned_and_optional_ones_skipped() {
        let ports = tree(&[
            ("bison", ""),
            ("docs", ""),
            (
                "shadow",
                "{ name = \"bison\", type = \"build\" }, { name = \"docs\", type = \"optional\" }",
            ),
        ]);
        assert_eq!(plan_names(&ports, &["shadow"]), vec!["bison", "shadow"]);

        let graph = DependencyGraph::from_ports(
            &ports,
            ResolveOptions {
                include_optional: true,
            },
        );
        let plan = resolve(&["shadow"], &graph).unwrap();
        assert_eq!(plan.names(), vec!["bison", "docs", "shadow"]);
    }

    #[test]
    fn explain_marks_missing_and_cycles() {
        let ports = tree(&[("a", "\"b\", \"ghost\""), ("b", "\"a\"")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let text = explain(&graph, "a").unwrap();
        assert_eq!(
            text,
            "a 1.0\n├─ b 1.0 (runtime)\n│  └─ a 1.0 (runtime) [cycle]\n└─ ghost (runtime) [missing]\n"
        );
    }

    #[test]
    fn reverse_dependencies_are_transitive() {
        let ports = tree(&[("a", ""), ("b", "\"a\""), ("c", "\"b\""), ("d", "")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        assert_eq!(reverse_dependencies(&graph, "a"), vec!["b", "c"]);
        assert!(reverse_dependencies(&graph, "d").is_empty());
    }

    #[test]
    fn retain_keeps_order() {
        let ports = tree(&[("a", ""), ("b", "\"a\""), ("c", "\"b\"")]);
        let graph = DependencyGraph::from_ports(&ports, ResolveOptions::default());
        let mut plan = resolve(&["c"], &graph).unwrap();
        plan.retain(|p| p.name() != "b");
        assert_eq!(plan.names(), vec!["a", "c"]);
        assert!(!plan.contains("b"));
    }
}
