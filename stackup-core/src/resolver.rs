//! Dependency resolution
//!
//! Computes a deterministic startup order for a requested subset of a
//! stack's services. Dependencies outside the subset are treated as already
//! satisfied; the reverse of the startup order is the shutdown order.
//! Pure functions, no side effects.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::stack::ServiceConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown service in request: '{name}'")]
    UnknownService { name: String },

    #[error("circular dependency detected: {}", .cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Topological startup order for `subset`, restricted to edges inside it.
///
/// Independent services come out in name order: DFS roots iterate sorted,
/// which keeps the result stable across calls.
pub fn resolve(
    services: &BTreeMap<String, ServiceConfig>,
    subset: &[String],
) -> Result<Vec<String>, ResolveError> {
    let requested: BTreeSet<&str> = subset.iter().map(String::as_str).collect();

    for name in &requested {
        if !services.contains_key(*name) {
            return Err(ResolveError::UnknownService {
                name: (*name).to_string(),
            });
        }
    }

    let mut marks: BTreeMap<&str, Mark> =
        requested.iter().map(|n| (*n, Mark::Unvisited)).collect();
    let mut order = Vec::with_capacity(requested.len());

    fn visit<'a>(
        node: &'a str,
        services: &'a BTreeMap<String, ServiceConfig>,
        requested: &BTreeSet<&'a str>,
        marks: &mut BTreeMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        marks.insert(node, Mark::InProgress);
        path.push(node);

        for dep in &services[node].depends_on {
            // Deps the caller did not request are treated as satisfied
            if !requested.contains(dep.as_str()) {
                continue;
            }
            match marks.get(dep.as_str()) {
                Some(Mark::InProgress) => {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap();
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(dep.clone());
                    return Err(ResolveError::CircularDependency { cycle });
                }
                Some(Mark::Unvisited) => {
                    visit(dep, services, requested, marks, path, order)?;
                }
                Some(Mark::Done) | None => {}
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        order.push(node.to_string());
        Ok(())
    }

    for name in &requested {
        if marks.get(name) == Some(&Mark::Unvisited) {
            let mut path = Vec::new();
            visit(name, services, &requested, &mut marks, &mut path, &mut order)?;
        }
    }

    Ok(order)
}

/// Reverse of the startup order, used when stopping services.
pub fn shutdown_order(
    services: &BTreeMap<String, ServiceConfig>,
    subset: &[String],
) -> Result<Vec<String>, ResolveError> {
    let mut order = resolve(services, subset)?;
    order.reverse();
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::ServiceStack;

    fn services(yaml: &str) -> BTreeMap<String, ServiceConfig> {
        ServiceStack::from_str(yaml).unwrap().services
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let services = services(
            r#"
name: demo
services:
  web:
    command: node server.js
    depends_on: [db]
  db:
    command: postgres
  worker:
    command: python worker.py
    depends_on: [web, db]
"#,
        );

        let order = resolve(&services, &names(&["worker", "web", "db"])).unwrap();
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();

        assert!(pos("db") < pos("web"));
        assert!(pos("db") < pos("worker"));
        assert!(pos("web") < pos("worker"));
    }

    #[test]
    fn resolve_is_deterministic() {
        let services = services(
            r#"
name: demo
services:
  a:
    command: sleep 1
  b:
    command: sleep 1
  c:
    command: sleep 1
"#,
        );

        let subset = names(&["c", "a", "b"]);
        let first = resolve(&services, &subset).unwrap();
        let second = resolve(&services, &subset).unwrap();
        assert_eq!(first, second);
        // Independent services fall back to name order
        assert_eq!(first, names(&["a", "b", "c"]));
    }

    #[test]
    fn deps_outside_subset_are_ignored() {
        let services = services(
            r#"
name: demo
services:
  web:
    command: node server.js
    depends_on: [db]
  db:
    command: postgres
"#,
        );

        // db was not requested: treated as already satisfied
        let order = resolve(&services, &names(&["web"])).unwrap();
        assert_eq!(order, names(&["web"]));
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let services = services(
            r#"
name: demo
services:
  a:
    command: sleep 1
    depends_on: [b]
  b:
    command: sleep 1
    depends_on: [c]
  c:
    command: sleep 1
    depends_on: [a]
"#,
        );

        let err = resolve(&services, &names(&["a", "b", "c"])).unwrap_err();
        match err {
            ResolveError::CircularDependency { cycle } => {
                // Closed walk: first and last entries match
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.len() >= 4);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_outside_subset_does_not_matter() {
        let services = services(
            r#"
name: demo
services:
  a:
    command: sleep 1
    depends_on: [b]
  b:
    command: sleep 1
    depends_on: [a]
  lone:
    command: sleep 1
"#,
        );

        // The a<->b cycle is not part of the request
        let order = resolve(&services, &names(&["lone"])).unwrap();
        assert_eq!(order, names(&["lone"]));
    }

    #[test]
    fn unknown_service_rejected() {
        let services = services(
            r#"
name: demo
services:
  a:
    command: sleep 1
"#,
        );

        let err = resolve(&services, &names(&["a", "ghost"])).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownService {
                name: "ghost".into()
            }
        );
    }

    #[test]
    fn shutdown_order_is_reversed() {
        let services = services(
            r#"
name: demo
services:
  web:
    command: node server.js
    depends_on: [db]
  db:
    command: postgres
"#,
        );

        let subset = names(&["web", "db"]);
        assert_eq!(resolve(&services, &subset).unwrap(), names(&["db", "web"]));
        assert_eq!(
            shutdown_order(&services, &subset).unwrap(),
            names(&["web", "db"])
        );
    }
}
