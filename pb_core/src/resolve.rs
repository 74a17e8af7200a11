//! Batch ordering with Kahn's algorithm.
//!
//! Every requested root and its transitive dependencies are ordered so a
//! dependency always comes before its dependents. Packages that become ready
//! at the same time are taken alphabetically, so the order is deterministic.

use crate::{Error, Formula};
use std::collections::{BTreeMap, BTreeSet};

/// Order `roots` and their dependency closure for installation.
///
/// # Errors
/// - `MissingFormula` if a root is absent from `formulas`
/// - `DependencyCycle` if the closure cannot be fully ordered
pub fn resolve_batch(
    roots: &[String],
    formulas: &BTreeMap<String, Formula>,
) -> Result<Vec<String>, Error> {
    let closure = closure(roots, formulas)?;

    let mut pending: BTreeMap<&str, usize> = closure.iter().map(|n| (n.as_str(), 0)).collect();
    let mut dependents: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();

    for name in &closure {
        let Some(formula) = formulas.get(name) else {
            continue;
        };
        for dep in formula.dependencies.iter().filter(|d| closure.contains(*d)) {
            if let Some(count) = pending.get_mut(name.as_str()) {
                *count += 1;
            }
            dependents
                .entry(dep.as_str())
                .or_default()
                .insert(name.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut ordered = Vec::with_capacity(closure.len());
    while let Some(name) = ready.pop_first() {
        ordered.push(name.to_string());
        for child in dependents.get(name).into_iter().flatten() {
            if let Some(count) = pending.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*child);
                }
            }
        }
    }

    if ordered.len() != closure.len() {
        let cycle = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(name, _)| name.to_string())
            .collect();
        return Err(Error::DependencyCycle { cycle });
    }

    Ok(ordered)
}

/// Dependencies with no formula available are dropped rather than failing the batch.
fn closure(
    roots: &[String],
    formulas: &BTreeMap<String, Formula>,
) -> Result<BTreeSet<String>, Error> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<String> = roots.to_vec();

    for root in roots {
        if !formulas.contains_key(root) {
            return Err(Error::MissingFormula { name: root.clone() });
        }
    }

    while let Some(name) = stack.pop() {
        let Some(formula) = formulas.get(&name) else {
            continue;
        };
        if !seen.insert(name) {
            continue;
        }
        stack.extend(
            formula
                .dependencies
                .iter()
                .filter(|dep| !seen.contains(*dep))
                .cloned(),
        );
    }

    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Versions;

    fn formula(name: &str, deps: &[&str]) -> Formula {
        Formula {
            name: name.to_string(),
            versions: Versions {
                stable: "1.0.0".to_string(),
            },
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            ..Default::default()
        }
    }

    fn index(list: &[Formula]) -> BTreeMap<String, Formula> {
        list.iter().map(|f| (f.name.clone(), f.clone())).collect()
    }

    fn roots(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn orders_transitive_closure_deterministically() {
        let formulas = index(&[
            formula("foo", &["baz", "bar"]),
            formula("bar", &["qux"]),
            formula("baz", &["qux"]),
            formula("qux", &[]),
        ]);

        let order = resolve_batch(&roots(&["foo"]), &formulas).unwrap();
        assert_eq!(order, vec!["qux", "bar", "baz", "foo"]);
    }

    #[test]
    fn shares_dependencies_between_roots() {
        let formulas = index(&[
            formula("wget", &["openssl"]),
            formula("curl", &["openssl"]),
            formula("openssl", &[]),
        ]);

        let order = resolve_batch(&roots(&["wget", "curl"]), &formulas).unwrap();
        assert_eq!(order, vec!["openssl", "curl", "wget"]);
    }

    #[test]
    fn skips_missing_dependencies() {
        let formulas = index(&[formula("foo", &["ghost"])]);
        let order = resolve_batch(&roots(&["foo"]), &formulas).unwrap();
        assert_eq!(order, vec!["foo"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let err = resolve_batch(&roots(&["nope"]), &BTreeMap::new()).unwrap_err();
        assert_eq!(
            err,
            Error::MissingFormula {
                name: "nope".to_string()
            }
        );
    }

    #[test]
    fn detects_cycles() {
        let formulas = index(&[
            formula("alpha", &["beta"]),
            formula("beta", &["gamma"]),
            formula("gamma", &["alpha"]),
        ]);

        let err = resolve_batch(&roots(&["alpha"]), &formulas).unwrap_err();
        match err {
            Error::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["alpha", "beta", "gamma"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
