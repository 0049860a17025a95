//! Tiered install order.
//!
//! Kahn's algorithm over declared dependencies. Ties are broken by catalog
//! order so the plan is deterministic; a component's tier is the length of
//! its longest dependency chain.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::core::errors::{DvsError, Result};
use crate::registry::Registry;

/// Ordered tiers of component names. Every dependency of a component sits
/// in a strictly earlier tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub tiers: Vec<Vec<String>>,
}

impl Plan {
    /// Plan `only` (plus transitive dependencies), or the whole registry.
    pub fn build(registry: &Registry, only: Option<&[String]>) -> Result<Self> {
        let components = registry.components();
        let index: HashMap<&str, usize> = components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();

        let selected: BTreeSet<usize> = match only {
            None => (0..components.len()).collect(),
            Some(names) => closure(registry, &index, names)?,
        };

        let mut indegree: HashMap<usize, usize> = HashMap::new();
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &selected {
            let deps = &components[i].depends_on;
            indegree.insert(i, deps.len());
            for dep in deps {
                let Some(&d) = index.get(dep.as_str()) else {
                    return Err(DvsError::InvalidRegistry {
                        details: format!(
                            "{} depends on unknown component {dep:?}",
                            components[i].name
                        ),
                    });
                };
                dependents.entry(d).or_default().push(i);
            }
        }

        let mut tiers = Vec::new();
        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(i, _)| *i)
            .collect();
        let mut placed = 0;
        while !ready.is_empty() {
            let tier: Vec<usize> = ready.iter().copied().collect();
            ready.clear();
            for &i in &tier {
                for &dependent in dependents.get(&i).map_or(&[][..], Vec::as_slice) {
                    if let Some(n) = indegree.get_mut(&dependent) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
            placed += tier.len();
            tiers.push(tier.into_iter().map(|i| components[i].name.clone()).collect());
        }

        if placed != selected.len() {
            let stuck: Vec<&str> = selected
                .iter()
                .filter(|i| indegree.get(i).is_some_and(|n| *n > 0))
                .map(|&i| components[i].name.as_str())
                .collect();
            return Err(DvsError::InvalidRegistry {
                details: format!("dependency cycle among: {}", stuck.join(", ")),
            });
        }

        Ok(Self { tiers })
    }

    /// Flattened order.
    pub fn order(&self) -> impl Iterator<Item = &str> {
        self.tiers.iter().flatten().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.order().any(|n| n == name)
    }
}

/// Named components plus everything they transitively depend on.
fn closure(
    registry: &Registry,
    index: &HashMap<&str, usize>,
    names: &[String],
) -> Result<BTreeSet<usize>> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<&str> = Vec::new();
    for name in names {
        if !index.contains_key(name.as_str()) {
            return Err(DvsError::InvalidConfig {
                details: format!("unknown component {name:?}"),
            });
        }
        stack.push(name);
    }
    while let Some(name) = stack.pop() {
        let Some(&i) = index.get(name) else {
            return Err(DvsError::InvalidRegistry {
                details: format!("unknown dependency {name:?}"),
            });
        };
        if !out.insert(i) {
            continue;
        }
        for dep in &registry.components()[i].depends_on {
            stack.push(dep);
        }
    }
    Ok(out)
}
