use std::collections::{BTreeMap, BTreeSet};

use crate::error::EtlError;

/// In-memory dependency DAG over the selected job set. Edges point
/// `dependency -> dependent`.
#[derive(Debug, Clone)]
pub struct JobGraph {
    dependents: BTreeMap<i64, BTreeSet<i64>>,
    indegree: BTreeMap<i64, usize>,
}

impl JobGraph {
    /// Build and validate the graph. Every referenced dependency must exist
    /// in the selected set.
    pub fn build(jobs: &[(i64, Vec<i64>)]) -> Result<Self, EtlError> {
        let ids: BTreeSet<i64> = jobs.iter().map(|(id, _)| *id).collect();

        let mut dependents: BTreeMap<i64, BTreeSet<i64>> =
            ids.iter().map(|id| (*id, BTreeSet::new())).collect();
        let mut indegree: BTreeMap<i64, usize> = ids.iter().map(|id| (*id, 0)).collect();

        for (id, depends_on) in jobs {
            for dep in depends_on {
                if !ids.contains(dep) {
                    return Err(EtlError::DependencyMissing(*dep));
                }
                if dependents.get_mut(dep).unwrap().insert(*id) {
                    *indegree.get_mut(id).unwrap() += 1;
                }
            }
        }

        Ok(Self {
            dependents,
            indegree,
        })
    }

    /// Level-grouped topological batches via Kahn's algorithm: each batch is
    /// the set of nodes whose in-degree drops to zero at the same step, so
    /// everything in one batch may run in parallel. A cycle leaves residual
    /// nodes, which are returned as evidence.
    pub fn topological_batches(&self) -> Result<Vec<Vec<i64>>, EtlError> {
        let mut indegree = self.indegree.clone();
        let mut batches: Vec<Vec<i64>> = Vec::new();
        let mut ready: Vec<i64> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut processed = 0usize;

        while !ready.is_empty() {
            ready.sort_unstable();
            let batch = std::mem::take(&mut ready);

            for id in &batch {
                processed += 1;
                for dependent in &self.dependents[id] {
                    let d = indegree.get_mut(dependent).unwrap();
                    *d -= 1;
                    if *d == 0 {
                        ready.push(*dependent);
                    }
                }
            }

            batches.push(batch);
        }

        if processed != self.indegree.len() {
            let residual: Vec<i64> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(id, _)| *id)
                .collect();
            return Err(EtlError::DependencyCycle(residual));
        }

        Ok(batches)
    }

    /// Every job reachable downstream of `roots`, excluding the roots
    /// themselves. These are the jobs to skip when a root fails.
    pub fn transitive_dependents(&self, roots: &[i64]) -> BTreeSet<i64> {
        let mut seen: BTreeSet<i64> = BTreeSet::new();
        let mut stack: Vec<i64> = roots.to_vec();

        while let Some(id) = stack.pop() {
            if let Some(children) = self.dependents.get(&id) {
                for child in children {
                    if seen.insert(*child) {
                        stack.push(*child);
                    }
                }
            }
        }

        seen
    }
}
