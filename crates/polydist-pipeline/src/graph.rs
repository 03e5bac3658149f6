use crate::PipelineError;
use polydist_plugin::{Phase, PluginOptions, RegisteredPlugin, ResolvedPlugin};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{self, Write as _};

/// `distribution:pluginId:phase`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(distribution: &str, plugin_id: &str, phase: Phase) -> Self {
        Self(format!("{distribution}:{plugin_id}:{phase}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for OperationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// One schedulable unit: a plugin running one phase for one distribution.
#[derive(Clone, Debug)]
pub struct Operation {
    pub id: OperationId,
    pub plugin: RegisteredPlugin,
    pub phase: Phase,
    pub distribution: String,
    pub options: PluginOptions,
}

impl Operation {
    pub fn new(resolved: &ResolvedPlugin, phase: Phase) -> Self {
        Self {
            id: OperationId::new(&resolved.distribution, resolved.plugin.id(), phase),
            plugin: resolved.plugin.clone(),
            phase,
            distribution: resolved.distribution.clone(),
            options: resolved.options.clone(),
        }
    }

    pub fn plugin_id(&self) -> &str {
        self.plugin.id()
    }
}

/// Operations that may run concurrently, as indices into the graph arena.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionWave {
    pub index: usize,
    pub operations: Vec<usize>,
}

impl ExecutionWave {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Acyclic operation graph grouped into ordered waves.
///
/// Operations live in an arena and are addressed by index; dependency lists
/// hold the indices each operation waits on.
#[derive(Clone, Debug, Default)]
pub struct ExecutionGraph {
    operations: Vec<Operation>,
    dependencies: Vec<Vec<usize>>,
    waves: Vec<ExecutionWave>,
    wave_of: Vec<usize>,
    index: HashMap<OperationId, usize>,
    has_cycles: bool,
}

impl ExecutionGraph {
    pub fn empty() -> Self {
        Self::default()
    }

    pub(crate) fn from_parts(
        operations: Vec<Operation>,
        dependencies: Vec<Vec<usize>>,
        waves: Vec<ExecutionWave>,
    ) -> Self {
        let mut wave_of = vec![0; operations.len()];
        for wave in &waves {
            for &operation in &wave.operations {
                wave_of[operation] = wave.index;
            }
        }
        let index = operations
            .iter()
            .enumerate()
            .map(|(position, operation)| (operation.id.clone(), position))
            .collect();
        Self {
            operations,
            dependencies,
            waves,
            wave_of,
            index,
            has_cycles: false,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn operation_by_id(&self, id: &str) -> Option<&Operation> {
        self.index_of(id).map(|index| &self.operations[index])
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn waves(&self) -> &[ExecutionWave] {
        &self.waves
    }

    pub fn wave_operations<'a>(
        &'a self,
        wave: &'a ExecutionWave,
    ) -> impl Iterator<Item = &'a Operation> + 'a {
        wave.operations
            .iter()
            .map(move |index| &self.operations[*index])
    }

    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.index_of(id).map(|index| self.wave_of[index])
    }

    pub fn total_operations(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn has_cycles(&self) -> bool {
        self.has_cycles
    }

    pub fn dependencies_of(&self, index: usize) -> &[usize] {
        self.dependencies
            .get(index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Dependency edges keyed by operation id, one entry per operation.
    pub fn edges(&self) -> BTreeMap<OperationId, Vec<OperationId>> {
        self.operations
            .iter()
            .zip(&self.dependencies)
            .map(|(operation, dependencies)| {
                (
                    operation.id.clone(),
                    dependencies
                        .iter()
                        .map(|dependency| self.operations[*dependency].id.clone())
                        .collect(),
                )
            })
            .collect()
    }

    pub fn operations_by_phase(&self, phase: Phase) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|operation| operation.phase == phase)
            .collect()
    }

    pub fn operations_by_distribution(&self, distribution: &str) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|operation| operation.distribution == distribution)
            .collect()
    }

    /// Distribution names in order of first appearance.
    pub fn distributions(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.operations
            .iter()
            .filter(|operation| seen.insert(operation.distribution.as_str()))
            .map(|operation| operation.distribution.clone())
            .collect()
    }

    /// Keeps only operations in `phases`. Waves keep their relative order,
    /// empty waves are dropped and the rest re-indexed from zero.
    pub fn filter_phases(&self, phases: &[Phase]) -> ExecutionGraph {
        let mut remap = vec![None; self.operations.len()];
        let mut operations = Vec::new();
        for (index, operation) in self.operations.iter().enumerate() {
            if phases.contains(&operation.phase) {
                remap[index] = Some(operations.len());
                operations.push(operation.clone());
            }
        }

        let dependencies = self
            .dependencies
            .iter()
            .enumerate()
            .filter(|(index, _)| remap[*index].is_some())
            .map(|(_, dependencies)| {
                dependencies
                    .iter()
                    .filter_map(|dependency| remap[*dependency])
                    .collect()
            })
            .collect();

        let waves = self
            .waves
            .iter()
            .map(|wave| {
                wave.operations
                    .iter()
                    .filter_map(|operation| remap[*operation])
                    .collect::<Vec<_>>()
            })
            .filter(|operations| !operations.is_empty())
            .enumerate()
            .map(|(index, operations)| ExecutionWave { index, operations })
            .collect();

        ExecutionGraph::from_parts(operations, dependencies, waves)
    }

    /// Combines independently built graphs into one schedule. Operations with
    /// the same id are unified and their dependencies unioned; waves are
    /// recomputed over the combined edge set.
    pub fn merge(graphs: &[ExecutionGraph]) -> Result<ExecutionGraph, PipelineError> {
        match graphs {
            [] => return Ok(ExecutionGraph::empty()),
            [single] => return Ok(single.clone()),
            _ => {}
        }

        let mut operations: Vec<Operation> = Vec::new();
        let mut dependencies: Vec<BTreeSet<usize>> = Vec::new();
        let mut index: HashMap<OperationId, usize> = HashMap::new();
        for graph in graphs {
            let local: Vec<usize> = graph
                .operations
                .iter()
                .map(|operation| {
                    *index.entry(operation.id.clone()).or_insert_with(|| {
                        operations.push(operation.clone());
                        dependencies.push(BTreeSet::new());
                        operations.len() - 1
                    })
                })
                .collect();
            for (position, edges) in graph.dependencies.iter().enumerate() {
                dependencies[local[position]].extend(edges.iter().map(|edge| local[*edge]));
            }
        }

        crate::builder::assemble(operations, dependencies)
    }

    /// Multi-line description of the waves and each operation's dependencies.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "execution graph: {} operation(s) in {} wave(s)",
            self.total_operations(),
            self.waves.len()
        );
        for wave in &self.waves {
            let _ = writeln!(out, "wave {} ({} operation(s)):", wave.index, wave.len());
            for &index in &wave.operations {
                let operation = &self.operations[index];
                let dependencies = &self.dependencies[index];
                if dependencies.is_empty() {
                    let _ = writeln!(out, "  {}", operation.id);
                } else {
                    let names: Vec<&str> = dependencies
                        .iter()
                        .map(|dependency| self.operations[*dependency].id.as_str())
                        .collect();
                    let _ = writeln!(out, "  {} <- {}", operation.id, names.join(", "));
                }
            }
        }
        out
    }
}
