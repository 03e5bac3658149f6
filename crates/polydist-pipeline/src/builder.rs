use crate::{ExecutionGraph, ExecutionWave, Operation, OperationId, PipelineError};
use polydist_plugin::{Phase, ResolvedPlugin};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, trace};

/// Which distributions and phases a graph should cover.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphRequest {
    /// `None` includes every distribution present in the resolved plugins.
    pub distributions: Option<Vec<String>>,
    pub phases: BTreeSet<Phase>,
}

impl Default for GraphRequest {
    fn default() -> Self {
        Self::build()
    }
}

impl GraphRequest {
    pub fn build() -> Self {
        Self {
            distributions: None,
            phases: Phase::BUILD.into_iter().collect(),
        }
    }

    pub fn setup() -> Self {
        Self::phases([Phase::Setup])
    }

    /// Release gates on the build phases, so they are always included.
    pub fn release() -> Self {
        Self::build().with_phase(Phase::Release)
    }

    pub fn all() -> Self {
        Self::phases(Phase::ALL)
    }

    pub fn phases(phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            distributions: None,
            phases: phases.into_iter().collect(),
        }
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phases.insert(phase);
        self
    }

    pub fn for_distributions<I, S>(mut self, distributions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.distributions = Some(distributions.into_iter().map(Into::into).collect());
        self
    }

    pub fn includes_distribution(&self, distribution: &str) -> bool {
        self.distributions
            .as_ref()
            .is_none_or(|names| names.iter().any(|name| name == distribution))
    }

    pub fn includes_phase(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Expands resolved plugins into an [`ExecutionGraph`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        plugins: &[ResolvedPlugin],
        request: &GraphRequest,
    ) -> Result<ExecutionGraph, PipelineError> {
        let operations = create_operations(plugins, request)?;
        let dependencies = connect(&operations);
        let graph = assemble(operations, dependencies)?;
        debug!(
            operations = graph.total_operations(),
            waves = graph.waves().len(),
            "built execution graph"
        );
        Ok(graph)
    }
}

fn create_operations(
    plugins: &[ResolvedPlugin],
    request: &GraphRequest,
) -> Result<Vec<Operation>, PipelineError> {
    let mut operations = Vec::new();
    let mut seen = BTreeSet::new();
    for resolved in plugins {
        if !request.includes_distribution(&resolved.distribution) {
            continue;
        }
        for &phase in resolved.plugin.phases() {
            if !request.includes_phase(phase) {
                continue;
            }
            let operation = Operation::new(resolved, phase);
            if !seen.insert(operation.id.clone()) {
                return Err(PipelineError::DuplicateOperation(operation.id.to_string()));
            }
            operations.push(operation);
        }
    }
    Ok(operations)
}

fn group_of<'a>(
    groups: &'a BTreeMap<(&'a str, Phase), Vec<usize>>,
    distribution: &'a str,
    phase: Phase,
) -> &'a [usize] {
    groups
        .get(&(distribution, phase))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn connect(operations: &[Operation]) -> Vec<BTreeSet<usize>> {
    let mut dependencies = vec![BTreeSet::new(); operations.len()];

    // Operation indices per (distribution, phase), in declaration order.
    let mut groups: BTreeMap<(&str, Phase), Vec<usize>> = BTreeMap::new();
    for (index, operation) in operations.iter().enumerate() {
        groups
            .entry((operation.distribution.as_str(), operation.phase))
            .or_default()
            .push(index);
    }
    let distributions: BTreeSet<&str> = groups.keys().map(|(name, _)| *name).collect();

    for &distribution in &distributions {
        // Phase barriers. An empty transform group is skipped over so
        // postprocess still waits for preprocess.
        let mut previous = group_of(&groups, distribution, Phase::Preprocess);
        for phase in [Phase::Transform, Phase::Postprocess] {
            let current = group_of(&groups, distribution, phase);
            for &operation in current {
                dependencies[operation].extend(previous.iter().copied());
            }
            if !current.is_empty() {
                previous = current;
            }
        }

        let build: Vec<usize> = Phase::BUILD
            .into_iter()
            .flat_map(|phase| group_of(&groups, distribution, phase).iter().copied())
            .collect();
        for &operation in group_of(&groups, distribution, Phase::Release) {
            dependencies[operation].extend(build.iter().copied());
        }
    }

    let index: HashMap<&OperationId, usize> = operations
        .iter()
        .enumerate()
        .map(|(position, operation)| (&operation.id, position))
        .collect();
    for (position, operation) in operations.iter().enumerate() {
        for dependency in operation.plugin.dependencies() {
            let target = OperationId::new(&operation.distribution, dependency, operation.phase);
            match index.get(&target) {
                Some(&target) => {
                    dependencies[position].insert(target);
                }
                None => trace!(
                    operation = %operation.id,
                    dependency = %target,
                    "declared dependency not in graph, ignoring"
                ),
            }
        }
    }

    // A sequential plugin waits for its immediate predecessor in the phase
    // only when that predecessor is sequential too.
    for members in groups.values() {
        for pair in members.windows(2) {
            let (previous, current) = (pair[0], pair[1]);
            if !operations[current].plugin.can_parallelize()
                && !operations[previous].plugin.can_parallelize()
            {
                dependencies[current].insert(previous);
            }
        }
    }

    dependencies
}

/// Validates the edge set and groups operations into waves.
pub(crate) fn assemble(
    operations: Vec<Operation>,
    dependencies: Vec<BTreeSet<usize>>,
) -> Result<ExecutionGraph, PipelineError> {
    let dependencies: Vec<Vec<usize>> = dependencies
        .into_iter()
        .map(|edges| edges.into_iter().collect())
        .collect();

    if let Some(cycle) = find_cycle(&dependencies) {
        return Err(PipelineError::Cycle {
            path: cycle
                .into_iter()
                .map(|index| operations[index].id.to_string())
                .collect(),
        });
    }

    let waves = compute_waves(&operations, &dependencies)?;
    Ok(ExecutionGraph::from_parts(operations, dependencies, waves))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

fn find_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    let mut stack = Vec::new();
    (0..dependencies.len()).find_map(|start| {
        if marks[start] == Mark::Unvisited {
            visit(start, dependencies, &mut marks, &mut stack)
        } else {
            None
        }
    })
}

fn visit(
    node: usize,
    dependencies: &[Vec<usize>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks[node] = Mark::OnStack;
    stack.push(node);
    for &next in &dependencies[node] {
        match marks[next] {
            Mark::OnStack => {
                let start = stack.iter().position(|&entry| entry == next)?;
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Mark::Unvisited => {
                if let Some(cycle) = visit(next, dependencies, marks, stack) {
                    return Some(cycle);
                }
            }
            Mark::Done => {}
        }
    }
    stack.pop();
    marks[node] = Mark::Done;
    None
}

fn compute_waves(
    operations: &[Operation],
    dependencies: &[Vec<usize>],
) -> Result<Vec<ExecutionWave>, PipelineError> {
    let mut in_degree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
    let mut dependents = vec![Vec::new(); operations.len()];
    for (operation, edges) in dependencies.iter().enumerate() {
        for &dependency in edges {
            dependents[dependency].push(operation);
        }
    }

    let mut processed = vec![false; operations.len()];
    let mut remaining = operations.len();
    let mut waves = Vec::new();
    while remaining > 0 {
        let ready: Vec<usize> = (0..operations.len())
            .filter(|&index| !processed[index] && in_degree[index] == 0)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = (0..operations.len())
                .filter(|&index| !processed[index])
                .map(|index| operations[index].id.as_str())
                .collect();
            return Err(PipelineError::WaveInvariant {
                remaining,
                detail: stuck.join(", "),
            });
        }
        for &index in &ready {
            processed[index] = true;
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
            }
        }
        remaining -= ready.len();
        waves.push(ExecutionWave {
            index: waves.len(),
            operations: ready,
        });
    }
    Ok(waves)
}
