use crate::{Operation, PipelineError};
use polydist_plugin::{
    BuildContext, DistributionConfig, Phase, PhaseContext, ProjectConfig, ReleaseContext,
    SetupContext, TemplateVariables,
};

/// Produces the phase context an operation's handler receives.
pub trait ContextFactory: Send + Sync {
    fn build_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<BuildContext, PipelineError>;

    fn setup_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<SetupContext, PipelineError>;

    fn release_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<ReleaseContext, PipelineError>;

    fn context_for(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<PhaseContext, PipelineError> {
        match operation.phase {
            Phase::Preprocess | Phase::Transform | Phase::Postprocess => self
                .build_context(operation, distribution)
                .map(PhaseContext::Build),
            Phase::Setup => self
                .setup_context(operation, distribution)
                .map(PhaseContext::Setup),
            Phase::Release => self
                .release_context(operation, distribution)
                .map(PhaseContext::Release),
        }
    }
}

/// Builds contexts from the project configuration.
#[derive(Clone, Debug, Default)]
pub struct ProjectContextFactory {
    project: ProjectConfig,
}

impl ProjectContextFactory {
    pub fn new(project: ProjectConfig) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    /// Project variables, overridden by distribution variables, overridden by
    /// the built-ins `distribution`, `runtime` and `phase`.
    fn variables(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> TemplateVariables {
        let mut variables = self.project.variables.clone();
        variables.extend(
            distribution
                .variables
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        variables.insert("distribution".to_string(), operation.distribution.clone());
        variables.insert("runtime".to_string(), distribution.runtime.clone());
        variables.insert("phase".to_string(), operation.phase.to_string());
        variables
    }
}

impl ContextFactory for ProjectContextFactory {
    fn build_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<BuildContext, PipelineError> {
        Ok(BuildContext {
            distribution: operation.distribution.clone(),
            runtime: distribution.runtime.clone(),
            phase: operation.phase,
            root_dir: self.project.root_dir.clone(),
            source_dir: self.project.source_path(),
            output_dir: self.project.output_path(&operation.distribution),
            options: operation.options.clone(),
            variables: self.variables(operation, distribution),
            dry_run: self.project.dry_run,
        })
    }

    fn setup_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<SetupContext, PipelineError> {
        Ok(SetupContext {
            distribution: operation.distribution.clone(),
            runtime: distribution.runtime.clone(),
            root_dir: self.project.root_dir.clone(),
            options: operation.options.clone(),
            variables: self.variables(operation, distribution),
            dry_run: self.project.dry_run,
        })
    }

    fn release_context(
        &self,
        operation: &Operation,
        distribution: &DistributionConfig,
    ) -> Result<ReleaseContext, PipelineError> {
        Ok(ReleaseContext {
            distribution: operation.distribution.clone(),
            runtime: distribution.runtime.clone(),
            root_dir: self.project.root_dir.clone(),
            output_dir: self.project.output_path(&operation.distribution),
            versions: distribution.versions.clone(),
            options: operation.options.clone(),
            variables: self.variables(operation, distribution),
            dry_run: self.project.dry_run,
        })
    }
}
