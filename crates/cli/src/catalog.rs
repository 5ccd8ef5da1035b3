use crate::config::{PipelineDefinition, StepDeclaration};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use strata_core::steps::{CopyTransform, FileMapStep, SplitDatasetStep};
use strata_core::workflow::{ItemPool, ItemTransform, Pipeline, PipelineStep};
use strata_core::Settings;

fn transform_for(declaration: &StepDeclaration) -> Result<Arc<dyn ItemTransform>> {
    match declaration.transform.as_deref().unwrap_or("copy") {
        "copy" => Ok(Arc::new(CopyTransform)),
        other => bail!("Unknown transform {} for step {}", other, declaration.name),
    }
}

/// Instantiate the implementation a declaration asks for
pub fn build_step(declaration: &StepDeclaration, settings: &Settings) -> Result<Arc<dyn PipelineStep>> {
    let step: Arc<dyn PipelineStep> = match declaration.kind.as_str() {
        "file_map" => {
            let mut step = FileMapStep::new(
                declaration.name.clone(),
                declaration.input_dir.clone(),
                declaration.output_dir.clone(),
                transform_for(declaration)?,
                ItemPool::from_settings(settings),
            );
            if let Some(extension) = &declaration.extension {
                step = step.with_extension(extension.clone());
            }
            if let Some(kind) = declaration.run_kind {
                step = step.with_kind(kind);
            }
            Arc::new(step)
        }
        "split_dataset" => {
            let mut step = SplitDatasetStep::new(
                declaration.name.clone(),
                declaration.input_dir.clone(),
                declaration.output_dir.clone(),
            );
            if let Some(extension) = &declaration.extension {
                step = step.with_extension(extension.clone());
            }
            Arc::new(step)
        }
        other => bail!("Unknown step kind {} for step {}", other, declaration.name),
    };
    Ok(step)
}

pub fn build_pipeline(definition: &PipelineDefinition, settings: &Settings) -> Result<Pipeline> {
    let declarations = definition
        .steps
        .iter()
        .map(|declaration| Ok((declaration.spec(), build_step(declaration, settings)?)))
        .collect::<Result<Vec<_>>>()?;

    Pipeline::from_declarations(definition.name.clone(), definition.version.clone(), declarations)
        .context("Invalid pipeline definition")
}
