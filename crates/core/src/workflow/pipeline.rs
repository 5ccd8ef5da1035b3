use crate::error::{PipelineError, PipelineResult};
use crate::types::StepSpec;
use crate::workflow::dag::PipelineDag;
use crate::workflow::step::PipelineStep;
use std::collections::HashMap;
use std::sync::Arc;

/// A named set of steps and the dependencies between them
pub struct Pipeline {
    pub name: String,
    pub version: String,
    dag: PipelineDag,
    steps: HashMap<String, Arc<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dag: PipelineDag::new(),
            steps: HashMap::new(),
        }
    }

    /// Register a step; parents must already be present
    pub fn add_step(&mut self, spec: StepSpec, step: Arc<dyn PipelineStep>) -> PipelineResult<()> {
        if spec.name != step.name() {
            return Err(PipelineError::Config(format!(
                "Step spec {} is bound to implementation {}",
                spec.name,
                step.name()
            )));
        }

        let name = spec.name.clone();
        self.dag.add_step(spec)?;
        self.steps.insert(name, step);
        Ok(())
    }

    /// Build a pipeline from declarations given in any order
    pub fn from_declarations(
        name: impl Into<String>,
        version: impl Into<String>,
        declarations: Vec<(StepSpec, Arc<dyn PipelineStep>)>,
    ) -> PipelineResult<Self> {
        let mut pipeline = Self::new(name, version);

        let mut seen: Vec<&str> = Vec::new();
        for (spec, _) in &declarations {
            if seen.contains(&spec.name.as_str()) {
                return Err(PipelineError::DuplicateStep(spec.name.clone()));
            }
            seen.push(&spec.name);
        }
        for (spec, _) in &declarations {
            if let Some(parent) = spec.parents.iter().find(|p| !seen.contains(&p.as_str())) {
                return Err(PipelineError::UnknownParent {
                    step: spec.name.clone(),
                    parent: parent.clone(),
                });
            }
        }

        let mut pending = declarations;
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|(spec, _)| spec.parents.iter().all(|p| pipeline.dag.contains(p)));

            if ready.is_empty() {
                // Every remaining step waits on another remaining step
                let step = blocked
                    .first()
                    .map(|(spec, _)| spec.name.clone())
                    .unwrap_or_default();
                return Err(PipelineError::PipelineCycle { step });
            }

            for (spec, step) in ready {
                pipeline.add_step(spec, step)?;
            }
            pending = blocked;
        }

        Ok(pipeline)
    }

    pub fn dag(&self) -> &PipelineDag {
        &self.dag
    }

    pub fn step(&self, name: &str) -> Option<Arc<dyn PipelineStep>> {
        self.steps.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.dag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::lifecycle::tests::ScriptedStep;
    use tempfile::TempDir;

    fn declare(root: &TempDir, name: &str, parents: &[&str]) -> (StepSpec, Arc<dyn PipelineStep>) {
        (
            StepSpec::new(name).with_parents(parents.iter().copied()),
            Arc::new(ScriptedStep::new(root.path(), name)),
        )
    }

    #[test]
    fn test_declarations_in_any_order() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = Pipeline::from_declarations(
            "demo",
            "1",
            vec![
                declare(&temp_dir, "split_dataset", &["feature_engineer"]),
                declare(&temp_dir, "feature_engineer", &["preprocess"]),
                declare(&temp_dir, "preprocess", &[]),
            ],
        )
        .unwrap();

        let order: Vec<String> = pipeline
            .dag()
            .topological_order()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(order, vec!["preprocess", "feature_engineer", "split_dataset"]);
        assert!(pipeline.step("feature_engineer").is_some());
    }

    #[test]
    fn test_cycle_rejected_regardless_of_order() {
        let temp_dir = TempDir::new().unwrap();
        let orders = [["a", "b", "c"], ["c", "b", "a"], ["b", "a", "c"]];
        for order in orders {
            let declarations = order
                .iter()
                .map(|name| match *name {
                    "a" => declare(&temp_dir, "a", &["c"]),
                    "b" => declare(&temp_dir, "b", &["a"]),
                    _ => declare(&temp_dir, "c", &["b"]),
                })
                .collect();
            let err = Pipeline::from_declarations("demo", "1", declarations).err().unwrap();
            assert!(matches!(err, PipelineError::PipelineCycle { .. }));
        }
    }

    #[test]
    fn test_unknown_parent_and_duplicates() {
        let temp_dir = TempDir::new().unwrap();
        let err = Pipeline::from_declarations(
            "demo",
            "1",
            vec![declare(&temp_dir, "train", &["split_dataset"])],
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::UnknownParent { .. }));

        let err = Pipeline::from_declarations(
            "demo",
            "1",
            vec![declare(&temp_dir, "a", &[]), declare(&temp_dir, "a", &[])],
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::DuplicateStep(_)));

        let mut pipeline = Pipeline::new("demo", "1");
        let (spec, _) = declare(&temp_dir, "a", &[]);
        let (_, other) = declare(&temp_dir, "b", &[]);
        assert!(matches!(
            pipeline.add_step(spec, other),
            Err(PipelineError::Config(_))
        ));
    }
}
