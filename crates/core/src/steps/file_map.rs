use crate::types::StepKind;
use crate::workflow::items::{ItemPool, ItemTransform};
use crate::workflow::step::{list_files, PipelineStep, ProcessOutcome, StepContext};
use anyhow::Context;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Applies an [`ItemTransform`] to every input file with a matching extension
pub struct FileMapStep {
    name: String,
    kind: StepKind,
    input_dir: PathBuf,
    output_dir: PathBuf,
    extension: Option<String>,
    transform: Arc<dyn ItemTransform>,
    pool: ItemPool,
}

impl FileMapStep {
    pub fn new(
        name: impl Into<String>,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        transform: Arc<dyn ItemTransform>,
        pool: ItemPool,
    ) -> Self {
        Self {
            name: name.into(),
            kind: StepKind::DataProcessing,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            extension: None,
            transform,
            pool,
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_kind(mut self, kind: StepKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait::async_trait]
impl PipelineStep for FileMapStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StepKind {
        self.kind
    }

    fn input_directory(&self) -> PathBuf {
        self.input_dir.clone()
    }

    fn output_directory(&self) -> PathBuf {
        self.output_dir.clone()
    }

    fn input_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        list_files(&self.input_dir, self.extension.as_deref())
    }

    async fn process(&self, ctx: &StepContext) -> anyhow::Result<ProcessOutcome> {
        let files = self.input_files()?;
        tracing::debug!(step = %self.name, files = files.len(), "Mapping input files");

        let items = self
            .pool
            .run(
                files,
                ctx.output_dir.clone(),
                ctx.step_params().await,
                self.transform.clone(),
            )
            .await;
        Ok(ProcessOutcome::new(items))
    }

    async fn upload_artifacts(&self, ctx: &StepContext, outcome: &ProcessOutcome) -> anyhow::Result<()> {
        let processed: BTreeSet<String> = outcome.processed().map(|p| p.item.clone()).collect();
        let errors: BTreeSet<String> = outcome
            .item_ids()
            .into_iter()
            .filter(|id| !processed.contains(id))
            .collect();

        ctx.record_json_artifact("processed_objects", &json!({ "processed_objects": processed }))
            .await?;
        ctx.record_json_artifact("processing_errors", &json!({ "processing_errors": errors }))
            .await?;
        Ok(())
    }
}

/// Copies each input file unchanged into the output directory
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyTransform;

impl ItemTransform for CopyTransform {
    fn transform(
        &self,
        input: &Path,
        output_dir: &Path,
        _params: &Map<String, Value>,
    ) -> anyhow::Result<Vec<PathBuf>> {
        let file_name = input
            .file_name()
            .with_context(|| format!("{} has no file name", input.display()))?;
        let target = output_dir.join(file_name);
        std::fs::copy(input, &target)
            .with_context(|| format!("Failed to copy {}", input.display()))?;
        Ok(vec![target])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::lifecycle::tests::lifecycle_in;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Copies files, rejecting rows marked as corrupt
    struct RejectCorrupt;

    impl ItemTransform for RejectCorrupt {
        fn transform(
            &self,
            input: &Path,
            output_dir: &Path,
            params: &Map<String, Value>,
        ) -> anyhow::Result<Vec<PathBuf>> {
            let marker = params
                .get("corrupt_marker")
                .and_then(Value::as_str)
                .unwrap_or("corrupt");
            let content = std::fs::read_to_string(input)?;
            if content.contains(marker) {
                anyhow::bail!("row marked {}", marker);
            }
            CopyTransform.transform(input, output_dir, params)
        }
    }

    async fn artifact_json(
        lifecycle: &crate::workflow::lifecycle::StepLifecycle,
        run_id: &crate::types::RunId,
        name: &str,
    ) -> Value {
        let payload = lifecycle
            .registry()
            .artifact(run_id, name)
            .await
            .unwrap()
            .unwrap();
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_one_failing_file_of_five() {
        let temp_dir = TempDir::new().unwrap();
        let lifecycle = lifecycle_in(temp_dir.path());

        let input_dir = temp_dir.path().join("raw");
        std::fs::create_dir_all(&input_dir).unwrap();
        for (name, content) in [
            ("well 1.csv", "ok"),
            ("well 2.csv", "ok"),
            ("well 3.csv", "corrupt"),
            ("well 4.csv", "ok"),
            ("well 5.csv", "ok"),
            ("notes.txt", "ignored"),
        ] {
            std::fs::write(input_dir.join(name), content).unwrap();
        }

        let step = FileMapStep::new(
            "preprocess",
            &input_dir,
            temp_dir.path().join("processed"),
            Arc::new(RejectCorrupt),
            ItemPool::new(2, Duration::from_secs(30)),
        )
        .with_extension("csv");

        let report = lifecycle.execute(&step, &[]).await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.failures.len(), 1);

        let output = lifecycle.datasets().get_by_id(&report.output).await.unwrap();
        assert_eq!(output.files.len(), 4);
        assert!(!output.files.contains_key("well 3.csv"));

        let errors = artifact_json(&lifecycle, &report.run_id, "processing_errors").await;
        assert_eq!(errors, json!({ "processing_errors": ["WELL3"] }));

        let processed = artifact_json(&lifecycle, &report.run_id, "processed_objects").await;
        assert_eq!(
            processed,
            json!({ "processed_objects": ["WELL1", "WELL2", "WELL4", "WELL5"] })
        );
    }

    #[test]
    fn test_copy_transform() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("a.csv");
        std::fs::write(&input, "x,y").unwrap();
        let out = temp_dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();

        let written = CopyTransform.transform(&input, &out, &Map::new()).unwrap();
        assert_eq!(written, vec![out.join("a.csv")]);
        assert_eq!(std::fs::read_to_string(out.join("a.csv")).unwrap(), "x,y");
    }
}
