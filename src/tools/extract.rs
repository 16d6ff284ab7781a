//! `extract_all_texts`: statement files into the reference store

use crate::error::OrchestrationError;
use crate::extraction;
use crate::models::ToolInput;
use crate::state::StatePatch;
use crate::tools::{optional_str, Tool, ToolContext, ToolOutput};
use crate::Result;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;

/// Read statement files and park their text in the reference store.
pub struct ExtractAllTextsTool;

#[async_trait::async_trait]
impl Tool for ExtractAllTextsTool {
    fn name(&self) -> &'static str {
        "extract_all_texts"
    }

    fn description(&self) -> &'static str {
        "Extract the text of every bank statement file in a folder (or a single file). \
         Defaults to the configured input folder. Returns text_refs, one per statement unit."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "OBJECT",
            "properties": {
                "folder": {
                    "type": "STRING",
                    "description": "Folder or file path; omit to use the configured input folder"
                }
            }
        })
    }

    async fn execute(&self, input: &ToolInput, ctx: &ToolContext) -> Result<ToolOutput> {
        let path = optional_str(input, "folder")
            .map(PathBuf::from)
            .or_else(|| ctx.task.input_folder.clone())
            .ok_or_else(|| {
                OrchestrationError::InvalidToolInput(
                    "no folder given and no input folder configured".to_string(),
                )
            })?;

        let units = extraction::extract_path(&path).await?;
        let capacity = ctx.refs.capacity();
        if units.len() > capacity {
            return Err(OrchestrationError::ExtractionError(format!(
                "'{}' produced {} statement units but the reference store holds at most {}; \
                 process fewer files at a time or raise REF_STORE_CAPACITY",
                path.display(),
                units.len(),
                capacity
            )));
        }

        let mut files: Vec<String> = Vec::new();
        let mut text_refs = Vec::with_capacity(units.len());
        for unit in units {
            if files.last() != Some(&unit.file_name) {
                files.push(unit.file_name.clone());
            }
            text_refs.push(ctx.refs.put(unit).await);
        }

        info!(path = %path.display(), units = text_refs.len(), "Statement text stored");

        Ok(ToolOutput::new(json!({
            "text_refs": text_refs,
            "count": text_refs.len(),
            "files": files,
        }))
        .with_patch(StatePatch {
            text_refs: Some(text_refs),
            ..StatePatch::default()
        }))
    }
}
