//! nftables backend
//!
//! hostwall owns one `inet` table. Dumps, loads and restores only ever touch
//! that table; other tables on the host are left alone.

use super::{Backend, require_tools, run_verify_commands};
use crate::core::error::{Error, Result};
use crate::core::exec::{ToolRunner, failure};
use crate::core::render::nftables::{DOCUMENT, NftablesRenderer};
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use crate::elevation::Tool;
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

pub struct NftablesBackend {
    renderer: NftablesRenderer,
    runner: ToolRunner,
}

impl NftablesBackend {
    pub fn new(table: &str, runner: ToolRunner) -> Self {
        Self {
            renderer: NftablesRenderer::new(table),
            runner,
        }
    }

    fn table(&self) -> &str {
        self.renderer.table()
    }

    async fn load_batch(&self, batch: &str) -> Result<()> {
        let output = self
            .runner
            .run(Tool::Nft, &["-j", "-f", "-"], Some(batch.as_bytes()))
            .await?;
        if output.success() {
            Ok(())
        } else {
            for message in parse_nft_errors(&output.stderr) {
                warn!("nft: {message}");
            }
            Err(failure(Tool::Nft, &output))
        }
    }
}

fn is_missing_table(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("does not exist")
}

/// Extracts messages from nft's JSON or plain-text error output.
fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

/// Builds a batch that recreates the table exactly as dumped.
///
/// The table is deleted first, so anything added since the dump disappears.
/// An empty dump means the table did not exist, and the batch only removes it.
pub fn restore_batch(table: &str, documents: &[Document]) -> Result<Value> {
    let table_object = json!({ "family": "inet", "name": table });
    let mut batch = vec![
        // add-then-delete succeeds whether or not the table exists
        json!({ "add": { "table": table_object } }),
        json!({ "delete": { "table": table_object } }),
    ];

    for doc in documents.iter().filter(|d| !d.content.trim().is_empty()) {
        let listing: Value = serde_json::from_str(&doc.content)?;
        let items = listing
            .get("nftables")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::Internal(format!("{}: missing nftables array", doc.name)))?;

        for item in items {
            let Some(object) = item.as_object() else {
                continue;
            };
            for (kind, body) in object {
                if kind == "metainfo" {
                    continue;
                }
                let mut body = body.clone();
                if let Some(fields) = body.as_object_mut() {
                    fields.remove("handle");
                }
                let mut add = Map::new();
                add.insert(kind.clone(), body);
                batch.push(json!({ "add": Value::Object(add) }));
            }
        }
    }

    Ok(json!({ "nftables": batch }))
}

#[async_trait]
impl Backend for NftablesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nftables
    }

    fn renderer(&self) -> &dyn Renderer {
        &self.renderer
    }

    fn check_available(&self) -> Result<()> {
        require_tools(BackendKind::Nftables, &[Tool::Nft])
    }

    async fn dump(&self) -> Result<Vec<Document>> {
        let output = self
            .runner
            .run(Tool::Nft, &["-j", "list", "table", "inet", self.table()], None)
            .await?;
        if output.success() {
            return Ok(vec![Document::new(DOCUMENT, output.stdout)]);
        }
        if is_missing_table(&output.stderr) {
            info!("Table inet {} does not exist yet", self.table());
            return Ok(vec![Document::new(DOCUMENT, "")]);
        }
        Err(failure(Tool::Nft, &output))
    }

    async fn dry_run(&self, artifact: &CompiledArtifact) -> Result<()> {
        let doc = artifact
            .document(DOCUMENT)
            .ok_or_else(|| Error::Internal(format!("artifact has no {DOCUMENT}")))?;
        let output = self
            .runner
            .run(
                Tool::Nft,
                &["-j", "--check", "-f", "-"],
                Some(doc.content.as_bytes()),
            )
            .await?;
        if output.success() {
            Ok(())
        } else {
            for message in parse_nft_errors(&output.stderr) {
                warn!("nft --check: {message}");
            }
            Err(failure(Tool::Nft, &output))
        }
    }

    async fn load(&self, artifact: &CompiledArtifact) -> Result<()> {
        let doc = artifact
            .document(DOCUMENT)
            .ok_or_else(|| Error::Internal(format!("artifact has no {DOCUMENT}")))?;
        self.load_batch(&doc.content).await
    }

    async fn restore(&self, documents: &[Document]) -> Result<()> {
        let batch = restore_batch(self.table(), documents)?;
        self.load_batch(&serde_json::to_string(&batch)?).await
    }

    async fn run_verification(&self, artifact: &CompiledArtifact) -> Result<()> {
        run_verify_commands(&self.runner, artifact).await
    }
}
