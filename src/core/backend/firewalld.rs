//! firewalld backend
//!
//! The zone's permanent configuration lives in one XML file. Loading writes
//! that file and reloads firewalld, which swaps the runtime configuration as a
//! whole or keeps the old one if the new file is rejected.

use super::{Backend, install_file, read_system_file, require_tools, run_verify_commands};
use crate::core::error::{Error, Result};
use crate::core::exec::ToolRunner;
use crate::core::render::firewalld::FirewalldRenderer;
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use crate::elevation::Tool;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

const ZONE_DIR: &str = "/etc/firewalld/zones";

pub struct FirewalldBackend {
    renderer: FirewalldRenderer,
    runner: ToolRunner,
}

impl FirewalldBackend {
    pub fn new(zone: &str, runner: ToolRunner) -> Self {
        Self {
            renderer: FirewalldRenderer::new(zone),
            runner,
        }
    }

    fn zone_path(&self) -> PathBuf {
        PathBuf::from(ZONE_DIR).join(self.renderer.document_name())
    }

    fn zone_document<'a>(&self, documents: &'a [Document]) -> Result<&'a Document> {
        let name = self.renderer.document_name();
        documents
            .iter()
            .find(|d| d.name == name)
            .ok_or_else(|| Error::Internal(format!("missing document {name}")))
    }

    async fn write_zone(&self, content: &str) -> Result<()> {
        install_file(&self.runner, content, &self.zone_path(), "0644").await?;
        self.reload().await
    }

    async fn reload(&self) -> Result<()> {
        self.runner
            .run_checked(Tool::FirewallCmd, &["--reload"], None)
            .await?;
        info!("firewalld reloaded");
        Ok(())
    }
}

#[async_trait]
impl Backend for FirewalldBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Firewalld
    }

    fn renderer(&self) -> &dyn Renderer {
        &self.renderer
    }

    fn check_available(&self) -> Result<()> {
        require_tools(
            BackendKind::Firewalld,
            &[Tool::FirewallCmd, Tool::Install, Tool::Cat],
        )
    }

    async fn dump(&self) -> Result<Vec<Document>> {
        let content = read_system_file(&self.runner, &self.zone_path())
            .await?
            .unwrap_or_default();
        Ok(vec![Document::new(self.renderer.document_name(), content)])
    }

    /// firewalld has no offline check for a single zone file; this confirms
    /// the daemon runs and its current permanent configuration is valid.
    async fn dry_run(&self, artifact: &CompiledArtifact) -> Result<()> {
        self.zone_document(&artifact.documents)?;
        self.runner
            .run_checked(Tool::FirewallCmd, &["--state"], None)
            .await?;
        self.runner
            .run_checked(Tool::FirewallCmd, &["--check-config"], None)
            .await?;
        Ok(())
    }

    async fn load(&self, artifact: &CompiledArtifact) -> Result<()> {
        let doc = self.zone_document(&artifact.documents)?;
        self.write_zone(&doc.content).await
    }

    async fn restore(&self, documents: &[Document]) -> Result<()> {
        let doc = self.zone_document(documents)?;
        if !doc.content.trim().is_empty() {
            return self.write_zone(&doc.content).await;
        }

        info!(
            "No saved zone file, resetting zone {} to defaults",
            self.renderer.zone()
        );
        let zone_arg = format!("--zone={}", self.renderer.zone());
        self.runner
            .run_checked(
                Tool::FirewallCmd,
                &["--permanent", zone_arg.as_str(), "--load-zone-defaults"],
                None,
            )
            .await?;
        self.reload().await
    }

    async fn run_verification(&self, artifact: &CompiledArtifact) -> Result<()> {
        run_verify_commands(&self.runner, artifact).await
    }
}
