//! iptables backend
//!
//! Each family's filter table is replaced with one `*-restore` call. The two
//! loads are separate transactions; a failure in the second leaves the first
//! loaded, which the engine undoes by restoring both dumps.

use super::{Backend, require_tools, run_verify_commands};
use crate::core::error::{Error, Result};
use crate::core::exec::{ToolRunner, failure};
use crate::core::model::Family;
use crate::core::render::iptables::{IptablesRenderer, document_for};
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use crate::elevation::Tool;
use async_trait::async_trait;
use tracing::{debug, info};

/// Filter table that accepts everything, loaded when a family had no saved state
pub const PERMISSIVE_FILTER: &str =
    "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\nCOMMIT\n";

pub struct IptablesBackend {
    runner: ToolRunner,
}

fn save_tool(family: Family) -> Tool {
    match family {
        Family::Ip6 => Tool::Ip6tablesSave,
        _ => Tool::IptablesSave,
    }
}

fn restore_tool(family: Family) -> Tool {
    match family {
        Family::Ip6 => Tool::Ip6tablesRestore,
        _ => Tool::IptablesRestore,
    }
}

fn content_for<'a>(documents: &'a [Document], family: Family) -> Result<&'a str> {
    documents
        .iter()
        .find(|d| d.name == document_for(family))
        .map(|d| d.content.as_str())
        .ok_or_else(|| Error::Internal(format!("missing document {}", document_for(family))))
}

impl IptablesBackend {
    pub fn new(runner: ToolRunner) -> Self {
        Self { runner }
    }

    async fn restore_family(&self, family: Family, content: &str, test: bool) -> Result<()> {
        let tool = restore_tool(family);
        let args: &[&str] = if test { &["--test"] } else { &[] };
        self.runner
            .run_checked(tool, args, Some(content.as_bytes()))
            .await?;
        debug!("{tool} {} accepted {}", args.join(" "), document_for(family));
        Ok(())
    }
}

#[async_trait]
impl Backend for IptablesBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Iptables
    }

    fn renderer(&self) -> &dyn Renderer {
        &IptablesRenderer
    }

    fn check_available(&self) -> Result<()> {
        require_tools(
            BackendKind::Iptables,
            &[
                Tool::IptablesSave,
                Tool::IptablesRestore,
                Tool::Ip6tablesSave,
                Tool::Ip6tablesRestore,
            ],
        )
    }

    async fn dump(&self) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(2);
        for family in Family::CONCRETE {
            let tool = save_tool(family);
            let output = self.runner.run(tool, &["-t", "filter"], None).await?;
            if !output.success() {
                return Err(failure(tool, &output));
            }
            documents.push(Document::new(document_for(family), output.stdout));
        }
        Ok(documents)
    }

    async fn dry_run(&self, artifact: &CompiledArtifact) -> Result<()> {
        for family in Family::CONCRETE {
            let content = content_for(&artifact.documents, family)?;
            self.restore_family(family, content, true).await?;
        }
        Ok(())
    }

    async fn load(&self, artifact: &CompiledArtifact) -> Result<()> {
        for family in Family::CONCRETE {
            let content = content_for(&artifact.documents, family)?;
            self.restore_family(family, content, false).await?;
        }
        Ok(())
    }

    async fn restore(&self, documents: &[Document]) -> Result<()> {
        for family in Family::CONCRETE {
            let content = content_for(documents, family)?;
            if content.trim().is_empty() {
                info!("No saved {family} state, loading permissive filter table");
                self.restore_family(family, PERMISSIVE_FILTER, false).await?;
            } else {
                self.restore_family(family, content, false).await?;
            }
        }
        Ok(())
    }

    async fn run_verification(&self, artifact: &CompiledArtifact) -> Result<()> {
        run_verify_commands(&self.runner, artifact).await
    }
}
