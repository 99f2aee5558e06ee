//! ufw backend
//!
//! ufw has no single load primitive. The rules files are syntax-checked with
//! `iptables-restore --test`. On load they are installed together with an
//! `/etc/default/ufw` whose policy lines are rewritten in place, and nothing
//! reaches the kernel until the one `ufw reload` at the end. A failure while
//! installing leaves the running firewall untouched.

use super::{Backend, install_file, read_system_file, require_tools, run_verify_commands};
use crate::core::error::Result;
use crate::core::exec::ToolRunner;
use crate::core::render::ufw::{
    DOCUMENT_DEFAULTS, DOCUMENT_V4, DOCUMENT_V6, UfwRenderer, merge_defaults,
};
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use crate::elevation::Tool;
use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

const DEFAULTS_PATH: &str = "/etc/default/ufw";

/// Live locations of the artifact's documents
const FILES: [(&str, &str); 3] = [
    (DOCUMENT_V4, "/etc/ufw/user.rules"),
    (DOCUMENT_V6, "/etc/ufw/user6.rules"),
    (DOCUMENT_DEFAULTS, DEFAULTS_PATH),
];

/// File and reload operations ufw needs from the host
#[async_trait]
pub trait UfwHost: Send + Sync {
    /// Reads a file; a missing file is `None`.
    async fn read(&self, path: &Path) -> Result<Option<String>>;

    async fn install(&self, path: &Path, content: &str, mode: &str) -> Result<()>;

    /// Makes the installed files live.
    async fn reload(&self) -> Result<()>;
}

/// The real host, reached through elevated tools
pub struct SystemHost {
    runner: ToolRunner,
}

#[async_trait]
impl UfwHost for SystemHost {
    async fn read(&self, path: &Path) -> Result<Option<String>> {
        read_system_file(&self.runner, path).await
    }

    async fn install(&self, path: &Path, content: &str, mode: &str) -> Result<()> {
        install_file(&self.runner, content, path, mode).await
    }

    async fn reload(&self) -> Result<()> {
        self.runner.run_checked(Tool::Ufw, &["reload"], None).await?;
        info!("ufw reloaded");
        Ok(())
    }
}

pub struct UfwBackend<H = SystemHost> {
    runner: ToolRunner,
    host: H,
}

fn restore_tool(document: &str) -> Tool {
    if document == DOCUMENT_V6 {
        Tool::Ip6tablesRestore
    } else {
        Tool::IptablesRestore
    }
}

impl UfwBackend<SystemHost> {
    pub fn new(runner: ToolRunner) -> Self {
        let host = SystemHost {
            runner: runner.clone(),
        };
        Self { runner, host }
    }
}

impl<H: UfwHost> UfwBackend<H> {
    pub fn with_host(runner: ToolRunner, host: H) -> Self {
        Self { runner, host }
    }

    /// Installs every changed file, then reloads once.
    async fn activate(&self, documents: &[Document]) -> Result<()> {
        for (name, path) in &FILES[..2] {
            match documents.iter().find(|d| d.name == *name) {
                Some(doc) if !doc.content.trim().is_empty() => {
                    self.host.install(Path::new(path), &doc.content, "0640").await?;
                }
                _ => debug!("No content for {name}, leaving {path} untouched"),
            }
        }

        if let Some(defaults) = documents.iter().find(|d| d.name == DOCUMENT_DEFAULTS) {
            let path = Path::new(DEFAULTS_PATH);
            let current = self.host.read(path).await?.unwrap_or_default();
            let merged = merge_defaults(&current, &defaults.content);
            if merged == current {
                debug!("{DEFAULTS_PATH} already carries the wanted policies");
            } else {
                self.host.install(path, &merged, "0644").await?;
            }
        }

        self.host.reload().await
    }
}

#[async_trait]
impl<H: UfwHost + 'static> Backend for UfwBackend<H> {
    fn kind(&self) -> BackendKind {
        BackendKind::Ufw
    }

    fn renderer(&self) -> &dyn Renderer {
        &UfwRenderer
    }

    fn check_available(&self) -> Result<()> {
        require_tools(
            BackendKind::Ufw,
            &[
                Tool::Ufw,
                Tool::IptablesRestore,
                Tool::Ip6tablesRestore,
                Tool::Install,
                Tool::Cat,
            ],
        )
    }

    async fn dump(&self) -> Result<Vec<Document>> {
        let mut documents = Vec::with_capacity(FILES.len());
        for (name, path) in FILES {
            let content = self.host.read(Path::new(path)).await?.unwrap_or_default();
            documents.push(Document::new(name, content));
        }
        Ok(documents)
    }

    /// `--noflush` because the ufw-user chains reference ufw's other chains.
    async fn dry_run(&self, artifact: &CompiledArtifact) -> Result<()> {
        for doc in &artifact.documents {
            if doc.name == DOCUMENT_DEFAULTS {
                continue;
            }
            self.runner
                .run_checked(
                    restore_tool(&doc.name),
                    &["--test", "--noflush"],
                    Some(doc.content.as_bytes()),
                )
                .await?;
        }
        Ok(())
    }

    async fn load(&self, artifact: &CompiledArtifact) -> Result<()> {
        self.activate(&artifact.documents).await
    }

    async fn restore(&self, documents: &[Document]) -> Result<()> {
        self.activate(documents).await
    }

    async fn run_verification(&self, artifact: &CompiledArtifact) -> Result<()> {
        run_verify_commands(&self.runner, artifact).await
    }
}
