//! Live firewall backends
//!
//! A [`Backend`] is the capability interface the apply engine drives:
//! dump the live state, syntax-check an artifact, atomically load it and
//! restore a previous dump. Each native backend pairs the matching renderer
//! with the tools that operate on the live system.
//!
//! All native tools run through [`ToolRunner`], so every invocation is
//! elevated the same way and bounded by the configured timeout.

pub mod firewalld;
pub mod iptables;
pub mod nftables;
pub mod ufw;

use crate::config::EngineConfig;
use crate::core::error::{Error, Result};
use crate::core::exec::ToolRunner;
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use crate::elevation::Tool;
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Renderer producing artifacts this backend loads
    fn renderer(&self) -> &dyn Renderer;

    /// Fails with [`Error::BackendUnavailable`] if a required tool is missing.
    fn check_available(&self) -> Result<()>;

    /// Captures the live state managed by this backend.
    ///
    /// Missing state (no table yet, no zone file) is an empty document, not
    /// an error.
    async fn dump(&self) -> Result<Vec<Document>>;

    /// Syntax-checks an artifact without loading it.
    async fn dry_run(&self, artifact: &CompiledArtifact) -> Result<()>;

    /// Replaces the live state with the artifact in one load operation.
    async fn load(&self, artifact: &CompiledArtifact) -> Result<()>;

    /// Reloads a previous dump.
    async fn restore(&self, documents: &[Document]) -> Result<()>;

    /// Runs the artifact's read-only verification commands.
    async fn run_verification(&self, artifact: &CompiledArtifact) -> Result<()>;
}

/// Native backend for the configured kind.
pub fn native(kind: BackendKind, config: &EngineConfig) -> Arc<dyn Backend> {
    let runner = ToolRunner::new(config.timeout());
    let settings = config.render_settings();
    match kind {
        BackendKind::Nftables => Arc::new(nftables::NftablesBackend::new(
            &settings.nft_table,
            runner,
        )),
        BackendKind::Iptables => Arc::new(iptables::IptablesBackend::new(runner)),
        BackendKind::Firewalld => Arc::new(firewalld::FirewalldBackend::new(
            &settings.firewalld_zone,
            runner,
        )),
        BackendKind::Ufw => Arc::new(ufw::UfwBackend::new(runner)),
    }
}

pub(crate) fn require_tools(kind: BackendKind, tools: &[Tool]) -> Result<()> {
    match tools.iter().find(|t| !t.is_available()) {
        Some(missing) => Err(Error::BackendUnavailable {
            backend: kind.to_string(),
            reason: format!("'{missing}' not found"),
        }),
        None => Ok(()),
    }
}

/// Runs each verification command; only approved tools may appear.
pub(crate) async fn run_verify_commands(
    runner: &ToolRunner,
    artifact: &CompiledArtifact,
) -> Result<()> {
    for command in &artifact.verify_commands {
        let Some((program, args)) = command.split_first() else {
            continue;
        };
        let tool = Tool::from_program(program)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        runner.run_checked(tool, &args, None).await?;
        debug!("Verification command passed: {}", command.join(" "));
    }
    Ok(())
}

/// Reads a root-owned file; a missing file yields `None`.
pub(crate) async fn read_system_file(runner: &ToolRunner, path: &Path) -> Result<Option<String>> {
    let path_str = path.to_string_lossy();
    let output = runner.run(Tool::Cat, &[path_str.as_ref()], None).await?;
    if output.success() {
        return Ok(Some(output.stdout));
    }
    if output.stderr.contains("No such file or directory") {
        debug!("{} does not exist", path.display());
        return Ok(None);
    }
    Err(crate::core::exec::failure(Tool::Cat, &output))
}

/// Writes a root-owned file through `install` from a private temp file.
pub(crate) async fn install_file(
    runner: &ToolRunner,
    content: &str,
    destination: &Path,
    mode: &str,
) -> Result<()> {
    let mut temp = tempfile::NamedTempFile::new()?;
    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;

    let source = temp.path().to_string_lossy().into_owned();
    let destination_str = destination.to_string_lossy();
    runner
        .run_checked(
            Tool::Install,
            &["-m", mode, source.as_str(), destination_str.as_ref()],
            None,
        )
        .await?;
    info!("Installed {}", destination.display());
    Ok(())
}
