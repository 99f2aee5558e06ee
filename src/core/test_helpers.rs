//! Shared test utilities for core module tests
//!
//! Provides an in-memory backend and ruleset builders so apply scenarios run
//! without native tools or elevation. This module is only compiled in test mode.

use crate::audit::AuditLog;
use crate::core::backend::Backend;
use crate::core::backup::BackupStore;
use crate::core::engine::{ApplyContext, ApplyLock};
use crate::core::error::{Error, Result};
use crate::core::model::{Action, Chain, DefaultPolicy, Family, PortSpec, Rule, RuleSet, Source, Target};
use crate::core::render::nftables::{DOCUMENT, NftablesRenderer};
use crate::core::render::{BackendKind, CompiledArtifact, Document, Renderer};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mutex for tests that need exclusive access to environment variables.
///
/// Use this when your test needs to:
/// 1. Temporarily change env vars to different values
/// 2. Restore env vars after the test
/// 3. Test behavior when env vars are absent
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("HOSTWALL_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("HOSTWALL_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

fn injected(what: &str) -> Error {
    Error::Backend {
        tool: "memory".to_string(),
        message: format!("injected {what} failure"),
        stderr: Some(format!("Error: {what} refused\n")),
        exit_code: Some(1),
    }
}

/// nftables-flavoured backend whose live state is a document in memory.
///
/// Every failure mode the engine handles can be switched on per test.
pub struct MemoryBackend {
    renderer: NftablesRenderer,
    live: Mutex<Vec<Document>>,
    pub fail_load: AtomicBool,
    pub fail_restore: AtomicBool,
    pub fail_dump: AtomicBool,
    pub fail_dry_run: AtomicBool,
    pub fail_verification: AtomicBool,
    /// Load succeeds but leaves the rules out of the live state
    pub corrupt_on_load: AtomicBool,
    /// Load writes the artifact, then reports failure
    pub fail_after_write: AtomicBool,
    pub load_delay: Mutex<Option<Duration>>,
    pub loads: AtomicUsize,
    pub dry_runs: AtomicUsize,
    pub restores: AtomicUsize,
    pub dumps: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            renderer: NftablesRenderer::new("hostwall"),
            live: Mutex::new(vec![Document::new(DOCUMENT, "")]),
            fail_load: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
            fail_dump: AtomicBool::new(false),
            fail_dry_run: AtomicBool::new(false),
            fail_verification: AtomicBool::new(false),
            corrupt_on_load: AtomicBool::new(false),
            fail_after_write: AtomicBool::new(false),
            load_delay: Mutex::new(None),
            loads: AtomicUsize::new(0),
            dry_runs: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
            dumps: AtomicUsize::new(0),
        }
    }

    pub fn set(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = Some(delay);
    }

    pub fn live(&self) -> Vec<Document> {
        self.live.lock().unwrap().clone()
    }

    pub fn set_live(&self, documents: Vec<Document>) {
        *self.live.lock().unwrap() = documents;
    }

    /// Summary of the live state, as the engine compares it.
    pub fn live_summary(&self) -> Vec<String> {
        self.renderer.summarize(&self.live()).unwrap()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nftables
    }

    fn renderer(&self) -> &dyn Renderer {
        &self.renderer
    }

    fn check_available(&self) -> Result<()> {
        Ok(())
    }

    async fn dump(&self) -> Result<Vec<Document>> {
        self.dumps.fetch_add(1, Ordering::SeqCst);
        if self.fail_dump.load(Ordering::SeqCst) {
            return Err(injected("dump"));
        }
        Ok(self.live())
    }

    async fn dry_run(&self, _artifact: &CompiledArtifact) -> Result<()> {
        self.dry_runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_dry_run.load(Ordering::SeqCst) {
            return Err(injected("dry run"));
        }
        Ok(())
    }

    async fn load(&self, artifact: &CompiledArtifact) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_load.load(Ordering::SeqCst) {
            return Err(injected("load"));
        }
        if self.corrupt_on_load.load(Ordering::SeqCst) {
            self.set_live(vec![Document::new(DOCUMENT, r#"{"nftables": []}"#)]);
        } else {
            self.set_live(artifact.documents.clone());
        }
        if self.fail_after_write.load(Ordering::SeqCst) {
            return Err(injected("reload"));
        }
        Ok(())
    }

    async fn restore(&self, documents: &[Document]) -> Result<()> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(injected("restore"));
        }
        self.set_live(documents.to_vec());
        Ok(())
    }

    async fn run_verification(&self, _artifact: &CompiledArtifact) -> Result<()> {
        if self.fail_verification.load(Ordering::SeqCst) {
            return Err(injected("verification"));
        }
        Ok(())
    }
}

/// Ruleset with a drop input policy and nothing else.
pub fn drop_input_ruleset() -> RuleSet {
    let mut ruleset = RuleSet::new();
    ruleset.default_policies.push(DefaultPolicy {
        chain: Chain::Input,
        family: Family::Inet,
        action: Action::Drop,
    });
    ruleset
}

/// Creates an input rule accepting `port` over tcp from anywhere.
pub fn create_port_rule(name: &str, port: &str) -> Rule {
    let mut rule = Rule::new(name);
    rule.sources.push(Source::Any);
    rule.targets.push(Target::Port(PortSpec::new(port)));
    rule
}

/// Drop input policy plus one accepted web port.
pub fn web_ruleset(port: &str) -> RuleSet {
    let mut ruleset = drop_input_ruleset();
    ruleset.rules.push(create_port_rule("web", port));
    ruleset
}

/// Context over `backend` with snapshots and audit log under `dir`.
pub fn test_context(backend: &Arc<MemoryBackend>, dir: &Path) -> ApplyContext {
    let dyn_backend: Arc<dyn Backend> = backend.clone();
    ApplyContext::new(
        dyn_backend,
        BackupStore::new(dir.join("snapshots")),
        ApplyLock::in_process(),
    )
    .with_audit(AuditLog::at(dir.join("audit.log")))
}
