//! Apply Engine
//!
//! Runs one apply transaction as an explicit state machine:
//!
//! ```text
//! Idle → Snapshotting → Rendering → DryRunning → Aborted            (validate-only)
//!                                 → Applying → Verifying → Committed
//!                                                        ↘ RollingBack → RolledBack | Fatal
//!                                 → Verifying → Committed           (already live)
//! ```
//!
//! Failures before `Applying` end in `Aborted` without touching the live
//! backend. Once `Applying` has started, every failure (including timeout and
//! cancellation) is resolved by restoring the pre-apply snapshot. The engine
//! never returns in the middle of a transaction: the caller always gets a
//! terminal [`ApplyReport`] with the full transition trace.
//!
//! Everything process-wide (backend, snapshot directory, lock) is carried by
//! an explicit [`ApplyContext`], so independent engines can coexist.

use crate::audit::{AuditLog, EventType};
use crate::core::backend::Backend;
use crate::core::backup::{BackupStore, Snapshot, SnapshotId};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::guard::ensure_management_access;
use crate::core::model::RuleSet;
use crate::core::plan::{self, Plan, Probe, Verdict};
use crate::core::render::{CompiledArtifact, Document, join_documents};
use crate::core::validate::{Finding, validate};
use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default transaction budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of snapshots kept per backend
pub const DEFAULT_RETENTION: usize = 5;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    Apply,
    /// Syntax-check the artifact with the backend's own checker, never load it
    ValidateOnly,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApplyState {
    Idle,
    Snapshotting,
    Rendering,
    DryRunning,
    Applying,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    Aborted,
    Fatal,
}

impl ApplyState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ApplyState::Committed | ApplyState::RolledBack | ApplyState::Aborted | ApplyState::Fatal
        )
    }

    /// Whether the machine may move from `self` to `next`.
    ///
    /// `Verifying → Aborted` only happens when the live state already matched
    /// and nothing was loaded.
    pub fn can_transition(self, next: ApplyState) -> bool {
        use ApplyState::{
            Aborted, Applying, Committed, DryRunning, Fatal, Idle, Rendering, RolledBack,
            RollingBack, Snapshotting, Verifying,
        };
        match self {
            Idle => matches!(next, Snapshotting | Aborted),
            Snapshotting => matches!(next, Rendering | Aborted),
            Rendering => matches!(next, DryRunning | Applying | Verifying | Aborted),
            DryRunning => matches!(next, Aborted),
            Applying => matches!(next, Verifying | RollingBack),
            Verifying => matches!(next, Committed | RollingBack | Aborted),
            RollingBack => matches!(next, RolledBack | Fatal),
            Committed | RolledBack | Aborted | Fatal => false,
        }
    }
}

/// One entry of the transition trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: ApplyState,
    pub to: ApplyState,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Cooperative cancellation shared between the caller and a running apply
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serializes applies within the process and, with a lock file, across
/// processes. Acquisition never waits: a held lock is [`Error::Busy`].
#[derive(Debug, Clone)]
pub struct ApplyLock {
    local: Arc<Mutex<()>>,
    path: Option<PathBuf>,
}

pub struct ApplyLockGuard {
    _local: OwnedMutexGuard<()>,
    _file: Option<Flock<File>>,
}

impl ApplyLock {
    pub fn in_process() -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            path: None,
        }
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            local: Arc::new(Mutex::new(())),
            path: Some(path.into()),
        }
    }

    pub fn try_acquire(&self) -> Result<ApplyLockGuard> {
        let local = Arc::clone(&self.local)
            .try_lock_owned()
            .map_err(|_| Error::Busy("an apply is running in this process".to_string()))?;

        let file = match &self.path {
            None => None,
            Some(path) => {
                if let Some(parent) = path.parent() {
                    crate::utils::ensure_dir(parent)?;
                }
                let mut options = std::fs::OpenOptions::new();
                options.create(true).write(true).truncate(false);
                #[cfg(unix)]
                {
                    use std::os::unix::fs::OpenOptionsExt;
                    options.mode(0o600);
                }
                let file = options.open(path)?;
                let locked = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(
                    |(_, errno)| {
                        if errno == nix::errno::Errno::EWOULDBLOCK {
                            Error::Busy(format!("{} is held by another process", path.display()))
                        } else {
                            Error::Io(std::io::Error::from(errno))
                        }
                    },
                )?;
                Some(locked)
            }
        };

        Ok(ApplyLockGuard {
            _local: local,
            _file: file,
        })
    }
}

/// The connection performing the apply, checked during verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagementEndpoint {
    pub peer: IpAddr,
    /// Local port the peer is connected to
    pub port: u16,
}

impl ManagementEndpoint {
    /// Parses `SSH_CONNECTION` (`client_ip client_port server_ip server_port`).
    pub fn from_ssh_connection(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let peer = parts.next()?.parse().ok()?;
        let _client_port = parts.next()?;
        let _server_ip = parts.next()?;
        let port = parts.next()?.parse().ok()?;
        Some(Self { peer, port })
    }
}

/// Handles an engine operates on
pub struct ApplyContext {
    pub backend: Arc<dyn Backend>,
    pub store: BackupStore,
    pub lock: ApplyLock,
    pub audit: Option<AuditLog>,
    pub management: Option<ManagementEndpoint>,
    /// Snapshots kept per backend after a commit (the baseline is extra)
    pub retention: usize,
}

impl ApplyContext {
    pub fn new(backend: Arc<dyn Backend>, store: BackupStore, lock: ApplyLock) -> Self {
        Self {
            backend,
            store,
            lock,
            audit: None,
            management: None,
            retention: DEFAULT_RETENTION,
        }
    }

    #[must_use]
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    #[must_use]
    pub fn with_management(mut self, endpoint: Option<ManagementEndpoint>) -> Self {
        self.management = endpoint;
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    async fn audit(
        &self,
        event: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(event, success, details, error).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub mode: ApplyMode,
    /// Budget for the whole transaction
    pub timeout: Duration,
    pub cancel: CancelToken,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Apply,
            timeout: DEFAULT_TIMEOUT,
            cancel: CancelToken::new(),
        }
    }
}

impl ApplyOptions {
    pub fn validate_only() -> Self {
        Self {
            mode: ApplyMode::ValidateOnly,
            ..Self::default()
        }
    }
}

/// Error summary carried in a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl From<&Error> for ReportedError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
            stderr: e.stderr().map(String::from),
        }
    }
}

impl ReportedError {
    /// A failure after loading began, reported once rollback succeeded.
    fn apply_failure(cause: &Error) -> Self {
        let kind = match cause.kind() {
            kind @ (ErrorKind::Timeout | ErrorKind::Cancelled | ErrorKind::ApplyFailure) => kind,
            _ => ErrorKind::ApplyFailure,
        };
        Self {
            kind,
            ..Self::from(cause)
        }
    }
}

/// Terminal result of one apply transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub transaction: Uuid,
    pub backend: crate::core::render::BackendKind,
    pub mode: ApplyMode,
    pub state: ApplyState,
    pub findings: Vec<Finding>,
    /// Pre-apply snapshot, the last known-good state
    pub snapshot_id: Option<SnapshotId>,
    pub changed: bool,
    pub trace: Vec<Transition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportedError>,
    /// Unified diff from live state to the compiled artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

impl ApplyReport {
    /// Committed, or a validate-only run that would apply cleanly.
    pub fn is_success(&self) -> bool {
        match self.state {
            ApplyState::Committed => true,
            ApplyState::Aborted => self.mode == ApplyMode::ValidateOnly && self.error.is_none(),
            _ => false,
        }
    }

    /// 0 on success, 2 when manual intervention is required, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else if self.state == ApplyState::Fatal {
            2
        } else {
            1
        }
    }
}

/// Unified diff between two document sets.
pub fn diff_documents(live: &[Document], compiled: &[Document]) -> String {
    let old = join_documents(live);
    let new = join_documents(compiled);
    similar::TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header("live", "compiled")
        .to_string()
}

fn diff_lines(live: &[String], expected: &[String]) -> String {
    let old = live.join("\n") + "\n";
    let new = expected.join("\n") + "\n";
    similar::TextDiff::from_lines(&old, &new)
        .unified_diff()
        .header("live", "expected")
        .to_string()
}

/// Bounds a step that may be abandoned (read-only, or before loading).
async fn bounded<T>(
    deadline: Instant,
    during: &str,
    step: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout_at(deadline, step)
        .await
        .map_err(|_| Error::Timeout(during.to_string()))?
}

fn check_management_access(plan: &Plan, endpoint: Option<ManagementEndpoint>) -> Result<()> {
    let Some(endpoint) = endpoint else {
        return Ok(());
    };

    let decision = plan::evaluate(plan, &Probe::from_peer(endpoint.peer, endpoint.port));
    let decided_by = decision
        .rule
        .and_then(|i| plan.rules.get(i))
        .map_or_else(|| "the default policy".to_string(), |r| format!("rule '{}'", r.name));

    match decision.verdict {
        Verdict::Accept => {
            debug!(
                "Management connection from {} to port {} stays open ({decided_by})",
                endpoint.peer, endpoint.port
            );
            Ok(())
        }
        Verdict::Uncertain => {
            warn!(
                "Cannot tell whether the management connection from {} to port {} stays open",
                endpoint.peer, endpoint.port
            );
            Ok(())
        }
        Verdict::Drop | Verdict::Reject => Err(Error::ApplyFailure(format!(
            "management connection from {} to port {} would be refused by {decided_by}",
            endpoint.peer, endpoint.port
        ))),
    }
}

pub struct ApplyEngine {
    ctx: ApplyContext,
}

impl ApplyEngine {
    pub fn new(ctx: ApplyContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ApplyContext {
        &self.ctx
    }

    /// Runs one apply transaction to a terminal state.
    pub async fn apply(&self, ruleset: &RuleSet, options: &ApplyOptions) -> ApplyReport {
        let mut tx = Transaction::new(&self.ctx, options);
        info!(
            transaction = %tx.id,
            "Starting {} on {} (timeout {:?})",
            options.mode,
            self.ctx.backend.kind(),
            options.timeout
        );

        let _guard = match self.ctx.lock.try_acquire() {
            Ok(guard) => guard,
            Err(e) => return tx.abort(&e),
        };

        let deadline = Instant::now() + options.timeout;
        tx.run(ruleset, deadline).await
    }

    /// Unified diff between the live state and what `ruleset` compiles to.
    pub async fn diff(&self, ruleset: &RuleSet) -> Result<String> {
        let backend = &self.ctx.backend;
        backend.check_available()?;
        validate(ruleset).into_result()?;
        let plan = ensure_management_access(ruleset)?;
        let artifact = backend.renderer().render(&plan)?;
        let live = backend.dump().await?;
        Ok(diff_documents(&live, &artifact.documents))
    }

    /// Reloads a stored snapshot out of band.
    pub async fn restore(&self, id: &SnapshotId) -> Result<()> {
        let _guard = self.ctx.lock.try_acquire()?;
        let backend = &self.ctx.backend;
        let snapshot = self.ctx.store.load_for(backend.kind(), id)?;
        backend.check_available()?;

        info!("Restoring snapshot {id}");
        let result = backend.restore(&snapshot.documents).await;
        self.ctx
            .audit(
                EventType::RestoreSnapshot,
                result.is_ok(),
                serde_json::json!({ "snapshot_id": id, "backend": backend.kind() }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        result
    }
}

/// Mutable state of one running apply
struct Transaction<'a> {
    ctx: &'a ApplyContext,
    options: &'a ApplyOptions,
    id: Uuid,
    state: ApplyState,
    trace: Vec<Transition>,
    findings: Vec<Finding>,
    snapshot_id: Option<SnapshotId>,
    changed: bool,
    diff: Option<String>,
}

impl<'a> Transaction<'a> {
    fn new(ctx: &'a ApplyContext, options: &'a ApplyOptions) -> Self {
        Self {
            ctx,
            options,
            id: Uuid::new_v4(),
            state: ApplyState::Idle,
            trace: Vec::new(),
            findings: Vec::new(),
            snapshot_id: None,
            changed: false,
            diff: None,
        }
    }

    fn advance(&mut self, next: ApplyState, note: Option<String>) -> Result<()> {
        if !self.state.can_transition(next) {
            return Err(Error::Internal(format!(
                "illegal transition {} -> {next}",
                self.state
            )));
        }
        match &note {
            Some(note) => info!(transaction = %self.id, "{} -> {next}: {note}", self.state),
            None => info!(transaction = %self.id, "{} -> {next}", self.state),
        }
        self.trace.push(Transition {
            from: self.state,
            to: next,
            at: Utc::now(),
            note,
        });
        self.state = next;
        Ok(())
    }

    /// Enters a terminal state and builds the report.
    fn finish(&mut self, terminal: ApplyState, error: Option<ReportedError>) -> ApplyReport {
        let note = error.as_ref().map(|e| e.message.clone());
        if let Err(e) = self.advance(terminal, note) {
            error!(transaction = %self.id, "{e}");
        }
        ApplyReport {
            transaction: self.id,
            backend: self.ctx.backend.kind(),
            mode: self.options.mode,
            state: self.state,
            findings: std::mem::take(&mut self.findings),
            snapshot_id: self.snapshot_id.clone(),
            changed: self.changed,
            trace: std::mem::take(&mut self.trace),
            error,
            diff: self.diff.take(),
        }
    }

    fn abort(&mut self, cause: &Error) -> ApplyReport {
        warn!(transaction = %self.id, "Aborting in {}: {cause}", self.state);
        self.changed = false;
        self.finish(ApplyState::Aborted, Some(ReportedError::from(cause)))
    }

    fn check_interrupt(&self, deadline: Instant, during: &str) -> Result<()> {
        if self.options.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(during.to_string()));
        }
        Ok(())
    }

    async fn run(&mut self, ruleset: &RuleSet, deadline: Instant) -> ApplyReport {
        let snapshot = match self.snapshot(deadline).await {
            Ok(snapshot) => snapshot,
            Err(e) => return self.abort(&e),
        };

        let (plan, artifact) = match self.render(ruleset, &snapshot, deadline) {
            Ok(rendered) => rendered,
            Err(e) => return self.abort(&e),
        };

        if self.options.mode == ApplyMode::ValidateOnly {
            return match self.dry_run(&artifact, deadline).await {
                Ok(()) => self.finish(ApplyState::Aborted, None),
                Err(e) => self.abort(&e),
            };
        }

        let ctx = self.ctx;
        let renderer = ctx.backend.renderer();
        let already_live = match (
            renderer.fingerprint(&snapshot.documents),
            renderer.fingerprint(&artifact.documents),
        ) {
            (Ok(live), Ok(compiled)) => live == compiled,
            (Err(e), _) | (_, Err(e)) => return self.abort(&e),
        };

        if let Err(e) = self.check_interrupt(deadline, "rendering") {
            return self.abort(&e);
        }
        // Only a transaction that reaches the live backend keeps a rollback point
        if let Err(e) = self.persist_snapshot(&snapshot).await {
            return self.abort(&e);
        }

        if already_live {
            return self.confirm_unchanged(&plan, &artifact, deadline).await;
        }
        self.apply_and_verify(&plan, &artifact, &snapshot, deadline)
            .await
    }

    async fn snapshot(&mut self, deadline: Instant) -> Result<Snapshot> {
        self.advance(ApplyState::Snapshotting, None)?;
        self.check_interrupt(deadline, "snapshotting")?;

        let ctx = self.ctx;
        ctx.backend.check_available()?;
        let live = bounded(deadline, "snapshotting", ctx.backend.dump()).await?;
        Ok(Snapshot::capture(ctx.backend.kind(), live))
    }

    /// Writes the captured snapshot to the Backup Store.
    async fn persist_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let ctx = self.ctx;
        let saved = ctx.store.save(snapshot);
        ctx.audit(
            EventType::SaveSnapshot,
            saved.is_ok(),
            serde_json::json!({
                "transaction": self.id,
                "snapshot_id": snapshot.id,
                "backend": snapshot.backend,
            }),
            saved.as_ref().err().map(ToString::to_string),
        )
        .await;
        saved?;
        self.snapshot_id = Some(snapshot.id.clone());
        Ok(())
    }

    fn render(
        &mut self,
        ruleset: &RuleSet,
        snapshot: &Snapshot,
        deadline: Instant,
    ) -> Result<(Plan, CompiledArtifact)> {
        self.advance(ApplyState::Rendering, None)?;
        self.check_interrupt(deadline, "rendering")?;

        let report = validate(ruleset);
        self.findings.clone_from(&report.findings);
        for finding in report.warnings() {
            warn!("{finding}");
        }
        report.into_result()?;

        let plan = ensure_management_access(ruleset)?;
        let artifact = self.ctx.backend.renderer().render(&plan)?;
        self.diff = Some(diff_documents(&snapshot.documents, &artifact.documents));
        debug!(
            "Rendered {} document(s) for {}",
            artifact.documents.len(),
            artifact.backend
        );
        Ok((plan, artifact))
    }

    async fn dry_run(&mut self, artifact: &CompiledArtifact, deadline: Instant) -> Result<()> {
        self.advance(ApplyState::DryRunning, None)?;
        self.check_interrupt(deadline, "dry run")?;

        let result = bounded(deadline, "dry run", self.ctx.backend.dry_run(artifact)).await;
        self.ctx
            .audit(
                EventType::DryRun,
                result.is_ok(),
                serde_json::json!({
                    "transaction": self.id,
                    "backend": artifact.backend,
                }),
                result.as_ref().err().map(ToString::to_string),
            )
            .await;
        if result.is_ok() {
            info!(transaction = %self.id, "Dry run passed: would apply cleanly");
        }
        result
    }

    /// Confirms a live state that already matches; nothing is loaded.
    async fn confirm_unchanged(
        &mut self,
        plan: &Plan,
        artifact: &CompiledArtifact,
        deadline: Instant,
    ) -> ApplyReport {
        if let Err(e) = self.advance(
            ApplyState::Verifying,
            Some("live state already matches".to_string()),
        ) {
            return self.abort(&e);
        }
        if let Err(e) = bounded(deadline, "verifying", self.verify(plan, artifact)).await {
            return self.abort(&e);
        }
        self.commit().await;
        self.finish(ApplyState::Committed, None)
    }

    async fn apply_and_verify(
        &mut self,
        plan: &Plan,
        artifact: &CompiledArtifact,
        snapshot: &Snapshot,
        deadline: Instant,
    ) -> ApplyReport {
        if let Err(e) = self.advance(ApplyState::Applying, None) {
            return self.abort(&e);
        }
        self.changed = true;

        // Loading is never abandoned; each tool call has its own timeout
        if let Err(e) = self.ctx.backend.load(artifact).await {
            return self.roll_back(snapshot, e).await;
        }
        if self.options.cancel.is_cancelled() {
            return self.roll_back(snapshot, Error::Cancelled).await;
        }
        if Instant::now() >= deadline {
            return self
                .roll_back(snapshot, Error::Timeout("applying".to_string()))
                .await;
        }

        if let Err(e) = self.advance(ApplyState::Verifying, None) {
            return self.roll_back(snapshot, e).await;
        }
        if let Err(e) = bounded(deadline, "verifying", self.verify(plan, artifact)).await {
            return self.roll_back(snapshot, e).await;
        }
        if self.options.cancel.is_cancelled() {
            return self.roll_back(snapshot, Error::Cancelled).await;
        }

        self.commit().await;
        let report = self.finish(ApplyState::Committed, None);
        self.ctx
            .audit(
                EventType::Apply,
                true,
                serde_json::json!({
                    "transaction": report.transaction,
                    "backend": report.backend,
                    "snapshot_id": report.snapshot_id,
                    "rules": plan.rules.len(),
                }),
                None,
            )
            .await;
        report
    }

    /// Live state must summarize like the artifact, the backend's own checks
    /// must pass and the management connection must stay open.
    async fn verify(&self, plan: &Plan, artifact: &CompiledArtifact) -> Result<()> {
        let backend = &self.ctx.backend;
        let renderer = backend.renderer();

        let live = backend.dump().await?;
        let actual = renderer.summarize(&live)?;
        let expected = renderer.summarize(&artifact.documents)?;
        if actual != expected {
            warn!(
                "Live state differs from the compiled artifact:\n{}",
                diff_lines(&actual, &expected)
            );
            return Err(Error::ApplyFailure(
                "live state does not match the compiled artifact".to_string(),
            ));
        }

        backend.run_verification(artifact).await?;
        check_management_access(plan, self.ctx.management)
    }

    /// The snapshot becomes the baseline for the next apply.
    async fn commit(&self) {
        let Some(id) = &self.snapshot_id else {
            return;
        };
        let kind = self.ctx.backend.kind();
        let store = &self.ctx.store;

        if let Err(e) = store.mark_baseline(kind, id) {
            warn!("Failed to record baseline {id}: {e}");
        }
        match store.prune(kind, self.ctx.retention) {
            Ok(removed) if !removed.is_empty() => {
                self.ctx
                    .audit(
                        EventType::PruneSnapshots,
                        true,
                        serde_json::json!({ "backend": kind, "removed": removed }),
                        None,
                    )
                    .await;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to prune snapshots: {e}"),
        }
    }

    async fn roll_back(&mut self, snapshot: &Snapshot, cause: Error) -> ApplyReport {
        error!(transaction = %self.id, "Apply failed in {}: {cause}", self.state);
        if let Err(e) = self.advance(ApplyState::RollingBack, Some(cause.to_string())) {
            error!(transaction = %self.id, "{e}");
        }

        let restored = self.restore_snapshot(snapshot).await;
        self.ctx
            .audit(
                EventType::Rollback,
                restored.is_ok(),
                serde_json::json!({
                    "transaction": self.id,
                    "snapshot_id": snapshot.id,
                    "cause": cause.to_string(),
                }),
                restored.as_ref().err().map(ToString::to_string),
            )
            .await;

        let report = match restored {
            Ok(()) => {
                info!(transaction = %self.id, "Rolled back to {}", snapshot.id);
                self.changed = false;
                self.finish(
                    ApplyState::RolledBack,
                    Some(ReportedError::apply_failure(&cause)),
                )
            }
            Err(e) => {
                error!(
                    transaction = %self.id,
                    "Rollback failed, manual intervention required: restore {} with `hostwall restore`",
                    snapshot.id
                );
                let fatal = Error::RollbackFailure {
                    snapshot_id: snapshot.id.to_string(),
                    message: e.to_string(),
                };
                let mut reported = ReportedError::from(&fatal);
                reported.stderr = e.stderr().map(String::from);
                self.finish(ApplyState::Fatal, Some(reported))
            }
        };

        self.ctx
            .audit(
                EventType::Apply,
                false,
                serde_json::json!({
                    "transaction": report.transaction,
                    "backend": report.backend,
                    "state": report.state,
                }),
                Some(cause.to_string()),
            )
            .await;
        report
    }

    /// Restores the snapshot and reads the state back to confirm it.
    ///
    /// Documents that were empty in the snapshot (nothing managed yet) are not
    /// compared, since backends fill them with their defaults on restore.
    async fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let backend = &self.ctx.backend;
        backend.restore(&snapshot.documents).await?;

        let expected: Vec<Document> = snapshot
            .documents
            .iter()
            .filter(|d| !d.content.trim().is_empty())
            .cloned()
            .collect();
        if expected.is_empty() {
            return Ok(());
        }
        let live: Vec<Document> = backend
            .dump()
            .await?
            .into_iter()
            .filter(|d| expected.iter().any(|e| e.name == d.name))
            .collect();

        let renderer = backend.renderer();
        if renderer.summarize(&live)? == renderer.summarize(&expected)? {
            Ok(())
        } else {
            Err(Error::Internal(
                "live state differs from the snapshot after restore".to_string(),
            ))
        }
    }
}
