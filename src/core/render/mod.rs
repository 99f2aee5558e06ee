//! Backend renderers
//!
//! A renderer turns a compiled [`Plan`] into the documents a native tool loads
//! in one atomic step. Renderers never perform I/O: the same plan always
//! yields byte-identical documents.
//!
//! Every renderer emits, in order: default policies, SSH guard rules, base
//! rules (loopback, established/related), user rules by priority, and the
//! terminal rules needed to express per-family policies. Each emitted rule
//! carries a comment of the form `label [digest]`, where the digest covers
//! the planned rule's full content. [`Renderer::summarize`] reduces documents
//! (rendered or dumped from the live system) to the policy lines and comments,
//! which is what verification and idempotence checks compare.

pub mod firewalld;
pub mod iptables;
pub mod nftables;
pub mod ufw;

use crate::core::error::{Error, Result};
use crate::core::model::{Action, Chain, Family, Protocol};
use crate::core::plan::{Plan, PlannedRule};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use tracing::debug;

/// Supported firewall backends
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Nftables,
    Iptables,
    Firewalld,
    Ufw,
}

/// One named native document (file content or load source)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub name: String,
    pub content: String,
}

impl Document {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }
}

/// Output of a renderer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledArtifact {
    pub backend: BackendKind,
    pub documents: Vec<Document>,
    /// Read-only native commands that must succeed once the artifact is live
    pub verify_commands: Vec<Vec<String>>,
}

impl CompiledArtifact {
    pub fn document(&self, name: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.name == name)
    }

    /// All documents joined with name headers, for display and diffing.
    pub fn to_text(&self) -> String {
        join_documents(&self.documents)
    }
}

/// Joins documents into one text with `# <name>` headers.
pub fn join_documents(documents: &[Document]) -> String {
    let mut out = String::new();
    for doc in documents {
        let _ = writeln!(out, "# {}", doc.name);
        out.push_str(&doc.content);
        if !doc.content.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Backend-specific names the renderers need
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub nft_table: String,
    pub firewalld_zone: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            nft_table: "hostwall".to_string(),
            firewalld_zone: "public".to_string(),
        }
    }
}

pub trait Renderer: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Renders a plan into native documents.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Render`] if the backend cannot express the plan.
    fn render(&self, plan: &Plan) -> Result<CompiledArtifact>;

    /// Canonical lines describing the semantic content of native documents.
    ///
    /// Accepts both rendered documents and documents dumped from the live
    /// backend, so the two can be compared.
    fn summarize(&self, documents: &[Document]) -> Result<Vec<String>>;

    /// SHA-256 over the summary.
    fn fingerprint(&self, documents: &[Document]) -> Result<String> {
        let summary = self.summarize(documents)?;
        let mut hasher = Sha256::new();
        for line in &summary {
            hasher.update(line.as_bytes());
            hasher.update(b"\n");
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Creates the renderer for a backend.
pub fn renderer_for(kind: BackendKind, settings: &RenderSettings) -> Box<dyn Renderer> {
    match kind {
        BackendKind::Nftables => Box::new(nftables::NftablesRenderer::new(&settings.nft_table)),
        BackendKind::Iptables => Box::new(iptables::IptablesRenderer),
        BackendKind::Firewalld => {
            Box::new(firewalld::FirewalldRenderer::new(&settings.firewalld_zone))
        }
        BackendKind::Ufw => Box::new(ufw::UfwRenderer),
    }
}

/// Renders one plan for several backends in parallel.
///
/// Results keep the order of `kinds`.
pub fn render_all(
    plan: &Plan,
    kinds: &[BackendKind],
    settings: &RenderSettings,
) -> Vec<(BackendKind, Result<CompiledArtifact>)> {
    kinds
        .par_iter()
        .map(|&kind| (kind, renderer_for(kind, settings).render(plan)))
        .collect()
}

/// Checks shared by every renderer before any output is produced.
///
/// # Errors
///
/// Returns [`Error::Render`] for ICMP rules with ports, and for a chain whose
/// policy is not accept but which would have no rules at all for a family.
pub fn preflight(plan: &Plan) -> Result<()> {
    for rule in &plan.rules {
        if rule
            .l4
            .iter()
            .any(|m| m.protocol == Protocol::Icmp && !m.ports.is_empty())
        {
            return Err(Error::Render(format!(
                "rule '{}': protocol icmp cannot be combined with ports",
                rule.name
            )));
        }
    }

    for policy in &plan.policies {
        if policy.action == Action::Accept || !plan.families.contains(&policy.family) {
            continue;
        }
        let has_rules = plan.wants_base_rules(policy.chain, policy.family)
            || plan
                .chain_rules(policy.chain)
                .any(|r| r.applies_to(policy.family));
        if !has_rules {
            return Err(Error::Render(format!(
                "chain {} has policy {} for {} but no rules; add a rule or enable base_rules",
                policy.chain, policy.action, policy.family
            )));
        }
    }

    debug!("Preflight passed for {} rules", plan.rules.len());
    Ok(())
}

/// Comment text for a planned rule: sanitized label plus a content digest.
pub fn rule_tag(rule: &PlannedRule) -> String {
    let body = serde_json::to_string(rule).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{} [{}]", rule.label(), &digest[..8])
}

/// Comment for rules the engine adds on its own (base and terminal rules).
pub(crate) fn internal_tag(what: &str) -> String {
    format!("hostwall: {what}")
}

/// Native policy of a chain shared by both families: accept only if both accept.
pub(crate) fn shared_policy(plan: &Plan, chain: Chain) -> Action {
    if Family::CONCRETE
        .iter()
        .all(|&f| plan.policy(chain, f) == Action::Accept)
    {
        Action::Accept
    } else {
        Action::Drop
    }
}

/// The policy both families agree on, or a render error naming the chain.
pub(crate) fn uniform_policy(plan: &Plan, chain: Chain, backend: BackendKind) -> Result<Action> {
    let v4 = plan.policy(chain, Family::Ip4);
    let v6 = plan.policy(chain, Family::Ip6);
    if v4 == v6 {
        Ok(v4)
    } else {
        Err(Error::Render(format!(
            "{backend} cannot express different {chain} policies for ip4 ({v4}) and ip6 ({v6})"
        )))
    }
}
