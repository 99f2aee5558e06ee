//! ufw renderer
//!
//! ufw keeps user rules in `user.rules` / `user6.rules`, which it loads with
//! `iptables-restore` into its `ufw-user-*` chains, and default policies in
//! `/etc/default/ufw`. The artifact holds both rules files plus a
//! `ufw-defaults` document with the three `DEFAULT_*_POLICY` lines.
//!
//! Each rule line is preceded by the `### tuple ###` record ufw uses to list
//! and edit its rules. Loopback and established traffic are handled by ufw's
//! own `before.rules`, so no base rules are emitted.

use super::iptables::{rule_lines, summarize_restore_file};
use super::{BackendKind, CompiledArtifact, Document, Renderer, preflight, rule_tag, uniform_policy};
use crate::core::error::Result;
use crate::core::model::{Action, Chain, Family, Protocol};
use crate::core::plan::{AddressSide, Plan, PlannedRule};
use std::fmt::Write;

pub const DOCUMENT_V4: &str = "user.rules";
pub const DOCUMENT_V6: &str = "user6.rules";
pub const DOCUMENT_DEFAULTS: &str = "ufw-defaults";

pub struct UfwRenderer;

fn user_chain(chain: Chain) -> &'static str {
    match chain {
        Chain::Input => "ufw-user-input",
        Chain::Forward => "ufw-user-forward",
        Chain::Output => "ufw-user-output",
    }
}

/// Key in `/etc/default/ufw` holding a chain's default policy
pub fn policy_key(chain: Chain) -> &'static str {
    match chain {
        Chain::Input => "DEFAULT_INPUT_POLICY",
        Chain::Forward => "DEFAULT_FORWARD_POLICY",
        Chain::Output => "DEFAULT_OUTPUT_POLICY",
    }
}

/// Value of `key` in a shell-style defaults file; the last assignment wins.
fn assignment<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content
        .lines()
        .filter_map(|l| l.trim().strip_prefix(key)?.strip_prefix('='))
        .last()
}

/// Rewrites the `DEFAULT_*_POLICY` assignments of an `/etc/default/ufw` file
/// with those found in `wanted`. Every other line of `current` is kept, and
/// keys missing from `current` are appended.
pub fn merge_defaults(current: &str, wanted: &str) -> String {
    let values: Vec<(&str, &str)> = [Chain::Input, Chain::Output, Chain::Forward]
        .into_iter()
        .filter_map(|chain| {
            let key = policy_key(chain);
            assignment(wanted, key).map(|value| (key, value.trim()))
        })
        .collect();

    let mut out = String::with_capacity(current.len() + 96);
    let mut written: Vec<&str> = Vec::new();
    for line in current.lines() {
        let key = line.trim().split_once('=').map(|(k, _)| k);
        match values.iter().find(|(k, _)| Some(*k) == key) {
            Some(&(k, v)) => {
                let _ = writeln!(out, "{k}={v}");
                written.push(k);
            }
            None => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    for (k, v) in values.iter().filter(|(k, _)| !written.contains(k)) {
        let _ = writeln!(out, "{k}={v}");
    }
    out
}

fn hex(text: &str) -> String {
    text.bytes().fold(String::with_capacity(text.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

impl UfwRenderer {
    fn tuple(
        rule: &PlannedRule,
        family: Family,
        address: Option<&str>,
        protocol: Protocol,
        port: Option<&str>,
    ) -> String {
        let any = if family == Family::Ip6 { "::/0" } else { "0.0.0.0/0" };
        let verb = match rule.action {
            Action::Accept => "allow",
            Action::Drop => "deny",
            Action::Reject => "reject",
        };
        let verb = if rule.chain == Chain::Forward {
            format!("route:{verb}")
        } else {
            verb.to_string()
        };
        let (dst, src) = match rule.side {
            AddressSide::Source => (any, address.unwrap_or(any)),
            AddressSide::Destination => (address.unwrap_or(any), any),
        };
        let mut dir = if rule.chain == Chain::Output { "out" } else { "in" }.to_string();
        if let Some(iface) = &rule.interface {
            let _ = write!(dir, "_{iface}");
        }

        format!(
            "### tuple ### {verb} {protocol} {} {dst} any {src} {dir} comment={}",
            port.unwrap_or("any"),
            hex(&rule.label())
        )
    }

    fn render_rules(plan: &Plan, family: Family) -> String {
        let mut out = String::from("*filter\n");
        for chain in [Chain::Input, Chain::Output, Chain::Forward] {
            let _ = writeln!(out, ":{} - [0:0]", user_chain(chain));
        }
        out.push_str("### RULES ###\n");

        // Plan order already places guard rules first
        for rule in plan.rules.iter().filter(|r| r.applies_to(family)) {
            let comment = rule_tag(rule);
            for line in rule_lines(rule, family, user_chain(rule.chain), &comment) {
                out.push('\n');
                let _ = writeln!(
                    out,
                    "{}",
                    Self::tuple(
                        rule,
                        family,
                        line.address.as_deref(),
                        line.protocol,
                        line.port.as_deref()
                    )
                );
                let _ = writeln!(out, "{}", line.text);
            }
        }

        out.push_str("\n### END RULES ###\nCOMMIT\n");
        out
    }
}

impl Renderer for UfwRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Ufw
    }

    fn render(&self, plan: &Plan) -> Result<CompiledArtifact> {
        preflight(plan)?;

        let mut defaults = String::new();
        for chain in [Chain::Input, Chain::Output, Chain::Forward] {
            let policy = uniform_policy(plan, chain, BackendKind::Ufw)?;
            let key = policy_key(chain);
            let _ = writeln!(defaults, "{key}=\"{}\"", policy.as_str().to_uppercase());
        }

        Ok(CompiledArtifact {
            backend: BackendKind::Ufw,
            documents: vec![
                Document::new(DOCUMENT_V4, Self::render_rules(plan, Family::Ip4)),
                Document::new(DOCUMENT_V6, Self::render_rules(plan, Family::Ip6)),
                Document::new(DOCUMENT_DEFAULTS, defaults),
            ],
            verify_commands: vec![vec!["ufw".into(), "status".into()]],
        })
    }

    fn summarize(&self, documents: &[Document]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for doc in documents {
            if doc.name == DOCUMENT_DEFAULTS {
                // The live file carries other keys (DEFAULT_APPLICATION_POLICY, IPV6, ...)
                for chain in [Chain::Input, Chain::Output, Chain::Forward] {
                    let key = policy_key(chain);
                    if let Some(line) = doc
                        .content
                        .lines()
                        .map(str::trim)
                        .filter(|l| l.strip_prefix(key).is_some_and(|r| r.starts_with('=')))
                        .last()
                    {
                        lines.push(format!("{}: {line}", doc.name));
                    }
                }
            } else {
                lines.extend(
                    summarize_restore_file(&doc.content, |_| false)
                        .into_iter()
                        .map(|l| format!("{}: {l}", doc.name)),
                );
            }
        }
        Ok(lines)
    }
}
