//! nftables JSON batch renderer
//!
//! The artifact is a single `nft -j -f -` batch that creates (or reuses) the
//! managed `inet` table, flushes it, declares the three base chains and adds
//! every rule. nft applies a batch as one transaction, so a failing batch
//! leaves the previous table untouched.
//!
//! An `inet` chain has one policy for both families. When the families
//! disagree the chain policy is `drop` and trailing `meta nfproto` rules
//! express the per-family verdicts.

use super::{
    BackendKind, CompiledArtifact, Document, Renderer, internal_tag, preflight, rule_tag,
    shared_policy,
};
use crate::core::error::{Error, Result};
use crate::core::model::{Action, Chain, Family, PortRange, Protocol};
use crate::core::plan::{AddressMatch, AddressSide, L4Match, Plan, PlannedRule, RuleOrigin};
use ipnetwork::IpNetwork;
use serde_json::{Value, json};
use std::collections::BTreeMap;

/// Name of the single document in an nftables artifact
pub const DOCUMENT: &str = "ruleset.json";

/// Base chain priority, ahead of most distribution tables
const CHAIN_PRIORITY: i32 = -10;

const CHAINS: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];

pub struct NftablesRenderer {
    table: String,
}

impl NftablesRenderer {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    // ═══════════════════════════════════════════════════════════════════════
    // JSON helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn table_object(&self) -> Value {
        json!({ "family": "inet", "name": self.table })
    }

    fn rule_add(&self, chain: Chain, expr: Vec<Value>, comment: &str) -> Value {
        json!({
            "add": {
                "rule": {
                    "family": "inet",
                    "table": self.table,
                    "chain": chain.as_str(),
                    "expr": expr,
                    "comment": comment
                }
            }
        })
    }

    fn match_expr(left: Value, right: Value) -> Value {
        json!({ "match": { "left": left, "op": "==", "right": right } })
    }

    fn meta_match(key: &str, value: impl serde::Serialize) -> Value {
        Self::match_expr(json!({ "meta": { "key": key } }), json!(value))
    }

    fn nfproto(family: Family) -> Value {
        let proto = if family == Family::Ip6 { "ipv6" } else { "ipv4" };
        Self::meta_match("nfproto", proto)
    }

    fn verdict(action: Action) -> Value {
        match action {
            Action::Accept => json!({ "accept": null }),
            Action::Drop => json!({ "drop": null }),
            Action::Reject => json!({ "reject": null }),
        }
    }

    fn ports_value(ports: &[PortRange]) -> Value {
        let element = |r: &PortRange| {
            if r.is_single() {
                json!(r.start)
            } else {
                json!({ "range": [r.start, r.end] })
            }
        };
        match ports {
            [single] => element(single),
            many => json!({ "set": many.iter().map(element).collect::<Vec<_>>() }),
        }
    }

    fn address_value(networks: &[IpNetwork]) -> Value {
        let prefix = |n: &IpNetwork| {
            json!({ "prefix": { "addr": n.network().to_string(), "len": n.prefix() } })
        };
        match networks {
            [single] => prefix(single),
            many => json!({ "set": many.iter().map(prefix).collect::<Vec<_>>() }),
        }
    }

    fn l4_exprs(m: &L4Match, family: Option<Family>) -> Vec<Value> {
        match m.protocol {
            Protocol::Any => Vec::new(),
            Protocol::Icmp => {
                let proto = match family {
                    Some(Family::Ip4) => json!("icmp"),
                    Some(Family::Ip6) => json!("ipv6-icmp"),
                    _ => json!({ "set": ["icmp", "ipv6-icmp"] }),
                };
                vec![Self::meta_match("l4proto", proto)]
            }
            Protocol::Tcp | Protocol::Udp => {
                let mut exprs = vec![Self::meta_match("l4proto", m.protocol.as_str())];
                if !m.ports.is_empty() {
                    exprs.push(Self::match_expr(
                        json!({ "payload": { "protocol": m.protocol.as_str(), "field": "dport" } }),
                        Self::ports_value(&m.ports),
                    ));
                }
                exprs
            }
        }
    }

    /// Address buckets of a rule: `(family restriction, networks)`.
    fn buckets(rule: &PlannedRule) -> Vec<(Option<Family>, Option<Vec<IpNetwork>>)> {
        match &rule.addresses {
            AddressMatch::Any => match rule.family {
                Family::Inet => vec![(None, None)],
                family => vec![(Some(family), None)],
            },
            AddressMatch::Networks(_) => Family::CONCRETE
                .iter()
                .filter_map(|&family| {
                    let nets = rule.addresses.for_family(family)?;
                    (!nets.is_empty()).then_some((Some(family), Some(nets)))
                })
                .collect(),
        }
    }

    fn add_planned_rule(&self, batch: &mut Vec<Value>, rule: &PlannedRule) {
        let comment = rule_tag(rule);

        for (family, networks) in Self::buckets(rule) {
            for m in &rule.l4 {
                let mut expr = Vec::with_capacity(6);

                match (&networks, family) {
                    (Some(nets), Some(f)) => {
                        let field = match rule.side {
                            AddressSide::Source => "saddr",
                            AddressSide::Destination => "daddr",
                        };
                        let proto = if f == Family::Ip6 { "ip6" } else { "ip" };
                        expr.push(Self::match_expr(
                            json!({ "payload": { "protocol": proto, "field": field } }),
                            Self::address_value(nets),
                        ));
                    }
                    (None, Some(f)) => expr.push(Self::nfproto(f)),
                    _ => {}
                }

                if let Some(iface) = &rule.interface {
                    let key = if rule.chain == Chain::Output { "oifname" } else { "iifname" };
                    expr.push(Self::meta_match(key, iface));
                }

                expr.extend(Self::l4_exprs(m, family));
                expr.push(Self::verdict(rule.action));
                batch.push(self.rule_add(rule.chain, expr, &comment));
            }
        }
    }

    fn add_base_rules(&self, batch: &mut Vec<Value>, plan: &Plan, chain: Chain) {
        let families: Vec<Family> = Family::CONCRETE
            .into_iter()
            .filter(|&f| plan.wants_base_rules(chain, f))
            .collect();
        let scope = match families.as_slice() {
            [] => return,
            [only] => Some(Self::nfproto(*only)),
            _ => None,
        };

        let loopback = match chain {
            Chain::Input => Some("iifname"),
            Chain::Output => Some("oifname"),
            Chain::Forward => None,
        };
        if let Some(key) = loopback {
            let mut expr: Vec<Value> = scope.iter().cloned().collect();
            expr.push(Self::meta_match(key, "lo"));
            expr.push(Self::verdict(Action::Accept));
            batch.push(self.rule_add(chain, expr, &internal_tag("loopback")));
        }

        let mut expr: Vec<Value> = scope.into_iter().collect();
        expr.push(Self::match_expr(
            json!({ "ct": { "key": "state" } }),
            json!({ "set": ["established", "related"] }),
        ));
        expr.push(Self::verdict(Action::Accept));
        batch.push(self.rule_add(chain, expr, &internal_tag("established")));
    }

    fn add_terminal_rules(&self, batch: &mut Vec<Value>, plan: &Plan, chain: Chain) {
        let native = shared_policy(plan, chain);
        for family in Family::CONCRETE {
            let action = plan.policy(chain, family);
            if action == native {
                continue;
            }
            let verdict = match action {
                Action::Reject => json!({ "reject": { "type": "icmpx", "expr": "admin-prohibited" } }),
                other => Self::verdict(other),
            };
            batch.push(self.rule_add(
                chain,
                vec![Self::nfproto(family), verdict],
                &internal_tag(&format!("{family} policy {action}")),
            ));
        }
    }

    /// Builds the full JSON batch.
    pub fn to_batch(&self, plan: &Plan) -> Value {
        let mut batch = Vec::with_capacity(8 + plan.rules.len() * 2);

        batch.push(json!({ "add": { "table": self.table_object() } }));
        batch.push(json!({ "flush": { "table": self.table_object() } }));

        for chain in CHAINS {
            batch.push(json!({
                "add": {
                    "chain": {
                        "family": "inet",
                        "table": self.table,
                        "name": chain.as_str(),
                        "type": "filter",
                        "hook": chain.as_str(),
                        "prio": CHAIN_PRIORITY,
                        "policy": shared_policy(plan, chain).as_str()
                    }
                }
            }));
        }

        for chain in CHAINS {
            for rule in plan
                .chain_rules(chain)
                .filter(|r| r.origin == RuleOrigin::Guard)
            {
                self.add_planned_rule(&mut batch, rule);
            }
            self.add_base_rules(&mut batch, plan, chain);
            for rule in plan
                .chain_rules(chain)
                .filter(|r| r.origin == RuleOrigin::User)
            {
                self.add_planned_rule(&mut batch, rule);
            }
            self.add_terminal_rules(&mut batch, plan, chain);
        }

        json!({ "nftables": batch })
    }

    fn belongs_to_table(&self, object: &Value) -> bool {
        object.get("family").and_then(Value::as_str) == Some("inet")
            && object.get("table").and_then(Value::as_str) == Some(self.table.as_str())
    }
}

impl Renderer for NftablesRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Nftables
    }

    fn render(&self, plan: &Plan) -> Result<CompiledArtifact> {
        preflight(plan)?;
        let batch = self.to_batch(plan);
        Ok(CompiledArtifact {
            backend: BackendKind::Nftables,
            documents: vec![Document::new(DOCUMENT, serde_json::to_string_pretty(&batch)?)],
            verify_commands: vec![vec![
                "nft".to_string(),
                "list".to_string(),
                "table".to_string(),
                "inet".to_string(),
                self.table.clone(),
            ]],
        })
    }

    /// Handles both batches (`{"add": {"rule": ...}}`) and listings (`{"rule": ...}`).
    fn summarize(&self, documents: &[Document]) -> Result<Vec<String>> {
        let mut chains: BTreeMap<String, (String, Vec<String>)> = BTreeMap::new();

        for doc in documents {
            if doc.content.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&doc.content)?;
            let items = value
                .get("nftables")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    Error::Internal(format!("{}: missing nftables array", doc.name))
                })?;

            for item in items {
                let item = item.get("add").unwrap_or(item);

                if let Some(chain) = item.get("chain").filter(|c| self.belongs_to_table(c)) {
                    let name = chain.get("name").and_then(Value::as_str).unwrap_or("?");
                    let policy = chain.get("policy").and_then(Value::as_str).unwrap_or("none");
                    chains.entry(name.to_string()).or_default().0 = policy.to_string();
                } else if let Some(rule) = item.get("rule").filter(|r| self.belongs_to_table(r)) {
                    let chain = rule.get("chain").and_then(Value::as_str).unwrap_or("?");
                    let comment = rule
                        .get("comment")
                        .and_then(Value::as_str)
                        .unwrap_or("<uncommented>");
                    chains
                        .entry(chain.to_string())
                        .or_default()
                        .1
                        .push(comment.to_string());
                }
            }
        }

        let mut lines = Vec::new();
        for (name, (policy, comments)) in chains {
            lines.push(format!("chain {name} policy {policy}"));
            lines.extend(comments.into_iter().map(|c| format!("{name}: {c}")));
        }
        Ok(lines)
    }
}
