//! iptables-restore renderer
//!
//! Produces `rules.v4` and `rules.v6` for `iptables-restore` and
//! `ip6tables-restore`. Each file replaces the whole `filter` table in one
//! commit. iptables has no named sets, so groups and services are expanded
//! into one line per address, protocol and port range.

use super::{BackendKind, CompiledArtifact, Document, Renderer, internal_tag, preflight, rule_tag};
use crate::core::error::Result;
use crate::core::model::{Action, Chain, Family, Protocol};
use crate::core::plan::{AddressSide, Plan, PlannedRule, RuleOrigin};
use std::fmt::Write;

pub const DOCUMENT_V4: &str = "rules.v4";
pub const DOCUMENT_V6: &str = "rules.v6";

const CHAINS: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];

pub struct IptablesRenderer;

/// Native chain name
fn chain_name(chain: Chain) -> &'static str {
    match chain {
        Chain::Input => "INPUT",
        Chain::Forward => "FORWARD",
        Chain::Output => "OUTPUT",
    }
}

pub(crate) fn target(action: Action) -> &'static str {
    match action {
        Action::Accept => "ACCEPT",
        Action::Drop => "DROP",
        Action::Reject => "REJECT",
    }
}

/// Document name for a concrete family
pub fn document_for(family: Family) -> &'static str {
    if family == Family::Ip6 {
        DOCUMENT_V6
    } else {
        DOCUMENT_V4
    }
}

/// One expanded `-A` line with the match values it was built from
pub(crate) struct RuleLine {
    pub address: Option<String>,
    pub protocol: Protocol,
    pub port: Option<String>,
    pub text: String,
}

/// Expands a planned rule into `-A` lines for one family (shared with ufw).
pub(crate) fn rule_lines(
    rule: &PlannedRule,
    family: Family,
    chain: &str,
    comment: &str,
) -> Vec<RuleLine> {
    let addresses: Vec<Option<String>> = match rule.addresses.for_family(family) {
        None => vec![None],
        Some(nets) => nets.iter().map(|n| Some(n.to_string())).collect(),
    };
    let address_flag = match rule.side {
        AddressSide::Source => "-s",
        AddressSide::Destination => "-d",
    };
    let interface_flag = if rule.chain == Chain::Output { "-o" } else { "-i" };

    let mut lines = Vec::new();
    for address in &addresses {
        for m in &rule.l4 {
            let ports: Vec<Option<String>> = if m.ports.is_empty() {
                vec![None]
            } else {
                m.ports
                    .iter()
                    .map(|r| {
                        Some(if r.is_single() {
                            r.start.to_string()
                        } else {
                            format!("{}:{}", r.start, r.end)
                        })
                    })
                    .collect()
            };

            for port in ports {
                let mut text = format!("-A {chain}");
                if let Some(iface) = &rule.interface {
                    let _ = write!(text, " {interface_flag} {iface}");
                }
                if let Some(addr) = address {
                    let _ = write!(text, " {address_flag} {addr}");
                }
                match m.protocol {
                    Protocol::Any => {}
                    Protocol::Icmp => {
                        let proto = if family == Family::Ip6 { "ipv6-icmp" } else { "icmp" };
                        let _ = write!(text, " -p {proto}");
                    }
                    Protocol::Tcp | Protocol::Udp => {
                        let proto = m.protocol.as_str();
                        let _ = write!(text, " -p {proto}");
                        if let Some(port) = &port {
                            let _ = write!(text, " -m {proto} --dport {port}");
                        }
                    }
                }
                let _ = write!(
                    text,
                    " -m comment --comment \"{comment}\" -j {}",
                    target(rule.action)
                );
                lines.push(RuleLine {
                    address: address.clone(),
                    protocol: m.protocol,
                    port,
                    text,
                });
            }
        }
    }
    lines
}

impl IptablesRenderer {
    fn render_family(plan: &Plan, family: Family) -> String {
        let mut out = String::new();
        out.push_str("*filter\n");

        // REJECT is not a valid built-in policy: use DROP plus a trailing rule
        for chain in CHAINS {
            let policy = match plan.policy(chain, family) {
                Action::Reject => Action::Drop,
                action => action,
            };
            let _ = writeln!(out, ":{} {} [0:0]", chain_name(chain), target(policy));
        }

        for chain in CHAINS {
            let name = chain_name(chain);
            let rules_of = move |origin: RuleOrigin| {
                plan.chain_rules(chain)
                    .filter(move |r| r.origin == origin && r.applies_to(family))
            };

            for rule in rules_of(RuleOrigin::Guard) {
                for line in rule_lines(rule, family, name, &rule_tag(rule)) {
                    let _ = writeln!(out, "{}", line.text);
                }
            }

            if plan.wants_base_rules(chain, family) {
                match chain {
                    Chain::Input => {
                        let _ = writeln!(
                            out,
                            "-A INPUT -i lo -m comment --comment \"{}\" -j ACCEPT",
                            internal_tag("loopback")
                        );
                    }
                    Chain::Output => {
                        let _ = writeln!(
                            out,
                            "-A OUTPUT -o lo -m comment --comment \"{}\" -j ACCEPT",
                            internal_tag("loopback")
                        );
                    }
                    Chain::Forward => {}
                }
                let _ = writeln!(
                    out,
                    "-A {name} -m conntrack --ctstate RELATED,ESTABLISHED -m comment --comment \"{}\" -j ACCEPT",
                    internal_tag("established")
                );
            }

            for rule in rules_of(RuleOrigin::User) {
                for line in rule_lines(rule, family, name, &rule_tag(rule)) {
                    let _ = writeln!(out, "{}", line.text);
                }
            }

            if plan.policy(chain, family) == Action::Reject {
                let _ = writeln!(
                    out,
                    "-A {name} -m comment --comment \"{}\" -j REJECT",
                    internal_tag(&format!("{family} policy reject"))
                );
            }
        }

        out.push_str("COMMIT\n");
        out
    }
}

impl Renderer for IptablesRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Iptables
    }

    fn render(&self, plan: &Plan) -> Result<CompiledArtifact> {
        preflight(plan)?;
        Ok(CompiledArtifact {
            backend: BackendKind::Iptables,
            documents: Family::CONCRETE
                .iter()
                .map(|&f| Document::new(document_for(f), Self::render_family(plan, f)))
                .collect(),
            verify_commands: vec![
                vec!["iptables".into(), "-S".into(), "INPUT".into()],
                vec!["ip6tables".into(), "-S".into(), "INPUT".into()],
            ],
        })
    }

    fn summarize(&self, documents: &[Document]) -> Result<Vec<String>> {
        Ok(documents
            .iter()
            .flat_map(|doc| {
                summarize_restore_file(&doc.content, |chain| {
                    matches!(chain, "INPUT" | "FORWARD" | "OUTPUT")
                })
                .into_iter()
                .map(move |line| format!("{}: {line}", doc.name))
            })
            .collect())
    }
}

/// Extracts the comment of an `-A` line, quoted or not.
pub(crate) fn comment_of(line: &str) -> Option<&str> {
    let rest = line.split_once("--comment ")?.1;
    if let Some(quoted) = rest.strip_prefix('"') {
        quoted.split_once('"').map(|(c, _)| c)
    } else {
        rest.split_whitespace().next()
    }
}

/// Policies and rule comments of the `filter` table in a save/restore file.
///
/// `builtin` selects which `:CHAIN POLICY` lines count. Rules without a
/// comment are reported as `<uncommented>` so foreign rules still show up.
pub(crate) fn summarize_restore_file(content: &str, builtin: impl Fn(&str) -> bool) -> Vec<String> {
    let mut in_filter = false;
    let mut lines = Vec::new();

    for line in content.lines().map(str::trim) {
        if let Some(table) = line.strip_prefix('*') {
            in_filter = table == "filter";
            continue;
        }
        if !in_filter {
            continue;
        }

        if let Some(decl) = line.strip_prefix(':') {
            let mut parts = decl.split_whitespace();
            if let (Some(chain), Some(policy)) = (parts.next(), parts.next())
                && builtin(chain)
            {
                lines.push(format!("policy {chain} {policy}"));
            }
        } else if let Some(rule) = line.strip_prefix("-A ") {
            let chain = rule.split_whitespace().next().unwrap_or("?");
            let comment = comment_of(line).unwrap_or("<uncommented>");
            lines.push(format!("{chain} {comment}"));
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guard::ensure_management_access;
    use crate::core::model::{DefaultPolicy, PortSpec, Rule, RuleSet, Source, Target};

    fn render(ruleset: &RuleSet) -> CompiledArtifact {
        let plan = ensure_management_access(ruleset).unwrap();
        IptablesRenderer.render(&plan).unwrap()
    }

    fn policy(ruleset: &mut RuleSet, chain: Chain, family: Family, action: Action) {
        ruleset.default_policies.push(DefaultPolicy {
            chain,
            family,
            action,
        });
    }

    #[test]
    fn test_restore_file_layout() {
        let mut ruleset = RuleSet::new();
        policy(&mut ruleset, Chain::Input, Family::Inet, Action::Drop);
        let artifact = render(&ruleset);
        let v4 = &artifact.document(DOCUMENT_V4).unwrap().content;

        let lines: Vec<_> = v4.lines().collect();
        assert_eq!(lines[0], "*filter");
        assert_eq!(lines[1], ":INPUT DROP [0:0]");
        assert_eq!(lines[2], ":FORWARD ACCEPT [0:0]");
        assert_eq!(lines[3], ":OUTPUT ACCEPT [0:0]");
        assert!(lines[4].starts_with("-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"ssh-guard: do not remove ["));
        assert!(lines[5].starts_with("-A INPUT -i lo"));
        assert!(lines[6].contains("--ctstate RELATED,ESTABLISHED"));
        assert_eq!(*lines.last().unwrap(), "COMMIT");
    }

    #[test]
    fn test_reject_policy_becomes_drop_plus_rule() {
        let mut ruleset = RuleSet::new();
        ruleset.ssh_guard = false;
        policy(&mut ruleset, Chain::Output, Family::Ip6, Action::Reject);
        let artifact = render(&ruleset);

        let v6 = &artifact.document(DOCUMENT_V6).unwrap().content;
        assert!(v6.contains(":OUTPUT DROP [0:0]"));
        assert!(v6.contains("-A OUTPUT -m comment --comment \"hostwall: ip6 policy reject\" -j REJECT"));

        let v4 = &artifact.document(DOCUMENT_V4).unwrap().content;
        assert!(v4.contains(":OUTPUT ACCEPT [0:0]"));
        assert!(!v4.contains("REJECT"));
    }

    #[test]
    fn test_sources_expand_per_family() {
        let mut ruleset = RuleSet::new();
        ruleset.ssh_guard = false;
        let mut rule = Rule::new("db");
        rule.sources.push(Source::Cidr("10.0.0.0/8".into()));
        rule.sources.push(Source::Cidr("172.16.0.0/12".into()));
        rule.targets.push(Target::Port(PortSpec::new("5432")));
        rule.targets.push(Target::Port(PortSpec::new("6000-6010")));
        ruleset.rules.push(rule);
        let artifact = render(&ruleset);

        let v4 = &artifact.document(DOCUMENT_V4).unwrap().content;
        let rules: Vec<_> = v4.lines().filter(|l| l.starts_with("-A")).collect();
        assert_eq!(rules.len(), 4);
        assert!(rules[0].contains("-s 10.0.0.0/8 -p tcp -m tcp --dport 5432"));
        assert!(rules[1].contains("-s 10.0.0.0/8 -p tcp -m tcp --dport 6000:6010"));
        assert!(rules[2].contains("-s 172.16.0.0/12"));

        let v6 = &artifact.document(DOCUMENT_V6).unwrap().content;
        assert!(!v6.contains("-A INPUT"));
    }

    #[test]
    fn test_icmp_protocol_per_family() {
        let mut ruleset = RuleSet::new();
        ruleset.ssh_guard = false;
        let mut ping = Rule::new("ping");
        ping.protocol = Protocol::Icmp;
        ruleset.rules.push(ping);
        let artifact = render(&ruleset);

        assert!(artifact.document(DOCUMENT_V4).unwrap().content.contains("-p icmp -m comment"));
        assert!(artifact.document(DOCUMENT_V6).unwrap().content.contains("-p ipv6-icmp -m comment"));
    }

    #[test]
    fn test_summary_matches_save_output() {
        let mut ruleset = RuleSet::new();
        policy(&mut ruleset, Chain::Input, Family::Inet, Action::Drop);
        let artifact = render(&ruleset);
        let renderer = IptablesRenderer;

        // iptables-save adds a header, counters and a nat table we do not manage
        let saved: Vec<Document> = artifact
            .documents
            .iter()
            .map(|d| {
                let body = d.content.replace("[0:0]", "[1042:88211]");
                Document::new(
                    d.name.clone(),
                    format!("# Generated by iptables-save v1.8.10\n*nat\n:PREROUTING ACCEPT [0:0]\n-A PREROUTING -j DOCKER\nCOMMIT\n{body}# Completed\n"),
                )
            })
            .collect();

        let expected = renderer.summarize(&artifact.documents).unwrap();
        assert_eq!(renderer.summarize(&saved).unwrap(), expected);
        assert!(expected.contains(&"rules.v4: policy INPUT DROP".to_string()));
    }

    #[test]
    fn test_comment_of() {
        assert_eq!(comment_of("-A INPUT -m comment --comment \"a b [1]\" -j ACCEPT"), Some("a b [1]"));
        assert_eq!(comment_of("-A INPUT -m comment --comment plain -j ACCEPT"), Some("plain"));
        assert_eq!(comment_of("-A INPUT -j ACCEPT"), None);
    }
}
