//! firewalld zone renderer
//!
//! The artifact is the complete permanent configuration of one zone
//! (`<zone>.xml`). Rules become rich rules with explicit, strictly increasing
//! priorities so firewalld evaluates them in plan order. The zone target
//! carries the input policy.
//!
//! firewalld zones only filter inbound traffic and cannot match interfaces per
//! rule, so such plans are rejected rather than approximated.

use super::{BackendKind, CompiledArtifact, Document, Renderer, preflight, rule_tag, uniform_policy};
use crate::core::error::{Error, Result};
use crate::core::model::{Action, Chain, Family, Protocol};
use crate::core::plan::{AddressMatch, AddressSide, Plan, PlannedRule};
use std::fmt::Write;

/// Rich rule priority of the first emitted rule
const FIRST_PRIORITY: i32 = -32000;

pub struct FirewalldRenderer {
    zone: String,
}

impl FirewalldRenderer {
    pub fn new(zone: &str) -> Self {
        Self {
            zone: zone.to_string(),
        }
    }

    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// File name of the zone document
    pub fn document_name(&self) -> String {
        format!("{}.xml", self.zone)
    }

    fn check_expressible(plan: &Plan) -> Result<Action> {
        for chain in [Chain::Forward, Chain::Output] {
            if uniform_policy(plan, chain, BackendKind::Firewalld)? != Action::Accept {
                return Err(Error::Render(format!(
                    "firewalld zones cannot express a non-accept {chain} policy"
                )));
            }
        }

        if let Some(rule) = plan.rules.iter().find(|r| r.chain != Chain::Input) {
            return Err(Error::Render(format!(
                "rule '{}': firewalld zones only filter the input chain",
                rule.name
            )));
        }
        if let Some(rule) = plan.rules.iter().find(|r| r.interface.is_some()) {
            return Err(Error::Render(format!(
                "rule '{}': firewalld rich rules cannot match an interface",
                rule.name
            )));
        }

        uniform_policy(plan, Chain::Input, BackendKind::Firewalld)
    }

    fn zone_target(policy: Action) -> &'static str {
        match policy {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "%%REJECT%%",
        }
    }

    fn family_attr(family: Family) -> &'static str {
        if family == Family::Ip6 { "ipv6" } else { "ipv4" }
    }

    /// Rich rule bodies (without priority) for one planned rule.
    fn rich_rules(rule: &PlannedRule) -> Vec<(Option<Family>, String)> {
        let scopes: Vec<(Option<Family>, Option<String>)> = match &rule.addresses {
            AddressMatch::Any => match rule.family {
                Family::Inet => vec![(None, None)],
                family => vec![(Some(family), None)],
            },
            AddressMatch::Networks(_) => Family::CONCRETE
                .iter()
                .flat_map(|&family| {
                    rule.addresses
                        .for_family(family)
                        .unwrap_or_default()
                        .into_iter()
                        .map(move |net| (Some(family), Some(net.to_string())))
                })
                .collect(),
        };
        let address_element = match rule.side {
            AddressSide::Source => "source",
            AddressSide::Destination => "destination",
        };
        let action = match rule.action {
            Action::Accept => "<accept/>",
            Action::Drop => "<drop/>",
            Action::Reject => "<reject/>",
        };

        let mut out = Vec::new();
        for (family, address) in &scopes {
            for m in &rule.l4 {
                let mut matches: Vec<String> = Vec::new();
                match m.protocol {
                    Protocol::Any => {}
                    Protocol::Icmp => {
                        let value = if *family == Some(Family::Ip6) { "ipv6-icmp" } else { "icmp" };
                        matches.push(format!("<protocol value=\"{value}\"/>"));
                    }
                    Protocol::Tcp | Protocol::Udp if m.ports.is_empty() => {
                        matches.push(format!("<protocol value=\"{}\"/>", m.protocol));
                    }
                    Protocol::Tcp | Protocol::Udp => {
                        for range in &m.ports {
                            matches.push(format!(
                                "<port port=\"{range}\" protocol=\"{}\"/>",
                                m.protocol
                            ));
                        }
                    }
                }
                if matches.is_empty() {
                    matches.push(String::new());
                }

                for element in matches {
                    let mut body = String::new();
                    if let Some(addr) = address {
                        let _ = writeln!(body, "    <{address_element} address=\"{addr}\"/>");
                    }
                    if !element.is_empty() {
                        let _ = writeln!(body, "    {element}");
                    }
                    let _ = writeln!(body, "    {action}");
                    out.push((*family, body));
                }
            }
        }
        out
    }

    fn render_zone(&self, plan: &Plan, policy: Action) -> String {
        let mut out = String::new();
        out.push_str("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        let _ = writeln!(out, "<zone target=\"{}\">", Self::zone_target(policy));
        out.push_str("  <short>hostwall</short>\n");
        let _ = writeln!(
            out,
            "  <description>Zone {} managed by hostwall</description>",
            self.zone
        );

        let mut priority = FIRST_PRIORITY;
        // Plan order already places guard rules first
        for rule in &plan.rules {
            let comment = xml_comment(&rule_tag(rule));
            for (family, body) in Self::rich_rules(rule) {
                let _ = writeln!(out, "  <!-- {comment} -->");
                match family {
                    Some(f) => {
                        let _ = writeln!(
                            out,
                            "  <rule family=\"{}\" priority=\"{priority}\">",
                            Self::family_attr(f)
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  <rule priority=\"{priority}\">");
                    }
                }
                out.push_str(&body);
                out.push_str("  </rule>\n");
                priority += 1;
            }
        }

        out.push_str("</zone>\n");
        out
    }
}

/// XML comments may not contain `--`.
fn xml_comment(text: &str) -> String {
    let mut out = text.to_string();
    while out.contains("--") {
        out = out.replace("--", "-");
    }
    out
}

impl Renderer for FirewalldRenderer {
    fn backend(&self) -> BackendKind {
        BackendKind::Firewalld
    }

    fn render(&self, plan: &Plan) -> Result<CompiledArtifact> {
        preflight(plan)?;
        let policy = Self::check_expressible(plan)?;
        Ok(CompiledArtifact {
            backend: BackendKind::Firewalld,
            documents: vec![Document::new(
                self.document_name(),
                self.render_zone(plan, policy),
            )],
            verify_commands: vec![
                vec!["firewall-cmd".into(), "--state".into()],
                vec![
                    "firewall-cmd".into(),
                    format!("--zone={}", self.zone),
                    "--list-rich-rules".into(),
                ],
            ],
        })
    }

    /// The zone file is written verbatim, so its trimmed lines are the summary.
    fn summarize(&self, documents: &[Document]) -> Result<Vec<String>> {
        Ok(documents
            .iter()
            .flat_map(|d| d.content.lines())
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guard::ensure_management_access;
    use crate::core::model::{DefaultPolicy, PortSpec, Rule, RuleSet, Source, Target};

    fn renderer() -> FirewalldRenderer {
        FirewalldRenderer::new("public")
    }

    fn drop_input() -> RuleSet {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(DefaultPolicy {
            chain: Chain::Input,
            family: Family::Inet,
            action: Action::Drop,
        });
        ruleset
    }

    fn render(ruleset: &RuleSet) -> Result<CompiledArtifact> {
        renderer().render(&ensure_management_access(ruleset)?)
    }

    #[test]
    fn test_zone_document() {
        let mut ruleset = drop_input();
        let mut web = Rule::new("web");
        web.sources.push(Source::Cidr("203.0.113.0/24".into()));
        web.targets.push(Target::Port(PortSpec::new("443")));
        ruleset.rules.push(web);

        let artifact = render(&ruleset).unwrap();
        assert_eq!(artifact.documents[0].name, "public.xml");
        let xml = &artifact.documents[0].content;

        assert!(xml.contains("<zone target=\"DROP\">"));
        assert!(xml.contains("<rule family=\"ipv4\" priority=\"-32000\">"));
        assert!(xml.contains("<rule family=\"ipv6\" priority=\"-31999\">"));
        assert!(xml.contains("<source address=\"203.0.113.0/24\"/>"));
        assert!(xml.contains("<port port=\"443\" protocol=\"tcp\"/>"));

        let guard = xml.find("ssh-guard").unwrap();
        let web = xml.find("<!-- web [").unwrap();
        assert!(guard < web);
    }

    #[test]
    fn test_reject_target() {
        let mut ruleset = RuleSet::new();
        ruleset.ssh_guard = false;
        ruleset.default_policies.push(DefaultPolicy {
            chain: Chain::Input,
            family: Family::Inet,
            action: Action::Reject,
        });
        let artifact = render(&ruleset).unwrap();
        assert!(artifact.documents[0].content.contains("target=\"%%REJECT%%\""));
    }

    #[test]
    fn test_rejects_unexpressible_plans() {
        let mut per_family = RuleSet::new();
        per_family.default_policies.push(DefaultPolicy {
            chain: Chain::Input,
            family: Family::Ip4,
            action: Action::Drop,
        });
        assert!(matches!(render(&per_family), Err(Error::Render(_))));

        let mut egress = RuleSet::new();
        egress.default_policies.push(DefaultPolicy {
            chain: Chain::Output,
            family: Family::Inet,
            action: Action::Drop,
        });
        assert!(matches!(render(&egress), Err(Error::Render(_))));

        let mut iface = RuleSet::new();
        let mut rule = Rule::new("lan");
        rule.interface = Some("eth1".into());
        iface.rules.push(rule);
        assert!(matches!(render(&iface), Err(Error::Render(_))));
    }

    #[test]
    fn test_any_protocol_without_ports_has_no_match_element() {
        let mut ruleset = RuleSet::new();
        ruleset.ssh_guard = false;
        let mut rule = Rule::new("trust-lan");
        rule.protocol = Protocol::Any;
        rule.sources.push(Source::Cidr("192.168.0.0/16".into()));
        ruleset.rules.push(rule);

        let xml = render(&ruleset).unwrap().documents[0].content.clone();
        assert!(xml.contains("<source address=\"192.168.0.0/16\"/>\n    <accept/>"));
    }

    #[test]
    fn test_xml_comment_escapes_double_dash() {
        assert_eq!(xml_comment("a--b---c"), "a-b-c");
    }
}
