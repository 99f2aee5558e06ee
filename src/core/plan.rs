//! Canonical intermediate form between the rule model and the renderers
//!
//! [`compile`] resolves every group and service reference into literal
//! networks and port ranges, drops `absent` rules, and orders rules by
//! priority with declaration order as the tie-break. Renderers consume the
//! resulting [`Plan`] and never look at the [`RuleSet`] again.
//!
//! [`evaluate`] runs first-match semantics over a plan for a single probe
//! packet. The SSH guard, the lockout check and the post-apply reachability
//! check are all built on it.

use crate::core::error::{Error, Result};
use crate::core::model::{
    Action, Chain, Direction, Family, PortRange, Protocol, Rule, RuleSet, Service, Source, Target,
};
use crate::core::validate::{Category, Finding};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Where a planned rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    User,
    /// Synthesized by the SSH guard; never part of the caller's ruleset
    Guard,
}

/// Packet field a planned rule's networks are matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressSide {
    Source,
    Destination,
}

/// Address side of a planned rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMatch {
    Any,
    /// Non-empty list matches only these networks; an empty list matches nothing
    Networks(Vec<IpNetwork>),
}

impl AddressMatch {
    /// Networks belonging to `family`; `None` means "no address restriction".
    pub fn for_family(&self, family: Family) -> Option<Vec<IpNetwork>> {
        match self {
            AddressMatch::Any => None,
            AddressMatch::Networks(nets) => Some(
                nets.iter()
                    .filter(|n| family.covers(Family::of(n)))
                    .copied()
                    .collect(),
            ),
        }
    }
}

/// One protocol with its (merged) destination ports; no ports means every port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L4Match {
    pub protocol: Protocol,
    pub ports: Vec<PortRange>,
}

impl L4Match {
    fn covers(&self, protocol: Protocol, port: u16) -> bool {
        match self.protocol {
            Protocol::Any if self.ports.is_empty() => true,
            p if p == protocol => {
                self.ports.is_empty() || self.ports.iter().any(|r| r.contains(port))
            }
            _ => false,
        }
    }
}

/// A fully resolved rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedRule {
    pub name: String,
    pub origin: RuleOrigin,
    pub family: Family,
    pub chain: Chain,
    pub side: AddressSide,
    pub addresses: AddressMatch,
    /// Empty means the rule matches nothing (e.g. a service with no ports
    /// for the rule's protocol)
    pub l4: Vec<L4Match>,
    pub action: Action,
    pub priority: i32,
    pub comment: Option<String>,
    pub interface: Option<String>,
}

impl PlannedRule {
    /// Label written into native comments.
    pub fn label(&self) -> String {
        crate::validators::sanitize_label(self.comment.as_deref().unwrap_or(&self.name))
    }

    /// Returns `true` if the rule can match any packet of `family`.
    pub fn applies_to(&self, family: Family) -> bool {
        if !self.family.covers(family) || self.l4.is_empty() {
            return false;
        }
        match self.addresses.for_family(family) {
            None => true,
            Some(nets) => !nets.is_empty(),
        }
    }
}

/// Default verdict of one chain for one concrete family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChainPolicy {
    pub chain: Chain,
    pub family: Family,
    pub action: Action,
}

/// Compiled, backend-neutral ruleset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// One entry per chain per concrete family, in chain order
    pub policies: Vec<ChainPolicy>,
    /// Evaluation order: guard rules first, then user rules by priority
    pub rules: Vec<PlannedRule>,
    pub base_rules: bool,
    pub families: Vec<Family>,
}

impl Plan {
    pub fn policy(&self, chain: Chain, family: Family) -> Action {
        self.policies
            .iter()
            .find(|p| p.chain == chain && p.family == family)
            .map_or(Action::Accept, |p| p.action)
    }

    /// Rules of one chain in evaluation order.
    pub fn chain_rules(&self, chain: Chain) -> impl Iterator<Item = &PlannedRule> {
        self.rules.iter().filter(move |r| r.chain == chain)
    }

    pub fn guard_rules(&self) -> impl Iterator<Item = &PlannedRule> {
        self.rules.iter().filter(|r| r.origin == RuleOrigin::Guard)
    }

    /// Returns `true` if base rules are emitted for `chain`/`family`.
    pub fn wants_base_rules(&self, chain: Chain, family: Family) -> bool {
        self.base_rules && self.policy(chain, family) != Action::Accept
    }
}

fn reference_error(rule: &str, message: String) -> Error {
    Error::Validation {
        findings: vec![Finding::error(Category::Reference, rule, message)],
    }
}

/// Ports a service resolves to, including catalogue lookups.
///
/// Entries that do not parse are skipped; validation reports them.
pub fn service_ports(_ruleset: &RuleSet, service: &Service) -> Vec<(PortRange, Protocol)> {
    if service.ports.is_empty() {
        return crate::core::model::well_known_service(&service.name)
            .map(|ports| {
                ports
                    .iter()
                    .map(|&(port, protocol)| (PortRange::single(port), protocol))
                    .collect()
            })
            .unwrap_or_default();
    }

    service
        .ports
        .iter()
        .filter_map(|entry| entry.port.parse().ok().map(|range| (range, entry.protocol)))
        .collect()
}

fn resolve_addresses(ruleset: &RuleSet, rule: &Rule) -> Result<AddressMatch> {
    if rule.sources.is_empty() || rule.sources.contains(&Source::Any) {
        return Ok(AddressMatch::Any);
    }

    let mut networks: Vec<IpNetwork> = Vec::new();
    let mut push = |net: IpNetwork| {
        if rule.family.covers(Family::of(&net)) && !networks.contains(&net) {
            networks.push(net);
        }
    };

    for source in &rule.sources {
        match source {
            Source::Any => {}
            Source::Cidr(cidr) => {
                let net = cidr
                    .parse::<IpNetwork>()
                    .map_err(|e| reference_error(&rule.name, format!("invalid CIDR '{cidr}': {e}")))?;
                push(net);
            }
            Source::Group(name) => {
                let group = ruleset.address_group(name).ok_or_else(|| {
                    reference_error(&rule.name, format!("unknown address group '{name}'"))
                })?;
                for entry in &group.entries {
                    if let Ok(net) = entry.parse::<IpNetwork>() {
                        push(net);
                    }
                }
            }
        }
    }

    Ok(AddressMatch::Networks(networks))
}

fn resolve_l4(ruleset: &RuleSet, rule: &Rule) -> Result<Vec<L4Match>> {
    if rule.targets.is_empty() {
        return Ok(vec![L4Match {
            protocol: rule.protocol,
            ports: Vec::new(),
        }]);
    }

    let mut by_protocol: BTreeMap<Protocol, Vec<PortRange>> = BTreeMap::new();
    let mut add = |protocol: Protocol, range: PortRange| {
        for &p in protocol.port_protocols() {
            by_protocol.entry(p).or_default().push(range);
        }
    };

    for target in &rule.targets {
        match target {
            Target::Port(spec) => {
                let range = spec
                    .parse()
                    .map_err(|e| reference_error(&rule.name, e))?;
                add(rule.protocol, range);
            }
            Target::PortGroup(name) => {
                let group = ruleset.port_group(name).ok_or_else(|| {
                    reference_error(&rule.name, format!("unknown port group '{name}'"))
                })?;
                for spec in &group.ports {
                    if let Ok(range) = spec.parse() {
                        add(rule.protocol, range);
                    }
                }
            }
            Target::Service(name) => {
                let service = ruleset.service(name).ok_or_else(|| {
                    reference_error(&rule.name, format!("unknown service '{name}'"))
                })?;
                for (range, protocol) in service_ports(ruleset, service) {
                    let wanted = rule.protocol.port_protocols();
                    for &p in protocol.port_protocols() {
                        if rule.protocol == Protocol::Any || wanted.contains(&p) {
                            add(p, range);
                        }
                    }
                }
            }
        }
    }

    Ok(by_protocol
        .into_iter()
        .map(|(protocol, ports)| L4Match {
            protocol,
            ports: PortRange::merge(ports),
        })
        .collect())
}

/// Plans one rule; `direction: both` with address restrictions yields a
/// source-match and a destination-match rule, in that order.
fn plan_rule(ruleset: &RuleSet, rule: &Rule) -> Result<Vec<PlannedRule>> {
    let addresses = resolve_addresses(ruleset, rule)?;
    let sides: &[AddressSide] = match (rule.effective_direction(), &addresses) {
        (Direction::Inbound, _) | (Direction::Both, AddressMatch::Any) => &[AddressSide::Source],
        (Direction::Outbound, _) => &[AddressSide::Destination],
        (Direction::Both, AddressMatch::Networks(_)) => {
            &[AddressSide::Source, AddressSide::Destination]
        }
    };

    let planned = PlannedRule {
        name: rule.name.clone(),
        origin: RuleOrigin::User,
        family: rule.family,
        chain: rule.chain,
        side: AddressSide::Source,
        addresses,
        l4: resolve_l4(ruleset, rule)?,
        action: rule.action,
        priority: rule.effective_priority(),
        comment: rule.comment.clone(),
        interface: rule.interface.clone(),
    };

    Ok(sides
        .iter()
        .map(|&side| PlannedRule {
            side,
            ..planned.clone()
        })
        .collect())
}

/// Compiles the user rules of a ruleset, without SSH guard augmentation.
///
/// # Errors
///
/// Returns [`Error::Validation`] if a reference or literal cannot be resolved.
pub fn compile(ruleset: &RuleSet) -> Result<Plan> {
    let mut rules = ruleset
        .rules
        .iter()
        .filter(|r| r.is_present())
        .map(|r| plan_rule(ruleset, r))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();

    // Stable: equal priorities keep declaration order
    rules.sort_by_key(|r| r.priority);

    let mut policies = Vec::with_capacity(6);
    for chain in [Chain::Input, Chain::Forward, Chain::Output] {
        for family in Family::CONCRETE {
            policies.push(ChainPolicy {
                chain,
                family,
                action: ruleset.policy_for(chain, family),
            });
        }
    }

    Ok(Plan {
        policies,
        rules,
        base_rules: ruleset.base_rules,
        families: ruleset.declared_families(),
    })
}

/// A single hypothetical packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub family: Family,
    pub chain: Chain,
    pub protocol: Protocol,
    pub port: u16,
    /// Remote address; `None` means "any address"
    pub address: Option<IpAddr>,
}

impl Probe {
    /// A new inbound TCP connection to a management port from an unknown peer.
    pub fn management(family: Family, port: u16) -> Self {
        Self {
            family,
            chain: Chain::Input,
            protocol: Protocol::Tcp,
            port,
            address: None,
        }
    }

    /// A new inbound TCP connection from a known peer.
    pub fn from_peer(peer: IpAddr, port: u16) -> Self {
        Self {
            family: if peer.is_ipv4() { Family::Ip4 } else { Family::Ip6 },
            chain: Chain::Input,
            protocol: Protocol::Tcp,
            port,
            address: Some(peer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
    Reject,
    /// A rule that might match this packet could refuse it
    Uncertain,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Accept => Verdict::Accept,
            Action::Drop => Verdict::Drop,
            Action::Reject => Verdict::Reject,
        }
    }
}

/// Outcome of [`evaluate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Index into `plan.rules` of the deciding rule; `None` when the policy decided
    pub rule: Option<usize>,
}

enum MatchKind {
    No,
    Partial,
    Full,
}

fn match_kind(rule: &PlannedRule, probe: &Probe) -> MatchKind {
    if rule.chain != probe.chain
        || !rule.family.covers(probe.family)
        || !rule.l4.iter().any(|m| m.covers(probe.protocol, probe.port))
    {
        return MatchKind::No;
    }

    let address = match rule.addresses.for_family(probe.family) {
        None => MatchKind::Full,
        Some(nets) if nets.is_empty() => return MatchKind::No,
        Some(nets) => match probe.address {
            Some(addr) if nets.iter().any(|n| n.contains(addr)) => MatchKind::Full,
            Some(_) => return MatchKind::No,
            None => MatchKind::Partial,
        },
    };

    if rule.interface.is_some() {
        MatchKind::Partial
    } else {
        address
    }
}

/// First-match evaluation of `probe` against the plan's rules and policy.
///
/// Rules that may or may not match (specific addresses with an unknown peer,
/// interface matches) cannot decide the verdict; if any of them would refuse
/// the packet, a later accept is reported as [`Verdict::Uncertain`].
/// Base rules are not considered.
pub fn evaluate(plan: &Plan, probe: &Probe) -> Decision {
    let mut maybe_refused = false;

    for (index, rule) in plan.rules.iter().enumerate() {
        match match_kind(rule, probe) {
            MatchKind::No => {}
            MatchKind::Partial => {
                if rule.action != Action::Accept {
                    maybe_refused = true;
                }
            }
            MatchKind::Full => {
                let verdict = match rule.action {
                    Action::Accept if maybe_refused => Verdict::Uncertain,
                    action => action.into(),
                };
                return Decision {
                    verdict,
                    rule: Some(index),
                };
            }
        }
    }

    let verdict = match plan.policy(probe.chain, probe.family) {
        Action::Accept if maybe_refused => Verdict::Uncertain,
        action => action.into(),
    };
    Decision {
        verdict,
        rule: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{
        AddressGroup, DefaultPolicy, PortGroup, PortSpec, RuleState, ServicePort,
    };

    fn port_rule(name: &str, port: &str) -> Rule {
        let mut rule = Rule::new(name);
        rule.targets.push(Target::Port(PortSpec::new(port)));
        rule
    }

    #[test]
    fn test_absent_rules_are_dropped() {
        let mut ruleset = RuleSet::new();
        ruleset.rules.push(port_rule("keep", "80"));
        let mut gone = port_rule("gone", "81");
        gone.state = RuleState::Absent;
        ruleset.rules.push(gone);

        let plan = compile(&ruleset).unwrap();
        assert_eq!(plan.rules.len(), 1);
        assert_eq!(plan.rules[0].name, "keep");
    }

    #[test]
    fn test_priority_sort_is_stable() {
        let mut ruleset = RuleSet::new();
        let mut a = port_rule("a", "1");
        a.priority = Some(10);
        let b = port_rule("b", "2");
        let mut c = port_rule("c", "3");
        c.priority = Some(5);
        let d = port_rule("d", "4");
        ruleset.rules.extend([a, b, c, d]);

        let plan = compile(&ruleset).unwrap();
        let order: Vec<_> = plan.rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn test_group_and_service_resolution() {
        let mut ruleset = RuleSet::new();
        ruleset.address_groups.push(AddressGroup {
            name: "admins".into(),
            entries: vec!["10.0.0.0/8".into(), "2001:db8::/32".into(), "10.0.0.0/8".into()],
        });
        ruleset.port_groups.push(PortGroup {
            name: "high".into(),
            ports: vec![PortSpec::new("8000-8010"), PortSpec::new("8005:8020")],
        });
        ruleset.services.push(Service {
            name: "dns".into(),
            ports: vec![],
        });

        let mut rule = Rule::new("mixed");
        rule.protocol = Protocol::Any;
        rule.sources.push(Source::Group("admins".into()));
        rule.targets.push(Target::PortGroup("high".into()));
        rule.targets.push(Target::Service("dns".into()));
        ruleset.rules.push(rule);

        let plan = compile(&ruleset).unwrap();
        let rule = &plan.rules[0];
        assert_eq!(
            rule.addresses,
            AddressMatch::Networks(vec![
                "10.0.0.0/8".parse().unwrap(),
                "2001:db8::/32".parse().unwrap()
            ])
        );
        let expected_ports = vec![PortRange::single(53), PortRange { start: 8000, end: 8020 }];
        assert_eq!(
            rule.l4,
            vec![
                L4Match { protocol: Protocol::Tcp, ports: expected_ports.clone() },
                L4Match { protocol: Protocol::Udp, ports: expected_ports },
            ]
        );
    }

    #[test]
    fn test_service_ports_follow_rule_protocol() {
        let mut ruleset = RuleSet::new();
        ruleset.services.push(Service {
            name: "dns".into(),
            ports: vec![
                ServicePort { port: PortSpec::new("53"), protocol: Protocol::Tcp },
                ServicePort { port: PortSpec::new("53"), protocol: Protocol::Udp },
            ],
        });
        let mut rule = Rule::new("dns-udp");
        rule.protocol = Protocol::Udp;
        rule.targets.push(Target::Service("dns".into()));
        ruleset.rules.push(rule);

        let plan = compile(&ruleset).unwrap();
        assert_eq!(plan.rules[0].l4.len(), 1);
        assert_eq!(plan.rules[0].l4[0].protocol, Protocol::Udp);
    }

    #[test]
    fn test_family_filters_group_entries() {
        let mut ruleset = RuleSet::new();
        ruleset.address_groups.push(AddressGroup {
            name: "v6".into(),
            entries: vec!["2001:db8::/32".into()],
        });
        let mut rule = Rule::new("v4");
        rule.family = Family::Ip4;
        rule.sources.push(Source::Group("v6".into()));
        ruleset.rules.push(rule);

        let plan = compile(&ruleset).unwrap();
        assert_eq!(plan.rules[0].addresses, AddressMatch::Networks(vec![]));
        assert!(!plan.rules[0].applies_to(Family::Ip4));
    }

    #[test]
    fn test_direction_both_matches_either_address() {
        let mut ruleset = RuleSet::new();
        let mut peer = port_rule("peer", "5432");
        peer.direction = Some(Direction::Both);
        peer.sources.push(Source::Cidr("192.0.2.10/32".into()));
        ruleset.rules.push(peer);
        let mut open = port_rule("open", "80");
        open.direction = Some(Direction::Both);
        ruleset.rules.push(open);

        let plan = compile(&ruleset).unwrap();
        let sides: Vec<_> = plan.rules.iter().map(|r| (r.name.as_str(), r.side)).collect();
        assert_eq!(
            sides,
            vec![
                ("peer", AddressSide::Source),
                ("peer", AddressSide::Destination),
                ("open", AddressSide::Source),
            ]
        );
        assert_eq!(plan.rules[0].addresses, plan.rules[1].addresses);
    }

    #[test]
    fn test_unknown_reference_is_validation_error() {
        let mut ruleset = RuleSet::new();
        let mut rule = Rule::new("x");
        rule.targets.push(Target::Service("nope".into()));
        ruleset.rules.push(rule);
        assert!(matches!(compile(&ruleset), Err(Error::Validation { .. })));
    }

    #[test]
    fn test_policies_cover_all_chains_and_families() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(DefaultPolicy {
            chain: Chain::Forward,
            family: Family::Ip6,
            action: Action::Drop,
        });
        let plan = compile(&ruleset).unwrap();
        assert_eq!(plan.policies.len(), 6);
        assert_eq!(plan.policy(Chain::Forward, Family::Ip6), Action::Drop);
        assert_eq!(plan.policy(Chain::Forward, Family::Ip4), Action::Accept);
    }

    #[test]
    fn test_evaluate_first_match() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(DefaultPolicy {
            chain: Chain::Input,
            family: Family::Inet,
            action: Action::Drop,
        });
        let mut allow_lan = port_rule("lan-ssh", "22");
        allow_lan.sources.push(Source::Cidr("10.0.0.0/8".into()));
        ruleset.rules.push(allow_lan);

        let plan = compile(&ruleset).unwrap();

        // Unknown peer: the LAN rule might not match, so the policy decides
        let anywhere = evaluate(&plan, &Probe::management(Family::Ip4, 22));
        assert_eq!(anywhere.verdict, Verdict::Drop);
        assert_eq!(anywhere.rule, None);

        let lan = evaluate(&plan, &Probe::from_peer("10.1.2.3".parse().unwrap(), 22));
        assert_eq!(lan.verdict, Verdict::Accept);
        assert_eq!(lan.rule, Some(0));

        let wan = evaluate(&plan, &Probe::from_peer("192.0.2.1".parse().unwrap(), 22));
        assert_eq!(wan.verdict, Verdict::Drop);
    }

    #[test]
    fn test_evaluate_partial_drop_makes_accept_uncertain() {
        let mut ruleset = RuleSet::new();
        let mut deny = port_rule("deny-wan", "22");
        deny.action = Action::Drop;
        deny.interface = Some("eth0".into());
        deny.priority = Some(1);
        ruleset.rules.push(deny);
        ruleset.rules.push(port_rule("ssh", "22"));

        let plan = compile(&ruleset).unwrap();
        let decision = evaluate(&plan, &Probe::management(Family::Ip4, 22));
        assert_eq!(decision.verdict, Verdict::Uncertain);
    }

    #[test]
    fn test_evaluate_ignores_other_ports_and_protocols() {
        let mut ruleset = RuleSet::new();
        let mut deny = port_rule("deny-udp", "22");
        deny.protocol = Protocol::Udp;
        deny.action = Action::Drop;
        ruleset.rules.push(deny);
        let mut deny_web = port_rule("deny-web", "80");
        deny_web.action = Action::Drop;
        ruleset.rules.push(deny_web);

        let plan = compile(&ruleset).unwrap();
        let decision = evaluate(&plan, &Probe::management(Family::Ip6, 22));
        assert_eq!(decision.verdict, Verdict::Accept);
        assert_eq!(decision.rule, None);
    }
}
