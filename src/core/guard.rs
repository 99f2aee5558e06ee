//! SSH lockout guard
//!
//! Makes sure the compiled plan explicitly accepts new connections to every
//! management port, for every declared family, before any other rule runs.
//! Guard rules exist only in the [`Plan`]; the caller's [`RuleSet`] is never
//! modified, so they are re-derived on every apply.

use crate::core::error::Result;
use crate::core::model::{Action, Chain, DEFAULT_PRIORITY, Family, PortRange, Protocol, RuleSet};
use crate::core::plan::{
    self, AddressMatch, AddressSide, L4Match, Plan, PlannedRule, Probe, RuleOrigin, Verdict,
};
use tracing::{debug, info};

/// Comment carried by every synthesized guard rule
pub const GUARD_COMMENT: &str = "ssh-guard: do not remove";

/// Compiles `ruleset` and prepends SSH guard rules where they are needed.
///
/// A port is already covered when a user rule accepts it from any source
/// before anything else could refuse it. Guard rules are independent per
/// family; IPv4 rules come before IPv6 rules.
///
/// # Errors
///
/// Returns any error from [`plan::compile`].
pub fn ensure_management_access(ruleset: &RuleSet) -> Result<Plan> {
    let mut compiled = plan::compile(ruleset)?;

    if !ruleset.ssh_guard {
        debug!("SSH guard disabled");
        return Ok(compiled);
    }

    let priority = compiled
        .rules
        .iter()
        .map(|r| r.priority)
        .min()
        .unwrap_or(DEFAULT_PRIORITY)
        .saturating_sub(1);

    let mut guards = Vec::new();
    for &family in &compiled.families {
        for port in ruleset.management_ports() {
            let decision = plan::evaluate(&compiled, &Probe::management(family, port));
            if decision.verdict == Verdict::Accept && decision.rule.is_some() {
                continue;
            }

            info!("SSH guard: allowing {family} tcp/{port} ahead of all rules");
            guards.push(guard_rule(family, port, priority));
        }
    }

    compiled.rules.splice(0..0, guards);
    Ok(compiled)
}

fn guard_rule(family: Family, port: u16, priority: i32) -> PlannedRule {
    PlannedRule {
        name: format!("ssh-guard-{family}-{port}"),
        origin: RuleOrigin::Guard,
        family,
        chain: Chain::Input,
        side: AddressSide::Source,
        addresses: AddressMatch::Any,
        l4: vec![L4Match {
            protocol: Protocol::Tcp,
            ports: vec![PortRange::single(port)],
        }],
        action: Action::Accept,
        priority,
        comment: Some(GUARD_COMMENT.to_string()),
        interface: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{DefaultPolicy, PortSpec, Rule, Source, Target};

    fn drop_input() -> DefaultPolicy {
        DefaultPolicy {
            chain: Chain::Input,
            family: Family::Inet,
            action: Action::Drop,
        }
    }

    #[test]
    fn test_guard_added_for_each_family_and_port() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        ruleset.ssh_ports = vec![22, 2222];

        let plan = ensure_management_access(&ruleset).unwrap();
        let names: Vec<_> = plan.guard_rules().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["ssh-guard-ip4-22", "ssh-guard-ip4-2222", "ssh-guard-ip6-22", "ssh-guard-ip6-2222"]
        );
    }

    #[test]
    fn test_repeated_ssh_port_gets_one_guard_per_family() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        ruleset.ssh_ports = vec![22, 22];

        let plan = ensure_management_access(&ruleset).unwrap();
        let names: Vec<_> = plan.guard_rules().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["ssh-guard-ip4-22", "ssh-guard-ip6-22"]);
    }

    #[test]
    fn test_guard_precedes_user_rules_with_lower_priority() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        let mut web = Rule::new("web");
        web.targets.push(Target::Port(PortSpec::new("443")));
        web.sources.push(Source::Cidr("0.0.0.0/0".into()));
        web.priority = Some(10);
        ruleset.rules.push(web);

        let plan = ensure_management_access(&ruleset).unwrap();
        assert_eq!(plan.rules[0].origin, RuleOrigin::Guard);
        assert_eq!(plan.rules[0].priority, 9);
        assert_eq!(plan.rules[0].comment.as_deref(), Some(GUARD_COMMENT));
        assert_eq!(plan.rules.last().map(|r| r.name.as_str()), Some("web"));

        let decision = plan::evaluate(&plan, &Probe::management(Family::Ip4, 22));
        assert_eq!(decision.verdict, Verdict::Accept);
        assert_eq!(decision.rule, Some(0));
    }

    #[test]
    fn test_no_guard_when_explicit_allow_exists() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        let mut ssh = Rule::new("ssh");
        ssh.targets.push(Target::Port(PortSpec::new("22")));
        ruleset.rules.push(ssh);

        let plan = ensure_management_access(&ruleset).unwrap();
        assert_eq!(plan.guard_rules().count(), 0);
    }

    #[test]
    fn test_restricted_allow_still_needs_guard() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        let mut ssh = Rule::new("ssh-lan");
        ssh.targets.push(Target::Port(PortSpec::new("22")));
        ssh.sources.push(Source::Cidr("192.168.0.0/16".into()));
        ssh.family = Family::Ip4;
        ruleset.rules.push(ssh);

        let plan = ensure_management_access(&ruleset).unwrap();
        let guards: Vec<_> = plan.guard_rules().map(|r| r.family).collect();
        assert_eq!(guards, vec![Family::Ip4, Family::Ip6]);
    }

    #[test]
    fn test_guard_only_for_uncovered_family() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        let mut ssh = Rule::new("ssh-v4");
        ssh.family = Family::Ip4;
        ssh.targets.push(Target::Port(PortSpec::new("22")));
        ruleset.rules.push(ssh);

        let plan = ensure_management_access(&ruleset).unwrap();
        let guards: Vec<_> = plan.guard_rules().map(|r| r.name.as_str()).collect();
        assert_eq!(guards, vec!["ssh-guard-ip6-22"]);
    }

    #[test]
    fn test_guard_disabled() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        ruleset.ssh_guard = false;

        let plan = ensure_management_access(&ruleset).unwrap();
        assert_eq!(plan.guard_rules().count(), 0);
    }

    #[test]
    fn test_ruleset_is_not_modified() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());
        let before = ruleset.clone();

        let _ = ensure_management_access(&ruleset).unwrap();
        assert_eq!(ruleset, before);
    }

    #[test]
    fn test_guard_without_rules_uses_default_priority() {
        let mut ruleset = RuleSet::new();
        ruleset.default_policies.push(drop_input());

        let plan = ensure_management_access(&ruleset).unwrap();
        assert!(plan.guard_rules().all(|r| r.priority == DEFAULT_PRIORITY - 1));
    }
}
