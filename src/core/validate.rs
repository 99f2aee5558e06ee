//! Ruleset validation
//!
//! [`validate`] runs four check categories in order: name uniqueness,
//! references, syntax, and lockout detection. Every finding inside a category
//! is collected; if a category produced at least one error the later
//! categories are skipped, since they assume the earlier ones hold.

use crate::core::model::{Action, Chain, Direction, Family, Protocol, RuleSet, Source, Target};
use crate::core::plan::{self, Probe, Verdict};
use crate::validators;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Severity {
    /// Blocks apply
    Error,
    Warning,
    Info,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Category {
    Uniqueness,
    Reference,
    Syntax,
    Lockout,
}

/// A single validation message about one entity of the ruleset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub category: Category,
    /// Name of the entity the finding is about
    pub subject: String,
    pub message: String,
}

impl Finding {
    pub fn error(category: Category, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn warning(
        category: Category,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn info(category: Category, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            category,
            subject: subject.into(),
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} {}: {}",
            self.severity, self.category, self.subject, self.message
        )
    }
}

/// Ordered findings; an empty report means the ruleset is valid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        !self.has_errors()
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(Finding::is_error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.is_error())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
    }

    /// Converts an error-bearing report into [`crate::core::error::Error::Validation`].
    pub fn into_result(self) -> crate::core::error::Result<Vec<Finding>> {
        if self.has_errors() {
            Err(crate::core::error::Error::Validation {
                findings: self.findings,
            })
        } else {
            Ok(self.findings)
        }
    }
}

/// Validates a ruleset.
pub fn validate(ruleset: &RuleSet) -> ValidationReport {
    let mut report = ValidationReport::default();

    let categories: [fn(&RuleSet) -> Vec<Finding>; 4] =
        [check_uniqueness, check_references, check_syntax, check_lockout];

    for check in categories {
        let findings = check(ruleset);
        let blocking = findings.iter().any(Finding::is_error);
        report.findings.extend(findings);
        if blocking {
            break;
        }
    }

    debug!(
        "Validation produced {} finding(s), {} error(s)",
        report.findings.len(),
        report.errors().count()
    );
    report
}

fn duplicates<'a>(names: impl Iterator<Item = &'a str>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    let mut dups = Vec::new();
    for name in names {
        if !seen.insert(name) && reported.insert(name) {
            dups.push(name);
        }
    }
    dups
}

fn check_uniqueness(ruleset: &RuleSet) -> Vec<Finding> {
    let mut findings = Vec::new();

    let collections: [(&str, Vec<&str>); 4] = [
        ("service", ruleset.services.iter().map(|s| s.name.as_str()).collect()),
        (
            "address group",
            ruleset.address_groups.iter().map(|g| g.name.as_str()).collect(),
        ),
        (
            "port group",
            ruleset.port_groups.iter().map(|g| g.name.as_str()).collect(),
        ),
        ("rule", ruleset.rules.iter().map(|r| r.name.as_str()).collect()),
    ];

    for (kind, names) in collections {
        for dup in duplicates(names.into_iter()) {
            findings.push(Finding::error(
                Category::Uniqueness,
                dup,
                format!("duplicate {kind} name '{dup}'"),
            ));
        }
    }

    let mut seen = HashSet::new();
    for policy in &ruleset.default_policies {
        if !seen.insert((policy.chain, policy.family)) {
            findings.push(Finding::error(
                Category::Uniqueness,
                format!("policy {}/{}", policy.chain, policy.family),
                format!(
                    "more than one default policy for chain {} family {}",
                    policy.chain, policy.family
                ),
            ));
        }
    }

    findings
}

fn check_references(ruleset: &RuleSet) -> Vec<Finding> {
    let mut findings = Vec::new();

    for rule in &ruleset.rules {
        for source in &rule.sources {
            if let Source::Group(name) = source
                && ruleset.address_group(name).is_none()
            {
                findings.push(Finding::error(
                    Category::Reference,
                    &rule.name,
                    format!("unknown address group '{name}'"),
                ));
            }
        }

        for target in &rule.targets {
            match target {
                Target::Service(name) if ruleset.service(name).is_none() => {
                    findings.push(Finding::error(
                        Category::Reference,
                        &rule.name,
                        format!("unknown service '{name}'"),
                    ));
                }
                Target::PortGroup(name) if ruleset.port_group(name).is_none() => {
                    findings.push(Finding::error(
                        Category::Reference,
                        &rule.name,
                        format!("unknown port group '{name}'"),
                    ));
                }
                _ => {}
            }
        }
    }

    findings
}

fn check_name(findings: &mut Vec<Finding>, kind: &str, name: &str) {
    if let Err(e) = validators::validate_name(name) {
        findings.push(Finding::error(
            Category::Syntax,
            name,
            format!("invalid {kind} name: {e}"),
        ));
    }
}

fn check_syntax(ruleset: &RuleSet) -> Vec<Finding> {
    let mut findings = Vec::new();

    for service in &ruleset.services {
        check_name(&mut findings, "service", &service.name);

        if service.ports.is_empty() {
            if crate::core::model::well_known_service(&service.name).is_none() {
                findings.push(Finding::error(
                    Category::Syntax,
                    &service.name,
                    "service has no ports and is not a well-known service name",
                ));
            }
            continue;
        }

        for entry in &service.ports {
            if let Err(e) = entry.port.parse() {
                findings.push(Finding::error(Category::Syntax, &service.name, e));
            }
            if entry.protocol == Protocol::Icmp {
                findings.push(Finding::error(
                    Category::Syntax,
                    &service.name,
                    format!("protocol icmp cannot carry port {}", entry.port),
                ));
            }
        }
    }

    for group in &ruleset.address_groups {
        check_name(&mut findings, "address group", &group.name);

        if group.entries.is_empty() {
            findings.push(Finding::error(
                Category::Syntax,
                &group.name,
                "address group is empty",
            ));
        }

        let mut parsed: Vec<IpNetwork> = Vec::with_capacity(group.entries.len());
        for entry in &group.entries {
            match entry.parse::<IpNetwork>() {
                Ok(net) => parsed.push(net),
                Err(e) => findings.push(Finding::error(
                    Category::Syntax,
                    &group.name,
                    format!("invalid CIDR '{entry}': {e}"),
                )),
            }
        }

        for (i, a) in parsed.iter().enumerate() {
            for b in &parsed[i + 1..] {
                if overlaps(a, b) {
                    findings.push(Finding::warning(
                        Category::Syntax,
                        &group.name,
                        format!("entries {a} and {b} overlap"),
                    ));
                }
            }
        }
    }

    for group in &ruleset.port_groups {
        check_name(&mut findings, "port group", &group.name);

        if group.ports.is_empty() {
            findings.push(Finding::error(
                Category::Syntax,
                &group.name,
                "port group is empty",
            ));
        }
        for port in &group.ports {
            if let Err(e) = port.parse() {
                findings.push(Finding::error(Category::Syntax, &group.name, e));
            }
        }
    }

    for rule in &ruleset.rules {
        check_name(&mut findings, "rule", &rule.name);

        for source in &rule.sources {
            let Source::Cidr(cidr) = source else {
                continue;
            };
            match cidr.parse::<IpNetwork>() {
                Ok(net) if !rule.family.covers(Family::of(&net)) => {
                    findings.push(Finding::error(
                        Category::Syntax,
                        &rule.name,
                        format!("source {net} does not belong to family {}", rule.family),
                    ));
                }
                Ok(_) => {}
                Err(e) => findings.push(Finding::error(
                    Category::Syntax,
                    &rule.name,
                    format!("invalid CIDR '{cidr}': {e}"),
                )),
            }
        }

        for target in &rule.targets {
            if let Target::Port(spec) = target
                && let Err(e) = spec.parse()
            {
                findings.push(Finding::error(Category::Syntax, &rule.name, e));
            }
        }

        if rule.protocol == Protocol::Icmp && !rule.targets.is_empty() {
            findings.push(Finding::error(
                Category::Syntax,
                &rule.name,
                "protocol icmp cannot be combined with port targets",
            ));
        }

        if rule.protocol != Protocol::Any {
            for target in &rule.targets {
                if let Target::Service(name) = target
                    && let Some(service) = ruleset.service(name)
                    && !service_offers(ruleset, service, rule.protocol)
                {
                    findings.push(Finding::warning(
                        Category::Syntax,
                        &rule.name,
                        format!("service '{name}' has no {} ports; it matches nothing here", rule.protocol),
                    ));
                }
            }
        }

        if let Some(iface) = &rule.interface
            && let Err(e) = validators::validate_interface(iface)
        {
            findings.push(Finding::error(Category::Syntax, &rule.name, e));
        }

        if let Some(direction) = rule.direction
            && direction != Direction::Both
            && direction != rule.chain.default_direction()
            && rule.chain != Chain::Forward
        {
            findings.push(Finding::warning(
                Category::Syntax,
                &rule.name,
                format!(
                    "direction {direction} is unusual on the {} chain; sources will match the {} address",
                    rule.chain,
                    if direction == Direction::Inbound { "source" } else { "destination" }
                ),
            ));
        }

        if let Some(comment) = &rule.comment
            && validators::sanitize_label(comment) != *comment
        {
            findings.push(Finding::warning(
                Category::Syntax,
                &rule.name,
                "comment contains characters that will be stripped or is longer than 64 bytes",
            ));
        }
    }

    if ruleset.ssh_ports.contains(&0) {
        findings.push(Finding::error(
            Category::Syntax,
            "ssh_ports",
            "port 0 is not a valid management port",
        ));
    }
    if ruleset.management_ports().len() < ruleset.ssh_ports.len() {
        findings.push(Finding::warning(
            Category::Syntax,
            "ssh_ports",
            "management ports are listed more than once; repeats are ignored",
        ));
    }
    if ruleset.ssh_guard && ruleset.ssh_ports.is_empty() {
        findings.push(Finding::warning(
            Category::Syntax,
            "ssh_ports",
            "ssh guard is enabled but no management ports are configured",
        ));
    }

    findings
}

fn service_offers(ruleset: &RuleSet, service: &crate::core::model::Service, protocol: Protocol) -> bool {
    plan::service_ports(ruleset, service)
        .iter()
        .any(|(_, p)| p.port_protocols().contains(&protocol))
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.contains(b.network()) || b.contains(a.network()))
}

fn check_lockout(ruleset: &RuleSet) -> Vec<Finding> {
    let mut findings = Vec::new();

    let plan = match plan::compile(ruleset) {
        Ok(plan) => plan,
        Err(e) => {
            findings.push(Finding::error(Category::Lockout, "ruleset", e.to_string()));
            return findings;
        }
    };

    for family in ruleset.declared_families() {
        for port in ruleset.management_ports() {
            let decision = plan::evaluate(&plan, &Probe::management(family, port));
            if decision.verdict == Verdict::Accept {
                continue;
            }

            let policy = ruleset.policy_for(Chain::Input, family);
            let subject = format!("ssh/{family}/{port}");
            let what = if policy == Action::Accept {
                format!("a rule may block management port {port} for {family}")
            } else {
                format!(
                    "input policy {policy} for {family} blocks management port {port} with no explicit allow rule"
                )
            };

            if ruleset.ssh_guard {
                findings.push(Finding::info(
                    Category::Lockout,
                    subject,
                    format!("{what}; the ssh guard will insert an allow rule"),
                ));
            } else {
                findings.push(Finding::error(Category::Lockout, subject, what));
            }
        }
    }

    findings
}
