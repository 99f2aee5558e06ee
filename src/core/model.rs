//! Backend-neutral firewall intent
//!
//! A [`RuleSet`] is the aggregate root handed to the engine for one apply
//! cycle. It owns its services, address groups, port groups, rules and default
//! policies; nothing is shared across rulesets. The model is pure data: names
//! and references are resolved by [`crate::core::plan`], and checked by
//! [`crate::core::validate`].
//!
//! # Example
//!
//! ```
//! use hostwall::core::model::{RuleSet, Action, Chain};
//!
//! let ruleset: RuleSet = serde_json::from_str(r#"{
//!     "default_policies": [{ "chain": "input", "action": "drop" }],
//!     "services": [{ "name": "web", "ports": [{ "port": 443, "protocol": "tcp" }] }],
//!     "rules": [{ "name": "allow-web", "targets": [{ "service": "web" }] }]
//! }"#).unwrap();
//!
//! assert_eq!(ruleset.rules.len(), 1);
//! assert_eq!(ruleset.policy_for(Chain::Input, hostwall::core::model::Family::Ip4), Action::Drop);
//! assert!(ruleset.ssh_guard);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Sort key used for rules without an explicit priority
pub const DEFAULT_PRIORITY: i32 = 100;

/// Management port protected by the SSH guard unless configured otherwise
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Protocol family a rule or policy applies to
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
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
pub enum Family {
    /// Both IPv4 and IPv6
    #[default]
    Inet,
    Ip4,
    Ip6,
}

impl Family {
    /// The concrete families, in the order per-family output is emitted
    pub const CONCRETE: [Family; 2] = [Family::Ip4, Family::Ip6];

    pub const fn as_str(self) -> &'static str {
        match self {
            Family::Inet => "inet",
            Family::Ip4 => "ip4",
            Family::Ip6 => "ip6",
        }
    }

    /// Returns `true` if this family includes `concrete`.
    pub fn covers(self, concrete: Family) -> bool {
        self == Family::Inet || self == concrete
    }

    /// Expands `inet` into the concrete families it stands for.
    pub fn concrete(self) -> &'static [Family] {
        match self {
            Family::Inet => &Self::CONCRETE,
            Family::Ip4 => &[Family::Ip4],
            Family::Ip6 => &[Family::Ip6],
        }
    }

    /// Family of a parsed network
    pub fn of(network: &ipnetwork::IpNetwork) -> Family {
        if network.is_ipv4() {
            Family::Ip4
        } else {
            Family::Ip6
        }
    }
}

/// Filter chain (hook point)
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
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
pub enum Chain {
    #[default]
    Input,
    Forward,
    Output,
}

impl Chain {
    pub const fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "input",
            Chain::Forward => "forward",
            Chain::Output => "output",
        }
    }

    /// Direction a rule in this chain has unless it says otherwise
    pub const fn default_direction(self) -> Direction {
        match self {
            Chain::Input | Chain::Forward => Direction::Inbound,
            Chain::Output => Direction::Outbound,
        }
    }
}

/// Network protocol type for firewall rules
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
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
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Icmp,
    /// Match all protocols; with ports it means TCP and UDP
    Any,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Any => "any",
        }
    }

    /// The concrete protocols a port match with this protocol expands to.
    pub fn port_protocols(self) -> &'static [Protocol] {
        match self {
            Protocol::Tcp => &[Protocol::Tcp],
            Protocol::Udp => &[Protocol::Udp],
            Protocol::Icmp => &[Protocol::Icmp],
            Protocol::Any => &[Protocol::Tcp, Protocol::Udp],
        }
    }
}

/// Verdict for matching traffic, also used for default policies
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
pub enum Action {
    #[default]
    Accept,
    Drop,
    Reject,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "accept",
            Action::Drop => "drop",
            Action::Reject => "reject",
        }
    }

    /// Strictness order used when two families share one native chain.
    pub const fn strictness(self) -> u8 {
        match self {
            Action::Accept => 0,
            Action::Reject => 1,
            Action::Drop => 2,
        }
    }
}

/// Which side of the connection a rule's sources describe
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    /// Sources match the packet's source address
    Inbound,
    /// Sources match the packet's destination address (the remote peer)
    Outbound,
    /// Sources match either address; compiled into one rule per side
    Both,
}

/// Desired presence of a rule
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
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuleState {
    #[default]
    #[serde(alias = "enabled")]
    Present,
    #[serde(alias = "disabled")]
    Absent,
}

/// Raw port or range as written by the user: `22`, `"8000-8100"`, `"8000:8100"`.
///
/// Kept unparsed so that syntax problems surface as validation findings
/// instead of deserialization failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortSpec(pub String);

impl PortSpec {
    pub fn new(spec: impl Into<String>) -> Self {
        Self(spec.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Result<PortRange, String> {
        self.0.parse()
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        Self(port.to_string())
    }
}

impl From<&str> for PortSpec {
    fn from(spec: &str) -> Self {
        Self(spec.to_string())
    }
}

impl Serialize for PortSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PortSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => PortSpec(n.to_string()),
            Raw::Text(s) => PortSpec(s),
        })
    }
}

/// Inclusive port range; a single port has `start == end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Sorts and coalesces overlapping or adjacent ranges.
    pub fn merge(mut ranges: Vec<PortRange>) -> Vec<PortRange> {
        ranges.sort_unstable();
        let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if u32::from(range.start) <= u32::from(last.end) + 1 => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = crate::validators::parse_port_spec(s)?;
        Ok(Self { start, end })
    }
}

/// One port entry of a [`Service`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePort {
    pub port: PortSpec,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Named set of (port, protocol) pairs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    /// Empty means "look the name up in the well-known catalogue"
    #[serde(default)]
    pub ports: Vec<ServicePort>,
}

/// Named ordered list of CIDRs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressGroup {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<String>,
}

/// Named list of ports/ranges; uses the protocol of the referencing rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortGroup {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

/// A rule source: `any`, a literal CIDR, or `@group`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Source {
    Any,
    Cidr(String),
    Group(String),
}

impl From<String> for Source {
    fn from(s: String) -> Self {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("any") {
            Source::Any
        } else if let Some(group) = trimmed.strip_prefix('@') {
            Source::Group(group.to_string())
        } else {
            Source::Cidr(trimmed.to_string())
        }
    }
}

impl From<&str> for Source {
    fn from(s: &str) -> Self {
        Source::from(s.to_string())
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Any => f.write_str("any"),
            Source::Cidr(cidr) => f.write_str(cidr),
            Source::Group(name) => write!(f, "@{name}"),
        }
    }
}

impl Serialize for Source {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Source {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Source::from)
    }
}

/// A rule target
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Target {
    Port(PortSpec),
    Service(String),
    PortGroup(String),
}

/// A single declarative firewall rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub family: Family,
    #[serde(default)]
    pub chain: Chain,
    /// Empty means any source
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Empty means every port of the protocol
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: Action,
    /// Defaults to the chain's natural direction
    #[serde(default)]
    pub direction: Option<Direction>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Lower is evaluated first; defaults to [`DEFAULT_PRIORITY`]
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub state: RuleState,
}

impl Rule {
    /// Creates an accept rule on the input chain with every other field defaulted.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            family: Family::Inet,
            chain: Chain::Input,
            sources: Vec::new(),
            targets: Vec::new(),
            protocol: Protocol::Tcp,
            action: Action::Accept,
            direction: None,
            comment: None,
            priority: None,
            interface: None,
            state: RuleState::Present,
        }
    }

    pub fn effective_priority(&self) -> i32 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    pub fn effective_direction(&self) -> Direction {
        self.direction
            .unwrap_or_else(|| self.chain.default_direction())
    }

    pub fn is_present(&self) -> bool {
        self.state == RuleState::Present
    }
}

/// Default verdict for one chain, optionally restricted to one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultPolicy {
    pub chain: Chain,
    #[serde(default)]
    pub family: Family,
    pub action: Action,
}

fn default_true() -> bool {
    true
}

fn default_ssh_ports() -> Vec<u16> {
    vec![DEFAULT_SSH_PORT]
}

/// Complete firewall intent for one host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub default_policies: Vec<DefaultPolicy>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub address_groups: Vec<AddressGroup>,
    #[serde(default)]
    pub port_groups: Vec<PortGroup>,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default = "default_true")]
    pub ssh_guard: bool,
    #[serde(default = "default_ssh_ports")]
    pub ssh_ports: Vec<u16>,
    /// Emit loopback and established/related accepts in restrictive chains
    #[serde(default = "default_true")]
    pub base_rules: bool,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            default_policies: Vec::new(),
            services: Vec::new(),
            address_groups: Vec::new(),
            port_groups: Vec::new(),
            rules: Vec::new(),
            ssh_guard: true,
            ssh_ports: default_ssh_ports(),
            base_rules: true,
        }
    }

    /// Parses a ruleset from its JSON document form.
    pub fn from_json(json: &str) -> crate::core::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Effective default policy for a chain and concrete family.
    ///
    /// A family-specific entry wins over an `inet` entry; no entry means accept.
    pub fn policy_for(&self, chain: Chain, family: Family) -> Action {
        let specific = self
            .default_policies
            .iter()
            .find(|p| p.chain == chain && p.family == family && family != Family::Inet);
        let shared = self
            .default_policies
            .iter()
            .find(|p| p.chain == chain && p.family == Family::Inet);

        specific.or(shared).map_or(Action::Accept, |p| p.action)
    }

    /// Concrete families referenced by policies or present rules.
    pub fn declared_families(&self) -> Vec<Family> {
        let declared: Vec<Family> = self
            .default_policies
            .iter()
            .map(|p| p.family)
            .chain(self.rules.iter().filter(|r| r.is_present()).map(|r| r.family))
            .collect();

        Family::CONCRETE
            .into_iter()
            .filter(|concrete| declared.iter().any(|f| f.covers(*concrete)))
            .collect()
    }

    /// Configured SSH ports without repeats, in declaration order.
    pub fn management_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = Vec::with_capacity(self.ssh_ports.len());
        for &port in &self.ssh_ports {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        ports
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn address_group(&self, name: &str) -> Option<&AddressGroup> {
        self.address_groups.iter().find(|g| g.name == name)
    }

    pub fn port_group(&self, name: &str) -> Option<&PortGroup> {
        self.port_groups.iter().find(|g| g.name == name)
    }
}

/// Well-known service ports used for services declared without ports
pub fn well_known_service(name: &str) -> Option<&'static [(u16, Protocol)]> {
    let ports: &'static [(u16, Protocol)] = match name.to_ascii_lowercase().as_str() {
        "ftp-data" => &[(20, Protocol::Tcp)],
        "ftp" => &[(21, Protocol::Tcp)],
        "ssh" => &[(22, Protocol::Tcp)],
        "telnet" => &[(23, Protocol::Tcp)],
        "smtp" => &[(25, Protocol::Tcp)],
        "dns" => &[(53, Protocol::Tcp), (53, Protocol::Udp)],
        "dhcp-server" => &[(67, Protocol::Udp)],
        "dhcp-client" => &[(68, Protocol::Udp)],
        "tftp" => &[(69, Protocol::Udp)],
        "http" => &[(80, Protocol::Tcp)],
        "pop3" => &[(110, Protocol::Tcp)],
        "ntp" => &[(123, Protocol::Udp)],
        "imap" => &[(143, Protocol::Tcp)],
        "snmp" => &[(161, Protocol::Udp)],
        "snmp-trap" => &[(162, Protocol::Udp)],
        "https" => &[(443, Protocol::Tcp)],
        "smtps" => &[(465, Protocol::Tcp)],
        "syslog" => &[(514, Protocol::Udp)],
        "submission" => &[(587, Protocol::Tcp)],
        "imaps" => &[(993, Protocol::Tcp)],
        "pop3s" => &[(995, Protocol::Tcp)],
        "mssql" => &[(1433, Protocol::Tcp)],
        "mysql" => &[(3306, Protocol::Tcp)],
        "rdp" => &[(3389, Protocol::Tcp)],
        "postgresql" => &[(5432, Protocol::Tcp)],
        "redis" => &[(6379, Protocol::Tcp)],
        "http-alt" => &[(8080, Protocol::Tcp)],
        "https-alt" => &[(8443, Protocol::Tcp)],
        "elasticsearch" => &[(9200, Protocol::Tcp)],
        "mongodb" => &[(27017, Protocol::Tcp)],
        _ => return None,
    };
    Some(ports)
}
