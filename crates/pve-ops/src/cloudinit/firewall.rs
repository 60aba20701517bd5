//! UFW rule sets.
//!
//! UFW evaluates rules first-match-wins, so the order of a policy is part of
//! its meaning: management and local-subnet allows must come before the SSH
//! deny, and public service allows after it.

use std::fmt;
use std::net::Ipv4Addr;

use crate::config::PlatformConfig;

/// SSH port closed to everyone not explicitly allowed.
pub const SSH_PORT: u16 = 22;

/// Mosh UDP port range.
pub const MOSH_PORTS: PortRange = PortRange::new(60000, 61000);

/// Machine-to-machine ranges opened on application hosts.
pub const APP_M2M_PORTS: [PortRange; 3] = [
    PortRange::new(8080, 8090),
    PortRange::new(18080, 18090),
    PortRange::new(28080, 28090),
];

/// Inclusive port range; a single port when `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn single(port: u16) -> Self {
        Self::new(port, port)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A single UFW instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallRule {
    /// `ufw default deny incoming` / `ufw default allow outgoing`.
    Defaults,
    /// Allow everything from a host or subnet.
    AllowFrom(String),
    /// Deny a port for everyone not matched earlier.
    Deny(PortRange, Protocol),
    /// Allow a port for everyone.
    Allow(PortRange, Protocol),
    /// Turn the firewall on.
    Enable,
}

impl FirewallRule {
    /// Shell commands implementing this rule.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        match self {
            Self::Defaults => vec![
                "ufw default deny incoming".to_string(),
                "ufw default allow outgoing".to_string(),
            ],
            Self::AllowFrom(source) => vec![format!("ufw allow from {source}")],
            Self::Deny(ports, proto) => vec![format!("ufw deny {ports}/{proto}")],
            Self::Allow(ports, proto) => vec![format!("ufw allow {ports}/{proto}")],
            Self::Enable => vec!["ufw --force enable".to_string()],
        }
    }
}

/// Ordered list of firewall rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallPolicy {
    rules: Vec<FirewallRule>,
}

impl FirewallPolicy {
    /// Policy written into every new VM's cloud-init script.
    #[must_use]
    pub fn provisioning(config: &PlatformConfig) -> Self {
        let mut policy = Self::trusted_then_ssh_deny(&config.management_ips, &config.local_subnet);
        policy.push_web();
        for port in &config.app_ports {
            policy
                .rules
                .push(FirewallRule::Allow(PortRange::single(*port), Protocol::Tcp));
        }
        policy
            .rules
            .push(FirewallRule::Allow(MOSH_PORTS, Protocol::Udp));
        policy.rules.push(FirewallRule::Enable);
        policy
    }

    /// Rules added to a running host that takes the `app` role.
    #[must_use]
    pub fn app_role(config: &PlatformConfig) -> Self {
        let mut policy = Self::trusted_then_ssh_deny(&config.management_ips, &config.local_subnet);
        policy.push_web();
        for ports in APP_M2M_PORTS {
            policy.rules.push(FirewallRule::Allow(ports, Protocol::Tcp));
        }
        policy
    }

    fn trusted_then_ssh_deny(management_ips: &[Ipv4Addr], local_subnet: &str) -> Self {
        let mut rules = vec![FirewallRule::Defaults];
        rules.extend(
            management_ips
                .iter()
                .map(|ip| FirewallRule::AllowFrom(ip.to_string())),
        );
        if !local_subnet.is_empty() {
            rules.push(FirewallRule::AllowFrom(local_subnet.to_string()));
        }
        rules.push(FirewallRule::Deny(PortRange::single(SSH_PORT), Protocol::Tcp));
        Self { rules }
    }

    fn push_web(&mut self) {
        self.rules
            .push(FirewallRule::Allow(PortRange::single(80), Protocol::Tcp));
        self.rules
            .push(FirewallRule::Allow(PortRange::single(443), Protocol::Tcp));
    }

    #[must_use]
    pub fn rules(&self) -> &[FirewallRule] {
        &self.rules
    }

    /// All shell commands, in rule order.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.rules.iter().flat_map(FirewallRule::commands).collect()
    }
}
