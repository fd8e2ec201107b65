use ipnet::IpNet;
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

/// Network access policy applied before any proxy dial.
///
/// A host must match at least one allowed host (exact or DNS-suffix) AND
/// every address it resolves to must fall outside every blocked range.
#[derive(Debug, Clone, Default)]
pub struct NetworkAccessPolicy {
    allowed_hosts: Vec<String>,
    blocked_ranges: Vec<IpNet>,
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    #[serde(default, alias = "allowedHosts")]
    allowed_hosts: Vec<String>,
    #[serde(default, alias = "blockedIpRanges")]
    blocked_ip_ranges: Vec<String>,
}

/// Why a dial was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    HostNotAllowed(String),
    AddressBlocked(IpAddr),
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyViolation::HostNotAllowed(host) => write!(f, "host {host} is not allowed"),
            PolicyViolation::AddressBlocked(addr) => write!(f, "address {addr} is blocked"),
        }
    }
}

impl NetworkAccessPolicy {
    pub fn new(allowed_hosts: Vec<String>, blocked_ranges: Vec<IpNet>) -> Self {
        Self {
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            blocked_ranges,
        }
    }

    /// Load `network-access-policy.json`. A missing file yields a policy
    /// that blocks every proxy dial (empty allow-list).
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "No network access policy, denying all upstream hosts");
                return Self::default();
            }
        };
        let file: PolicyFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Invalid network access policy, denying all upstream hosts");
                return Self::default();
            }
        };

        let blocked_ranges = file
            .blocked_ip_ranges
            .iter()
            .filter_map(|s| {
                // CIDR first, then plain IP as a host route
                IpNet::from_str(s).ok().or_else(|| {
                    IpAddr::from_str(s).ok().map(|ip| match ip {
                        IpAddr::V4(a) => IpNet::from(ipnet::Ipv4Net::from(a)),
                        IpAddr::V6(a) => IpNet::from(ipnet::Ipv6Net::from(a)),
                    })
                })
            })
            .collect();

        Self::new(file.allowed_hosts, blocked_ranges)
    }

    /// Check the hostname before resolution.
    pub fn check_host(&self, host: &str) -> Result<(), PolicyViolation> {
        let host = host.to_ascii_lowercase();
        let allowed = self.allowed_hosts.iter().any(|h| {
            host == *h || host.ends_with(&format!(".{h}"))
        });
        if allowed {
            Ok(())
        } else {
            Err(PolicyViolation::HostNotAllowed(host))
        }
    }

    /// Check every resolved address against the blocked ranges.
    pub fn check_addrs<'a>(
        &self,
        addrs: impl IntoIterator<Item = &'a IpAddr>,
    ) -> Result<(), PolicyViolation> {
        for addr in addrs {
            if self.blocked_ranges.iter().any(|net| net.contains(addr)) {
                return Err(PolicyViolation::AddressBlocked(*addr));
            }
        }
        Ok(())
    }
}
