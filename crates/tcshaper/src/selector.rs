//! Traffic selector types
//!
//! A selector is the identity of a shaping rule: which packets it applies
//! to. Two selectors are equal iff every present field matches; an absent
//! network means "anywhere" and is canonicalized away before comparison.

use std::fmt;

use ipnetwork::IpNetwork;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip,
    Ipv6,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Ipv6 => "ipv6",
        }
    }

    pub fn is_ipv6(self) -> bool {
        matches!(self, Self::Ipv6)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Outgoing,
    Incoming,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The network/port/protocol tuple a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficSelector {
    pub protocol: Protocol,
    pub src_network: Option<IpNetwork>,
    pub dst_network: Option<IpNetwork>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

impl TrafficSelector {
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            src_network: None,
            dst_network: None,
            src_port: None,
            dst_port: None,
        }
    }

    /// Canonical form: a zero-prefix ("anywhere") network is the same as no
    /// network at all.
    pub fn normalized(&self) -> Self {
        let drop_anywhere = |network: Option<IpNetwork>| network.filter(|n| n.prefix() > 0);
        Self {
            protocol: self.protocol,
            src_network: drop_anywhere(self.src_network),
            dst_network: drop_anywhere(self.dst_network),
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }

    /// Stable identity string: the non-empty fields in fixed order. Used as
    /// the externally visible key for joined rules.
    pub fn canonical_key(&self) -> String {
        let normalized = self.normalized();
        let mut parts = Vec::new();
        if let Some(network) = normalized.src_network {
            parts.push(format!("src-network={}", network));
        }
        if let Some(network) = normalized.dst_network {
            parts.push(format!("dst-network={}", network));
        }
        if let Some(port) = normalized.src_port {
            parts.push(format!("src-port={}", port));
        }
        if let Some(port) = normalized.dst_port {
            parts.push(format!("dst-port={}", port));
        }
        parts.push(format!("protocol={}", normalized.protocol));
        parts.join(", ")
    }
}
