//! Packet-mark (mangle table) listing parser
//!
//! Mark-based classifiers carry no match criteria of their own; the
//! selector they implement lives in the firewall's mangle table. This
//! parser reads the numeric table listing back into records so the rule
//! finder can resolve a mark to the networks it stands for.

use ipnetwork::IpNetwork;

use crate::selector::Protocol;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MangleChain {
    /// Traversed by inbound packets before routing.
    Prerouting,
    /// Traversed by outbound packets after routing.
    Postrouting,
}

impl MangleChain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Prerouting => "PREROUTING",
            Self::Postrouting => "POSTROUTING",
        }
    }
}

/// One MARK rule from the mangle table.
#[derive(Debug, Clone, PartialEq)]
pub struct MangleRecord {
    pub chain: MangleChain,
    pub protocol: Protocol,
    pub src_network: Option<IpNetwork>,
    pub dst_network: Option<IpNetwork>,
    pub mark: u32,
    /// Position within the chain, used for deletion by rule number.
    pub line_number: u32,
}

/// Parse a numeric `--line-numbers` mangle chain listing. Only MARK targets
/// are recognized; everything else (headers, other targets) is skipped.
pub fn parse_mangle(chain: MangleChain, protocol: Protocol, text: &str) -> Vec<MangleRecord> {
    let mut records = Vec::new();

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        // Shape: num  MARK  prot  opt  source  destination  MARK set 0xNN
        let Some(Ok(line_number)) = tokens.first().map(|t| t.parse::<u32>()) else {
            continue;
        };
        if tokens.get(1) != Some(&"MARK") {
            continue;
        }

        let Some(mark) = tokens
            .last()
            .and_then(|t| t.strip_prefix("0x"))
            .and_then(|t| u32::from_str_radix(t, 16).ok())
        else {
            continue;
        };

        // IPv6 listings have no `opt` column.
        let (src_index, dst_index) = match protocol {
            Protocol::Ip => (4, 5),
            Protocol::Ipv6 => (3, 4),
        };
        let src_network = tokens.get(src_index).and_then(|t| parse_network(t));
        let dst_network = tokens.get(dst_index).and_then(|t| parse_network(t));

        records.push(MangleRecord {
            chain,
            protocol,
            src_network,
            dst_network,
            mark,
            line_number,
        });
    }

    records
}

/// `0.0.0.0/0` / `::/0` (and the non-numeric `anywhere`) mean no constraint.
fn parse_network(token: &str) -> Option<IpNetwork> {
    let network: IpNetwork = token.parse().ok()?;
    if network.prefix() == 0 {
        return None;
    }
    Some(network)
}
