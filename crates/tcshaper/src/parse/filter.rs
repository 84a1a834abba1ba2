//! Filter listing parser
//!
//! Filter listings are the most stateful of the three diagnostic formats:
//! a classifier announces its flow target on one line and its match
//! clauses as hex value/mask pairs on the following lines. IPv6 matches
//! additionally span up to four clauses per address that have to be
//! stitched back together before they mean anything.

use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

use crate::selector::Protocol;

/// Classifier fragment: an address/port match directing traffic to a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct U32Filter {
    pub device: String,
    /// Parent handle as printed, e.g. `"1f87:"`.
    pub parent: String,
    /// Target flow id, e.g. `"1f87:2"`.
    pub flowid: String,
    /// The filter's own id, e.g. `"800::800"`. This is the externally
    /// visible id used for later deletion.
    pub filter_id: String,
    pub protocol: Protocol,
    pub priority: u16,
    pub src_network: Option<IpNetwork>,
    pub dst_network: Option<IpNetwork>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

/// Packet-mark fragment: a firewall mark dispatched to a class.
#[derive(Debug, Clone, PartialEq)]
pub struct MarkFilter {
    pub device: String,
    pub parent: String,
    pub classid: String,
    /// The mark value, e.g. `0x65` -> 101.
    pub handle: u32,
    pub protocol: Protocol,
    pub priority: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterRecord {
    U32(U32Filter),
    Mark(MarkFilter),
}

/// Result of one pass over a filter listing.
#[derive(Debug, Default)]
pub struct FilterScan {
    pub records: Vec<FilterRecord>,
    /// Device named by an egress-redirect action, if any. This is how the
    /// auxiliary ingress device for a base device is discovered.
    pub redirect_device: Option<String>,
}

const REDIRECT_MARKER: &str = "Egress Redirect to device ";

/// Parse a `filter show` listing. Unrecognized lines are skipped.
pub fn parse_filters(device: &str, text: &str) -> FilterScan {
    let mut scan = FilterScan::default();
    let mut current: Option<U32Builder> = None;

    for line in text.lines() {
        if let Some(position) = line.find(REDIRECT_MARKER) {
            let rest = &line[position + REDIRECT_MARKER.len()..];
            let name: String = rest
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != ')')
                .collect();
            if !name.is_empty() {
                scan.redirect_device = Some(name);
            }
            continue;
        }

        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.first() {
            Some(&"filter") => {
                flush(&mut current, &mut scan.records);
                parse_filter_line(device, &tokens, &mut current, &mut scan.records);
            }
            Some(&"match") => {
                if let Some(builder) = current.as_mut() {
                    apply_match(builder, &tokens);
                }
            }
            _ => (),
        }
    }
    flush(&mut current, &mut scan.records);

    scan
}

fn flush(current: &mut Option<U32Builder>, records: &mut Vec<FilterRecord>) {
    if let Some(builder) = current.take() {
        records.push(FilterRecord::U32(builder.finish()));
    }
}

fn token_after<'a>(tokens: &[&'a str], keyword: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == keyword)
        .and_then(|pos| tokens.get(pos + 1))
        .copied()
}

fn parse_filter_line(
    device: &str,
    tokens: &[&str],
    current: &mut Option<U32Builder>,
    records: &mut Vec<FilterRecord>,
) {
    let Some(parent) = token_after(tokens, "parent") else {
        return;
    };
    let protocol = match token_after(tokens, "protocol") {
        Some("ip") => Protocol::Ip,
        Some("ipv6") => Protocol::Ipv6,
        _ => return,
    };
    let priority: u16 = match token_after(tokens, "pref").map(str::parse) {
        Some(Ok(priority)) => priority,
        _ => return,
    };

    if tokens.contains(&"fw") {
        let Some(handle) = token_after(tokens, "handle")
            .and_then(|t| t.strip_prefix("0x"))
            .and_then(|t| u32::from_str_radix(t, 16).ok())
        else {
            return;
        };
        let Some(classid) = token_after(tokens, "classid") else {
            return;
        };
        records.push(FilterRecord::Mark(MarkFilter {
            device: device.to_string(),
            parent: parent.to_string(),
            classid: classid.to_string(),
            handle,
            protocol,
            priority,
        }));
        return;
    }

    if tokens.contains(&"u32") {
        // Only the `fh x::y ... flowid major:minor` line opens a fragment;
        // the announcement and hash-table lines carry neither.
        let (Some(filter_id), Some(flowid)) =
            (token_after(tokens, "fh"), token_after(tokens, "flowid"))
        else {
            return;
        };
        // A terminal action filter prints `flowid ???`; only handle-shaped
        // targets open a fragment.
        if !flowid.contains(':') {
            return;
        }
        *current = Some(U32Builder::new(
            device, parent, flowid, filter_id, protocol, priority,
        ));
    }
}

fn apply_match(builder: &mut U32Builder, tokens: &[&str]) {
    // Shape: match <hexvalue>/<hexmask> at <offset>
    let Some((value, mask)) = tokens.get(1).and_then(|t| t.split_once('/')) else {
        return;
    };
    let (Ok(value), Ok(mask)) = (
        u32::from_str_radix(value, 16),
        u32::from_str_radix(mask, 16),
    ) else {
        return;
    };
    if tokens.get(2) != Some(&"at") {
        return;
    }
    let Some(Ok(offset)) = tokens.get(3).map(|t| t.parse::<u32>()) else {
        return;
    };
    builder.accumulate(value, mask, offset);
}

/// Accumulates match clauses for one classifier until it is flushed.
struct U32Builder {
    device: String,
    parent: String,
    flowid: String,
    filter_id: String,
    protocol: Protocol,
    priority: u16,
    src_network: Option<IpNetwork>,
    dst_network: Option<IpNetwork>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
    // IPv6 source/destination words in diagnostic order, masked.
    src_words: Vec<u32>,
    src_prefix: u32,
    dst_words: Vec<u32>,
    dst_prefix: u32,
}

impl U32Builder {
    fn new(
        device: &str,
        parent: &str,
        flowid: &str,
        filter_id: &str,
        protocol: Protocol,
        priority: u16,
    ) -> Self {
        Self {
            device: device.to_string(),
            parent: parent.to_string(),
            flowid: flowid.to_string(),
            filter_id: filter_id.to_string(),
            protocol,
            priority,
            src_network: None,
            dst_network: None,
            src_port: None,
            dst_port: None,
            src_words: Vec::new(),
            src_prefix: 0,
            dst_words: Vec::new(),
            dst_prefix: 0,
        }
    }

    fn accumulate(&mut self, value: u32, mask: u32, offset: u32) {
        match self.protocol {
            Protocol::Ip => self.accumulate_v4(value, mask, offset),
            Protocol::Ipv6 => self.accumulate_v6(value, mask, offset),
        }
    }

    fn accumulate_v4(&mut self, value: u32, mask: u32, offset: u32) {
        match offset {
            12 => self.src_network = v4_network(value, mask),
            16 => self.dst_network = v4_network(value, mask),
            20 => self.set_ports(value, mask),
            _ => (),
        }
    }

    fn accumulate_v6(&mut self, value: u32, mask: u32, offset: u32) {
        match offset {
            8 | 12 | 16 | 20 => {
                self.src_words.push(value & mask);
                self.src_prefix += mask.count_ones();
            }
            24 | 28 | 32 | 36 => {
                self.dst_words.push(value & mask);
                self.dst_prefix += mask.count_ones();
            }
            40 => self.set_ports(value, mask),
            _ => (),
        }
    }

    /// Port match: upper 16 bits source, lower 16 bits destination, zero
    /// meaning absent.
    fn set_ports(&mut self, value: u32, mask: u32) {
        let masked = value & mask;
        let src = (masked >> 16) as u16;
        let dst = (masked & 0xFFFF) as u16;
        if src != 0 {
            self.src_port = Some(src);
        }
        if dst != 0 {
            self.dst_port = Some(dst);
        }
    }

    fn finish(mut self) -> U32Filter {
        if self.protocol.is_ipv6() {
            self.src_network = v6_network(&self.src_words, self.src_prefix);
            self.dst_network = v6_network(&self.dst_words, self.dst_prefix);
        }
        U32Filter {
            device: self.device,
            parent: self.parent,
            flowid: self.flowid,
            filter_id: self.filter_id,
            protocol: self.protocol,
            priority: self.priority,
            src_network: self.src_network,
            dst_network: self.dst_network,
            src_port: self.src_port,
            dst_port: self.dst_port,
        }
    }
}

/// An all-zero mask is the "anywhere" sentinel and canonicalizes to absent.
fn v4_network(value: u32, mask: u32) -> Option<IpNetwork> {
    if mask == 0 {
        return None;
    }
    let address = Ipv4Addr::from(value & mask);
    Ipv4Network::new(address, mask.count_ones() as u8)
        .ok()
        .map(IpNetwork::V4)
}

/// Zero-pad the accumulated 32-bit words to a full 128-bit address; the
/// prefix is the summed popcount of the masks seen.
fn v6_network(words: &[u32], prefix: u32) -> Option<IpNetwork> {
    if words.is_empty() || prefix == 0 {
        return None;
    }
    let mut address: u128 = 0;
    for (index, word) in words.iter().take(4).enumerate() {
        address |= (*word as u128) << (96 - 32 * index);
    }
    Ipv6Network::new(Ipv6Addr::from(address), prefix.min(128) as u8)
        .ok()
        .map(IpNetwork::V6)
}
