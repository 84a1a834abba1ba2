//! Joined rule view: the read-back surface
//!
//! Rebuilds the rule set from a fresh diagnostic parse and joins each
//! classifier with the class and netem qdisc it targets, dropping the
//! handle plumbing and keeping only shaping intent. Output is keyed
//! device -> direction -> canonical selector.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::backend::ShapingBackend;
use crate::error::Result;
use crate::parse::FilterRecord;
use crate::selector::TrafficSelector;
use crate::store::{scan_device, RuleStore};
use crate::units::{format_bandwidth, parse_bandwidth, KiloSize};

/// One joined shaping rule, minus implementation plumbing.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RuleBody {
    pub filter_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(rename = "delay-distro", skip_serializing_if = "Option::is_none")]
    pub delay_distro: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loss: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrupt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reorder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
}

/// Rules of one direction, keyed by canonical selector.
pub type DirectionRules = BTreeMap<String, RuleBody>;
/// Rules of one device, keyed by direction name.
pub type DeviceRules = BTreeMap<String, DirectionRules>;
/// The full show result, keyed by device.
pub type RuleSet = BTreeMap<String, DeviceRules>;

/// Read back everything currently shaped on a device.
pub async fn collect_rules(backend: &dyn ShapingBackend, device: &str) -> Result<RuleSet> {
    let scan = scan_device(backend, device).await?;

    let mut rules = DeviceRules::new();
    rules.insert("outgoing".to_string(), join_rules(&scan.store, device));

    let incoming = match &scan.redirect_device {
        Some(ifb) => {
            let ifb_scan = scan_device(backend, ifb).await?;
            join_rules(&ifb_scan.store, ifb)
        }
        None => DirectionRules::new(),
    };
    rules.insert("incoming".to_string(), incoming);

    let mut set = RuleSet::new();
    set.insert(device.to_string(), rules);
    Ok(set)
}

fn join_rules(store: &RuleStore, device: &str) -> DirectionRules {
    let mut rules = DirectionRules::new();

    for record in store.filters_for(device) {
        let (selector, filter_id, flowid) = match record {
            FilterRecord::U32(filter) => (
                TrafficSelector {
                    protocol: filter.protocol,
                    src_network: filter.src_network,
                    dst_network: filter.dst_network,
                    src_port: filter.src_port,
                    dst_port: filter.dst_port,
                },
                filter.filter_id.clone(),
                filter.flowid.clone(),
            ),
            FilterRecord::Mark(filter) => {
                // A mark filter means nothing without its mangle entry.
                let Some(entry) = store.mangle_for_mark(filter.handle) else {
                    continue;
                };
                (
                    TrafficSelector {
                        protocol: filter.protocol,
                        src_network: entry.src_network,
                        dst_network: entry.dst_network,
                        src_port: None,
                        dst_port: None,
                    },
                    format!("{:#x}", filter.handle),
                    filter.classid.clone(),
                )
            }
        };

        let netem = store.netem_for_parent(device, &flowid);
        let rate = store
            .class_by_id(device, &flowid)
            .and_then(|class| class.rate.as_deref())
            .map(display_rate);

        let body = RuleBody {
            filter_id,
            delay: netem.and_then(|q| q.delay.clone()),
            delay_distro: netem.and_then(|q| q.delay_distro.clone()),
            loss: netem.and_then(|q| q.loss.clone()),
            duplicate: netem.and_then(|q| q.duplicate.clone()),
            corrupt: netem.and_then(|q| q.corrupt.clone()),
            reorder: netem.and_then(|q| q.reorder.clone()),
            rate,
        };
        rules.insert(selector.canonical_key(), body);
    }

    rules
}

/// Convert the backend's `250Kbit` rate grammar back to `250Kbps`. A token
/// the parser does not understand is passed through untouched.
fn display_rate(token: &str) -> String {
    match parse_bandwidth(token, KiloSize::K1000) {
        Ok(bps) => format_bandwidth(bps),
        Err(_) => token.to_string(),
    }
}

/// Render the rule set the way the show verb prints it.
pub fn render(rules: &RuleSet) -> Result<String> {
    Ok(serde_json::to_string_pretty(rules)?)
}

/// Write-only export of the joined rule set to an external file.
pub fn export(path: &Path, rules: &RuleSet) -> Result<()> {
    std::fs::write(path, render(rules)?)?;
    Ok(())
}
