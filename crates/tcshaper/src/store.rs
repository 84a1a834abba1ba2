//! In-memory rule store
//!
//! Holds the parsed fragments of one scan pass and answers the joins the
//! finder and show surfaces need. The store has no invalidation: callers
//! discard and rebuild it via [`scan_device`] before every decision point,
//! because the backend mutates live state outside this process.

use std::collections::BTreeSet;

use crate::backend::{run_listing, ShapingBackend};
use crate::error::Result;
use crate::ids::split_handle;
use crate::parse::{
    parse_classes, parse_filters, parse_mangle, parse_qdiscs, ClassRecord, FilterRecord,
    MangleChain, MangleRecord, QdiscRecord,
};
use crate::selector::Protocol;

#[derive(Debug, Default)]
pub struct RuleStore {
    qdiscs: Vec<QdiscRecord>,
    classes: Vec<ClassRecord>,
    filters: Vec<FilterRecord>,
    mangles: Vec<MangleRecord>,
}

impl RuleStore {
    pub fn clear(&mut self) {
        self.qdiscs.clear();
        self.classes.clear();
        self.filters.clear();
        self.mangles.clear();
    }

    pub fn insert_qdiscs(&mut self, records: impl IntoIterator<Item = QdiscRecord>) {
        self.qdiscs.extend(records);
    }

    pub fn insert_classes(&mut self, records: impl IntoIterator<Item = ClassRecord>) {
        self.classes.extend(records);
    }

    pub fn insert_filters(&mut self, records: impl IntoIterator<Item = FilterRecord>) {
        self.filters.extend(records);
    }

    pub fn insert_mangles(&mut self, records: impl IntoIterator<Item = MangleRecord>) {
        self.mangles.extend(records);
    }

    pub fn filters_for<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a FilterRecord> {
        self.filters.iter().filter(move |record| match record {
            FilterRecord::U32(f) => f.device == device,
            FilterRecord::Mark(f) => f.device == device,
        })
    }

    pub fn classes_for<'a>(&'a self, device: &'a str) -> impl Iterator<Item = &'a ClassRecord> {
        self.classes.iter().filter(move |c| c.device == device)
    }

    /// Mangle entry backing a packet mark, if the firewall still has it.
    pub fn mangle_for_mark(&self, mark: u32) -> Option<&MangleRecord> {
        self.mangles.iter().find(|m| m.mark == mark)
    }

    pub fn mangles_for_mark<'a>(&'a self, mark: u32) -> impl Iterator<Item = &'a MangleRecord> {
        self.mangles.iter().filter(move |m| m.mark == mark)
    }

    /// Live class minor ids under one major on a device. Input to the
    /// first-gap minor allocator.
    pub fn class_minors(&self, device: &str, major: u32) -> BTreeSet<u32> {
        self.classes_for(device)
            .filter_map(|class| split_handle(&class.classid))
            .filter(|(class_major, _)| *class_major == major)
            .filter_map(|(_, minor)| minor)
            .collect()
    }

    /// Live firewall marks, across all devices: the mangle table is a
    /// system-wide resource.
    pub fn live_marks(&self) -> BTreeSet<u32> {
        let mut marks: BTreeSet<u32> = self.mangles.iter().map(|m| m.mark).collect();
        for record in &self.filters {
            if let FilterRecord::Mark(filter) = record {
                marks.insert(filter.handle);
            }
        }
        marks
    }

    /// Join: the netem qdisc attached under a filter's target flow.
    pub fn netem_for_parent(&self, device: &str, flowid: &str) -> Option<&QdiscRecord> {
        self.qdiscs
            .iter()
            .find(|q| q.device == device && q.parent.as_deref() == Some(flowid))
    }

    /// Join: the class a filter's flowid points at.
    pub fn class_by_id(&self, device: &str, classid: &str) -> Option<&ClassRecord> {
        self.classes
            .iter()
            .find(|c| c.device == device && c.classid == classid)
    }
}

/// One fresh parse pass over a device's live backend state.
#[derive(Debug, Default)]
pub struct DeviceScan {
    pub store: RuleStore,
    /// Auxiliary ingress-redirect device discovered from the filter
    /// listing, if the device has one.
    pub redirect_device: Option<String>,
}

/// Rebuild the rule store from the live diagnostic listings of `device`.
pub async fn scan_device(backend: &dyn ShapingBackend, device: &str) -> Result<DeviceScan> {
    let mut scan = DeviceScan::default();

    let text = run_listing(backend, &format!("tc qdisc show dev {}", device)).await?;
    scan.store.insert_qdiscs(parse_qdiscs(device, &text));

    let text = run_listing(backend, &format!("tc class show dev {}", device)).await?;
    scan.store.insert_classes(parse_classes(device, &text));

    let text = run_listing(backend, &format!("tc filter show dev {}", device)).await?;
    let filters = parse_filters(device, &text);
    scan.redirect_device = filters.redirect_device;
    scan.store.insert_filters(filters.records);

    for (tool, protocol) in [("iptables", Protocol::Ip), ("ip6tables", Protocol::Ipv6)] {
        for chain in [MangleChain::Prerouting, MangleChain::Postrouting] {
            let command = format!("{} -t mangle -L {} -n --line-numbers", tool, chain.as_str());
            let text = run_listing(backend, &command).await?;
            scan.store
                .insert_mangles(parse_mangle(chain, protocol, &text));
        }
    }

    Ok(scan)
}
