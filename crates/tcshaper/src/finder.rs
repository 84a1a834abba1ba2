//! Rule finder
//!
//! Decides whether a requested selector already has a live rule, and if so
//! where that rule is attached. Mark-based filters carry no selector of
//! their own; their effective selector is resolved through the mangle
//! table entry with the same mark.

use crate::parse::{FilterRecord, MangleChain, MangleRecord};
use crate::selector::{Protocol, TrafficSelector};
use crate::store::RuleStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    U32,
    Fw,
}

/// Where an existing rule hangs in the hierarchy, with everything needed
/// to delete or update it without recomputing ids.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub kind: AttachmentKind,
    /// The class the filter targets; update-in-place reuses this as the
    /// explicit parent of the next netem command.
    pub flowid: String,
    /// Parent handle of the filter itself.
    pub parent: String,
    /// `800::800`-style id for u32 filters, `0x65`-style mark for fw.
    pub filter_id: String,
    pub priority: u16,
    /// Mark value for fw attachments.
    pub mark: Option<u32>,
}

/// Find the attachment point of a live rule equivalent to `selector`.
pub fn find_attachment_point(
    store: &RuleStore,
    device: &str,
    selector: &TrafficSelector,
) -> Option<Attachment> {
    let wanted = selector.normalized();

    for record in store.filters_for(device) {
        match record {
            FilterRecord::U32(filter) => {
                let observed = TrafficSelector {
                    protocol: filter.protocol,
                    src_network: filter.src_network,
                    dst_network: filter.dst_network,
                    src_port: filter.src_port,
                    dst_port: filter.dst_port,
                }
                .normalized();
                if observed == wanted {
                    return Some(Attachment {
                        kind: AttachmentKind::U32,
                        flowid: filter.flowid.clone(),
                        parent: filter.parent.clone(),
                        filter_id: filter.filter_id.clone(),
                        priority: filter.priority,
                        mark: None,
                    });
                }
            }
            FilterRecord::Mark(filter) => {
                let Some(entry) = store.mangle_for_mark(filter.handle) else {
                    continue;
                };
                if mark_entry_matches(filter.protocol, entry, &wanted) {
                    return Some(Attachment {
                        kind: AttachmentKind::Fw,
                        flowid: filter.classid.clone(),
                        parent: filter.parent.clone(),
                        filter_id: format!("{:#x}", filter.handle),
                        priority: filter.priority,
                        mark: Some(filter.handle),
                    });
                }
            }
        }
    }

    None
}

/// Whether a mangle entry implements `wanted`. The entry's chain decides
/// how its fields map back onto selector slots: egress entries record the
/// selector networks directly, while ingress entries carry only the remote
/// peer (the selector's destination network, written into the entry's
/// source slot). The requested source network has no live counterpart on
/// ingress, so it cannot discriminate between rules there. Ports are never
/// recorded in mangle entries and rule out a match when requested.
fn mark_entry_matches(protocol: Protocol, entry: &MangleRecord, wanted: &TrafficSelector) -> bool {
    if protocol != wanted.protocol || wanted.src_port.is_some() || wanted.dst_port.is_some() {
        return false;
    }
    match entry.chain {
        MangleChain::Postrouting => {
            entry.src_network == wanted.src_network && entry.dst_network == wanted.dst_network
        }
        MangleChain::Prerouting => entry.src_network == wanted.dst_network,
    }
}

pub fn is_existing_rule(store: &RuleStore, device: &str, selector: &TrafficSelector) -> bool {
    find_attachment_point(store, device, selector).is_some()
}

/// Find an attachment by its externally visible filter id (u32 id or
/// `0x`-prefixed mark), used for deletion by id.
pub fn find_by_filter_id(store: &RuleStore, device: &str, filter_id: &str) -> Option<Attachment> {
    for record in store.filters_for(device) {
        match record {
            FilterRecord::U32(filter) if filter.filter_id == filter_id => {
                return Some(Attachment {
                    kind: AttachmentKind::U32,
                    flowid: filter.flowid.clone(),
                    parent: filter.parent.clone(),
                    filter_id: filter.filter_id.clone(),
                    priority: filter.priority,
                    mark: None,
                });
            }
            FilterRecord::Mark(filter) if format!("{:#x}", filter.handle) == filter_id => {
                return Some(Attachment {
                    kind: AttachmentKind::Fw,
                    flowid: filter.classid.clone(),
                    parent: filter.parent.clone(),
                    filter_id: filter_id.to_string(),
                    priority: filter.priority,
                    mark: Some(filter.handle),
                });
            }
            _ => (),
        }
    }
    None
}
