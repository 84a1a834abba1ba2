//! Command sequencer
//!
//! Walks a shaping request through the fixed hierarchy-building steps
//! (redirect device for inbound, root qdisc, default class, rate class,
//! netem qdisc, classifier) and emits one backend command per step. Every
//! identifier is recomputed from a fresh scan immediately before use; the
//! backend's own "File exists" conflict is the collision detector, there
//! is no optimistic concurrency control and no rollback.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::{run_ok, warn_if_module_missing, ShapingBackend};
use crate::error::{Result, ShaperError};
use crate::finder::{find_attachment_point, find_by_filter_id, Attachment, AttachmentKind};
use crate::ids::{device_major_id, netem_major_id, next_class_minor_id, next_mark_id};
use crate::parse::{FilterRecord, MangleChain};
use crate::selector::{Direction, Protocol, TrafficSelector};
use crate::store::{scan_device, RuleStore};
use crate::units::{format_backend_rate, link_speed_bps, TimeValue};

/// Classifier priority used for u32 address/port filters.
const U32_PRIORITY: u16 = 1;
/// Classifier priority used for fw mark filters.
const FW_PRIORITY: u16 = 2;

/// How to treat state that is already present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Refuse if anything conflicting exists.
    #[default]
    New,
    /// Layer an additional rule onto an existing hierarchy.
    Add,
    /// Replace an equivalent rule in place.
    Overwrite,
    /// Update an equivalent rule in place; alias of overwrite at the
    /// backend level, kept separate for CLI symmetry.
    Change,
}

impl RequestMode {
    fn tolerates_existing(self) -> bool {
        !matches!(self, Self::New)
    }

    fn updates_in_place(self) -> bool {
        matches!(self, Self::Overwrite | Self::Change)
    }
}

/// Shaping algorithm variants. A closed set: the sequencer matches on it
/// directly instead of dispatching through a trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShapingAlgorithm {
    #[default]
    Htb,
    /// Classless token bucket: shapes the whole device, no per-flow
    /// classifiers.
    Tbf,
}

/// One fully validated shaping intent.
#[derive(Debug, Clone)]
pub struct ShapingRequest {
    pub device: String,
    pub direction: Direction,
    pub selector: TrafficSelector,
    pub rate_bps: Option<f64>,
    pub delay: Option<TimeValue>,
    pub delay_distro: Option<TimeValue>,
    pub loss_percent: Option<f64>,
    pub duplicate_percent: Option<f64>,
    pub corrupt_percent: Option<f64>,
    pub reorder_percent: Option<f64>,
    pub algorithm: ShapingAlgorithm,
    pub mode: RequestMode,
}

impl ShapingRequest {
    pub fn new(device: impl Into<String>, direction: Direction, selector: TrafficSelector) -> Self {
        Self {
            device: device.into(),
            direction,
            selector,
            rate_bps: None,
            delay: None,
            delay_distro: None,
            loss_percent: None,
            duplicate_percent: None,
            corrupt_percent: None,
            reorder_percent: None,
            algorithm: ShapingAlgorithm::default(),
            mode: RequestMode::default(),
        }
    }
}

/// The reconciliation engine. Owns nothing but the backend handle; all
/// rule state is re-read from the backend on every operation.
pub struct Shaper {
    backend: Arc<dyn ShapingBackend>,
}

impl Shaper {
    pub fn new(backend: Arc<dyn ShapingBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn ShapingBackend {
        self.backend.as_ref()
    }

    /// Reconcile the backend to include the requested rule.
    pub async fn apply(&self, request: &ShapingRequest) -> Result<()> {
        validate(request)?;

        warn_if_module_missing("sch_netem").await;
        if request.direction == Direction::Incoming {
            warn_if_module_missing("ifb").await;
        }

        let shaped = self.resolve_shaped_device(request).await?;

        match request.algorithm {
            ShapingAlgorithm::Htb => self.apply_htb(request, &shaped).await,
            ShapingAlgorithm::Tbf => self.apply_tbf(request, &shaped).await,
        }
    }

    async fn apply_htb(&self, request: &ShapingRequest, shaped: &str) -> Result<()> {
        let scan = scan_device(self.backend(), shaped).await?;
        let attachment = find_attachment_point(&scan.store, shaped, &request.selector);

        if let Some(attachment) = attachment {
            if !request.mode.updates_in_place() {
                return Err(ShaperError::AlreadyExists {
                    what: format!(
                        "shaping rule for {{{}}}",
                        request.selector.canonical_key()
                    ),
                    hint: "rerun with --overwrite or --change to update it".to_string(),
                });
            }
            return self.update_htb_rule(request, shaped, &attachment).await;
        }

        let major = device_major_id(shaped);
        let netem = netem_major_id(shaped);
        let sentinel = link_speed_bps(&request.device);

        self.step(
            &format!(
                "tc qdisc add dev {} root handle {:x}: htb default 1",
                shaped, major
            ),
            request.mode,
        )
        .await?;
        self.step(
            &format!(
                "tc class add dev {} parent {:x}: classid {:x}:1 htb rate {rate} ceil {rate}",
                shaped,
                major,
                major,
                rate = format_backend_rate(sentinel)
            ),
            request.mode,
        )
        .await?;

        // Allocations below must see the hierarchy we just created, so the
        // live sets come from a fresh scan rather than the decision scan.
        let scan = scan_device(self.backend(), shaped).await?;
        let minor = next_class_minor_id(&scan.store.class_minors(shaped, major))?;

        let rate = request.rate_bps.unwrap_or(sentinel);
        self.step(
            &format!(
                "tc class add dev {} parent {:x}: classid {:x}:{:x} htb rate {rate} ceil {rate}",
                shaped,
                major,
                major,
                minor,
                rate = format_backend_rate(rate)
            ),
            request.mode,
        )
        .await?;
        // Layered rules each need a distinct qdisc handle; offsetting by
        // the class minor keeps them unique within the device.
        self.step(
            &format!(
                "tc qdisc add dev {} parent {:x}:{:x} handle {:x}: netem{}",
                shaped,
                major,
                minor,
                netem + minor.saturating_sub(2),
                netem_args(request)
            ),
            request.mode,
        )
        .await?;

        let flowid = format!("{:x}:{:x}", major, minor);
        if wants_mark_dispatch(&request.selector) {
            self.add_mark_filter(request, shaped, &flowid, &scan.store)
                .await?;
        } else {
            self.add_u32_filter(request, shaped, major, &flowid).await?;
        }

        info!(
            "applied {} rule on {} ({})",
            request.direction,
            request.device,
            request.selector.canonical_key()
        );
        Ok(())
    }

    /// Update-in-place: the attachment found by the matcher becomes the
    /// explicit parent of the class/netem change commands; the classifier
    /// and any mangle entry stay untouched.
    async fn update_htb_rule(
        &self,
        request: &ShapingRequest,
        shaped: &str,
        attachment: &Attachment,
    ) -> Result<()> {
        let major = device_major_id(shaped);
        let rate = request.rate_bps.unwrap_or_else(|| link_speed_bps(&request.device));

        run_ok(
            self.backend(),
            &format!(
                "tc class change dev {} parent {:x}: classid {} htb rate {rate} ceil {rate}",
                shaped,
                major,
                attachment.flowid,
                rate = format_backend_rate(rate)
            ),
        )
        .await?;
        run_ok(
            self.backend(),
            &format!(
                "tc qdisc change dev {} parent {} netem{}",
                shaped,
                attachment.flowid,
                netem_args(request)
            ),
        )
        .await?;

        info!(
            "updated {} rule on {} in place at {}",
            request.direction, request.device, attachment.flowid
        );
        Ok(())
    }

    async fn apply_tbf(&self, request: &ShapingRequest, shaped: &str) -> Result<()> {
        let netem = netem_major_id(shaped);
        let major = device_major_id(shaped);

        self.step(
            &format!(
                "tc qdisc add dev {} root handle {:x}: netem{}",
                shaped,
                netem,
                netem_args(request)
            ),
            request.mode,
        )
        .await?;

        if let Some(rate) = request.rate_bps {
            self.step(
                &format!(
                    "tc qdisc add dev {} parent {:x}:1 handle {:x}: tbf rate {} burst 32768b latency 50ms",
                    shaped,
                    netem,
                    major,
                    format_backend_rate(rate)
                ),
                request.mode,
            )
            .await?;
        }

        info!("applied tbf shaping on {}", request.device);
        Ok(())
    }

    async fn add_u32_filter(
        &self,
        request: &ShapingRequest,
        shaped: &str,
        major: u32,
        flowid: &str,
    ) -> Result<()> {
        let selector = request.selector.normalized();
        let keyword = if selector.protocol.is_ipv6() {
            "ip6"
        } else {
            "ip"
        };

        let mut matches = Vec::new();
        if let Some(network) = selector.src_network {
            matches.push(format!("match {} src {}", keyword, network));
        }
        if let Some(network) = selector.dst_network {
            matches.push(format!("match {} dst {}", keyword, network));
        }
        if let Some(port) = selector.src_port {
            matches.push(format!("match {} sport {} 0xffff", keyword, port));
        }
        if let Some(port) = selector.dst_port {
            matches.push(format!("match {} dport {} 0xffff", keyword, port));
        }
        if matches.is_empty() {
            let anywhere = if selector.protocol.is_ipv6() {
                "::/0"
            } else {
                "0.0.0.0/0"
            };
            matches.push(format!("match {} dst {}", keyword, anywhere));
        }

        run_ok(
            self.backend(),
            &format!(
                "tc filter add dev {} protocol {} parent {:x}: prio {} u32 {} flowid {}",
                shaped,
                selector.protocol,
                major,
                U32_PRIORITY,
                matches.join(" "),
                flowid
            ),
        )
        .await?;
        Ok(())
    }

    /// Mark-based dispatch: insert the mangle MARK rule first, then the fw
    /// classifier keyed on the mark. The source/destination roles invert
    /// between directions: egress marks match on destination plus optional
    /// source, ingress marks match on source populated from the request's
    /// destination field. Intentional, mirrors kernel-side ingress
    /// semantics on the redirect device.
    async fn add_mark_filter(
        &self,
        request: &ShapingRequest,
        shaped: &str,
        flowid: &str,
        store: &RuleStore,
    ) -> Result<()> {
        let selector = request.selector.normalized();
        let mark = next_mark_id(&store.live_marks())?;
        let tool = mangle_tool(selector.protocol);

        let mut arguments = String::new();
        let chain = match request.direction {
            Direction::Outgoing => {
                if let Some(network) = selector.dst_network {
                    arguments.push_str(&format!(" -d {}", network));
                }
                if let Some(network) = selector.src_network {
                    arguments.push_str(&format!(" -s {}", network));
                }
                MangleChain::Postrouting
            }
            Direction::Incoming => {
                if let Some(network) = selector.dst_network {
                    arguments.push_str(&format!(" -s {}", network));
                }
                MangleChain::Prerouting
            }
        };

        run_ok(
            self.backend(),
            &format!(
                "{} -t mangle -A {}{} -j MARK --set-mark {}",
                tool,
                chain.as_str(),
                arguments,
                mark
            ),
        )
        .await?;
        run_ok(
            self.backend(),
            &format!(
                "tc filter add dev {} protocol {} parent {}: prio {} handle {} fw flowid {}",
                shaped,
                selector.protocol,
                flowid.split(':').next().unwrap_or_default(),
                FW_PRIORITY,
                mark,
                flowid
            ),
        )
        .await?;
        Ok(())
    }

    /// Delete the rule matching a selector, then tear the hierarchy down
    /// if nothing else is attached.
    pub async fn delete_rule(
        &self,
        device: &str,
        direction: Direction,
        selector: &TrafficSelector,
    ) -> Result<()> {
        let shaped = self
            .shaped_device_for_existing(device, direction)
            .await?;
        let scan = scan_device(self.backend(), &shaped).await?;

        let attachment = find_attachment_point(&scan.store, &shaped, selector).ok_or_else(|| {
            ShaperError::TargetNotFound {
                target: format!("rule {{{}}}", selector.canonical_key()),
                alternatives: rule_keys(&scan.store, &shaped),
            }
        })?;

        self.remove_attachment(&shaped, selector.protocol, &attachment, &scan.store)
            .await?;
        self.teardown_if_empty(device, direction, &shaped).await
    }

    /// Delete by the externally visible filter id shown by the show surface.
    pub async fn delete_by_filter_id(
        &self,
        device: &str,
        direction: Direction,
        filter_id: &str,
    ) -> Result<()> {
        let shaped = self
            .shaped_device_for_existing(device, direction)
            .await?;
        let scan = scan_device(self.backend(), &shaped).await?;

        let attachment = find_by_filter_id(&scan.store, &shaped, filter_id).ok_or_else(|| {
            ShaperError::TargetNotFound {
                target: format!("filter id {}", filter_id),
                alternatives: rule_keys(&scan.store, &shaped),
            }
        })?;
        let protocol = protocol_of(&scan.store, &shaped, &attachment);

        self.remove_attachment(&shaped, protocol, &attachment, &scan.store)
            .await?;
        self.teardown_if_empty(device, direction, &shaped).await
    }

    /// Tear down everything this engine may have configured on a device:
    /// both hierarchies, the redirect device, and all owned marks.
    pub async fn delete_all(&self, device: &str) -> Result<()> {
        let scan = scan_device(self.backend(), device).await?;
        let mut owned_marks: Vec<u32> = Vec::new();
        collect_marks(&scan.store, device, &mut owned_marks);

        let redirect = scan.redirect_device.clone();
        if let Some(ifb) = &redirect {
            let ifb_scan = scan_device(self.backend(), ifb).await?;
            collect_marks(&ifb_scan.store, ifb, &mut owned_marks);
        }

        self.best_effort(&format!("tc qdisc del dev {} root", device))
            .await;
        self.best_effort(&format!("tc qdisc del dev {} ingress", device))
            .await;
        if let Some(ifb) = &redirect {
            self.best_effort(&format!("tc qdisc del dev {} root", ifb)).await;
            self.best_effort(&format!("ip link set dev {} down", ifb)).await;
            self.best_effort(&format!("ip link delete {} type ifb", ifb))
                .await;
        }

        self.delete_mangle_entries(&scan.store, &owned_marks).await?;

        info!("tore down all shaping state on {}", device);
        Ok(())
    }

    async fn remove_attachment(
        &self,
        shaped: &str,
        protocol: Protocol,
        attachment: &Attachment,
        store: &RuleStore,
    ) -> Result<()> {
        match attachment.kind {
            AttachmentKind::U32 => {
                run_ok(
                    self.backend(),
                    &format!(
                        "tc filter del dev {} protocol {} parent {} prio {} handle {} u32",
                        shaped, protocol, attachment.parent, attachment.priority,
                        attachment.filter_id
                    ),
                )
                .await?;
            }
            AttachmentKind::Fw => {
                let mark = attachment.mark.unwrap_or_default();
                run_ok(
                    self.backend(),
                    &format!(
                        "tc filter del dev {} protocol {} parent {} prio {} handle {} fw",
                        shaped, protocol, attachment.parent, attachment.priority, mark
                    ),
                )
                .await?;
                self.delete_mangle_entries(store, &[mark]).await?;
            }
        }
        Ok(())
    }

    /// Delete every mangle entry carrying one of the marks. All entries are
    /// removed in one pass sorted by descending line number, so a deletion
    /// never renumbers a later one: line numbers are only comparable within
    /// one scan, and each chain numbers independently, which a global
    /// descending order also respects.
    async fn delete_mangle_entries(&self, store: &RuleStore, marks: &[u32]) -> Result<()> {
        let mut entries: Vec<_> = marks
            .iter()
            .flat_map(|mark| store.mangles_for_mark(*mark))
            .collect();
        entries.sort_by(|a, b| b.line_number.cmp(&a.line_number));
        for entry in entries {
            run_ok(
                self.backend(),
                &format!(
                    "{} -t mangle -D {} {}",
                    mangle_tool(entry.protocol),
                    entry.chain.as_str(),
                    entry.line_number
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn teardown_if_empty(
        &self,
        device: &str,
        direction: Direction,
        shaped: &str,
    ) -> Result<()> {
        let scan = scan_device(self.backend(), shaped).await?;
        if scan.store.filters_for(shaped).count() > 0 {
            return Ok(());
        }

        debug!("no filters left on {}, tearing down hierarchy", shaped);
        self.best_effort(&format!("tc qdisc del dev {} root", shaped))
            .await;
        if direction == Direction::Incoming {
            self.best_effort(&format!("tc qdisc del dev {} ingress", device))
                .await;
            self.best_effort(&format!("ip link set dev {} down", shaped))
                .await;
            self.best_effort(&format!("ip link delete {} type ifb", shaped))
                .await;
        }
        Ok(())
    }

    /// The device the main chain runs against: the device itself for
    /// egress, the redirect pseudo-device for ingress (created on demand).
    async fn resolve_shaped_device(&self, request: &ShapingRequest) -> Result<String> {
        if request.direction == Direction::Outgoing {
            return Ok(request.device.clone());
        }

        let scan = scan_device(self.backend(), &request.device).await?;
        if let Some(existing) = scan.redirect_device {
            debug!("reusing redirect device {}", existing);
            return Ok(existing);
        }

        let ifb = format!("ifb{}", netem_major_id(&request.device) & 0xFFF);
        self.step(&format!("ip link add {} type ifb", ifb), request.mode)
            .await?;
        run_ok(self.backend(), &format!("ip link set dev {} up", ifb)).await?;
        self.step(
            &format!("tc qdisc add dev {} ingress", request.device),
            request.mode,
        )
        .await?;
        run_ok(
            self.backend(),
            &format!(
                "tc filter add dev {} parent ffff: protocol {} prio {} u32 match u32 0 0 flowid {:x}: action mirred egress redirect dev {}",
                request.device,
                request.selector.protocol,
                U32_PRIORITY,
                device_major_id(&ifb),
                ifb
            ),
        )
        .await?;
        Ok(ifb)
    }

    /// For delete/show paths: the ingress hierarchy lives on the already
    /// established redirect device, never a freshly derived one.
    async fn shaped_device_for_existing(
        &self,
        device: &str,
        direction: Direction,
    ) -> Result<String> {
        if direction == Direction::Outgoing {
            return Ok(device.to_string());
        }
        let scan = scan_device(self.backend(), device).await?;
        scan.redirect_device
            .ok_or_else(|| ShaperError::TargetNotFound {
                target: format!("incoming shaping rules on {}", device),
                alternatives: Vec::new(),
            })
    }

    /// One hierarchy-building step. A "File exists" conflict is a no-op
    /// for tolerant modes and a hard stop with actionable guidance for a
    /// plain set.
    async fn step(&self, command: &str, mode: RequestMode) -> Result<()> {
        let output = self.backend.run(command).await?;
        if output.success() {
            return Ok(());
        }
        if output.already_exists() {
            if mode.tolerates_existing() {
                debug!("already present, continuing: {}", command);
                return Ok(());
            }
            return Err(ShaperError::AlreadyExists {
                what: format!("shaping state touched by `{}`", command),
                hint: "rerun with --overwrite, --add or --change".to_string(),
            });
        }
        Err(ShaperError::Backend {
            command: command.to_string(),
            stderr: output.stderr.trim().to_string(),
        })
    }

    async fn best_effort(&self, command: &str) {
        match self.backend.run(command).await {
            Ok(output) if !output.success() => {
                debug!(
                    "cleanup command failed (ignored): {} ({})",
                    command,
                    output.stderr.trim()
                );
            }
            Ok(_) => (),
            Err(error) => debug!("cleanup command error (ignored): {}", error),
        }
    }
}

/// Mark dispatch is required whenever the selector constrains the source
/// network; u32 source matching on a redirected device sees rewritten
/// headers.
fn wants_mark_dispatch(selector: &TrafficSelector) -> bool {
    selector.normalized().src_network.is_some()
}

/// Marks owned by the engine on a device: the handles of its fw
/// classifiers. Mangle entries for these are removed on full teardown.
fn collect_marks(store: &RuleStore, device: &str, marks: &mut Vec<u32>) {
    for record in store.filters_for(device) {
        if let FilterRecord::Mark(filter) = record {
            if !marks.contains(&filter.handle) {
                marks.push(filter.handle);
            }
        }
    }
}

fn mangle_tool(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Ip => "iptables",
        Protocol::Ipv6 => "ip6tables",
    }
}

fn netem_args(request: &ShapingRequest) -> String {
    let mut args = String::new();
    if let Some(delay) = &request.delay {
        args.push_str(&format!(" delay {}", delay));
        if let Some(jitter) = &request.delay_distro {
            args.push_str(&format!(" {}", jitter));
        }
    }
    if let Some(loss) = request.loss_percent {
        args.push_str(&format!(" loss {}%", loss));
    }
    if let Some(duplicate) = request.duplicate_percent {
        args.push_str(&format!(" duplicate {}%", duplicate));
    }
    if let Some(corrupt) = request.corrupt_percent {
        args.push_str(&format!(" corrupt {}%", corrupt));
    }
    if let Some(reorder) = request.reorder_percent {
        args.push_str(&format!(" reorder {}%", reorder));
    }
    args
}

fn validate(request: &ShapingRequest) -> Result<()> {
    if request.delay_distro.is_some() && request.delay.is_none() {
        return Err(ShaperError::parameter(
            "delay-distro",
            "jitter requires a delay",
        ));
    }
    if request.reorder_percent.is_some() && request.delay.is_none() {
        return Err(ShaperError::parameter(
            "reorder",
            "reordering requires a delay",
        ));
    }
    if request.algorithm == ShapingAlgorithm::Tbf {
        let selector = request.selector.normalized();
        let constrained = selector.src_network.is_some()
            || selector.dst_network.is_some()
            || selector.src_port.is_some()
            || selector.dst_port.is_some();
        if constrained {
            return Err(ShaperError::parameter(
                "shaping-algo",
                "tbf shapes the whole device; traffic selectors require htb",
            ));
        }
    }
    Ok(())
}

fn rule_keys(store: &RuleStore, device: &str) -> Vec<String> {
    store
        .filters_for(device)
        .filter_map(|record| match record {
            FilterRecord::U32(filter) => {
                let selector = TrafficSelector {
                    protocol: filter.protocol,
                    src_network: filter.src_network,
                    dst_network: filter.dst_network,
                    src_port: filter.src_port,
                    dst_port: filter.dst_port,
                };
                Some(selector.canonical_key())
            }
            FilterRecord::Mark(filter) => store.mangle_for_mark(filter.handle).map(|entry| {
                TrafficSelector {
                    protocol: filter.protocol,
                    src_network: entry.src_network,
                    dst_network: entry.dst_network,
                    src_port: None,
                    dst_port: None,
                }
                .canonical_key()
            }),
        })
        .collect()
}

fn protocol_of(store: &RuleStore, device: &str, attachment: &Attachment) -> Protocol {
    store
        .filters_for(device)
        .find_map(|record| match record {
            FilterRecord::U32(filter) if filter.filter_id == attachment.filter_id => {
                Some(filter.protocol)
            }
            FilterRecord::Mark(filter) if Some(filter.handle) == attachment.mark => {
                Some(filter.protocol)
            }
            _ => None,
        })
        .unwrap_or(Protocol::Ip)
}

/// Validate that a device exists, listing the available interfaces when it
/// does not.
pub fn ensure_device(device: &str) -> Result<()> {
    let root = Path::new("/sys/class/net");
    if root.join(device).exists() {
        return Ok(());
    }
    let mut alternatives: Vec<String> = std::fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    alternatives.sort();
    Err(ShaperError::TargetNotFound {
        target: device.to_string(),
        alternatives,
    })
}
