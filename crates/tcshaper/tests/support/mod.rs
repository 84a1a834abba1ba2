//! Scripted backend for reconciliation tests
//!
//! Keeps a miniature model of qdisc/class/filter/mangle state, applies the
//! engine's add/change/del commands to it, and renders show listings in
//! the same grammar the real tools print. This lets the end-to-end flows
//! (set, show, delete) run unprivileged while still exercising the real
//! parse-and-reconcile loop.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Mutex;

use async_trait::async_trait;
use tcshaper::error::Result as ShaperResult;
use tcshaper::{CommandOutput, ShapingBackend};

#[derive(Debug, Default)]
struct MockClass {
    classid: String,
    rate: String,
}

#[derive(Debug)]
struct MockNetem {
    handle: String,
    /// `"root"` or a `major:minor` parent.
    parent: String,
    args: Vec<String>,
}

#[derive(Debug)]
enum MockFilter {
    U32 {
        pref: u16,
        protocol: String,
        parent: String,
        matches: Vec<(u32, u32, u32)>, // value, mask, offset
        flowid: String,
        fh: String,
    },
    Fw {
        pref: u16,
        protocol: String,
        parent: String,
        mark: u32,
        classid: String,
    },
}

#[derive(Debug, Default)]
struct DeviceState {
    root_handle: Option<String>,
    classes: Vec<MockClass>,
    netems: Vec<MockNetem>,
    filters: Vec<MockFilter>,
    ingress: bool,
    redirect_to: Option<String>,
    filter_seq: u32,
}

#[derive(Debug)]
struct MangleEntry {
    tool: String,
    chain: String,
    src: Option<String>,
    dst: Option<String>,
    mark: u32,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<String, DeviceState>,
    links: Vec<String>,
    mangle: Vec<MangleEntry>,
}

#[derive(Debug, Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    log: Mutex<Vec<String>>,
}

/// Honors `RUST_LOG` so a failing flow can be rerun with engine traces.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command issued so far, in order.
    pub fn issued(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn has_link(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.iter().any(|l| l == name)
    }

    pub fn mangle_entry_count(&self) -> usize {
        self.state.lock().unwrap().mangle.len()
    }

    pub fn filter_count(&self, device: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .devices
            .get(device)
            .map(|d| d.filters.len())
            .unwrap_or(0)
    }
}

fn ok() -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn ok_with(stdout: String) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout,
        stderr: String::new(),
    }
}

fn file_exists() -> CommandOutput {
    CommandOutput {
        code: 2,
        stdout: String::new(),
        stderr: "RTNETLINK answers: File exists".to_string(),
    }
}

fn no_such_file() -> CommandOutput {
    CommandOutput {
        code: 2,
        stdout: String::new(),
        stderr: "RTNETLINK answers: No such file or directory".to_string(),
    }
}

fn unrecognized(command: &str) -> CommandOutput {
    CommandOutput {
        code: 1,
        stdout: String::new(),
        stderr: format!("mock backend: unrecognized command: {}", command),
    }
}

#[async_trait]
impl ShapingBackend for MockBackend {
    async fn run(&self, command: &str) -> ShaperResult<CommandOutput> {
        self.log.lock().unwrap().push(command.to_string());
        let tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        let tokens: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let mut state = self.state.lock().unwrap();
        Ok(dispatch(&mut state, &tokens, command))
    }
}

fn token_after<'a>(tokens: &[&'a str], keyword: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == keyword)
        .and_then(|pos| tokens.get(pos + 1))
        .copied()
}

fn dispatch(state: &mut MockState, tokens: &[&str], command: &str) -> CommandOutput {
    match tokens {
        ["tc", "qdisc", rest @ ..] => tc_qdisc(state, rest, command),
        ["tc", "class", rest @ ..] => tc_class(state, rest, command),
        ["tc", "filter", rest @ ..] => tc_filter(state, rest, command),
        ["ip", "link", rest @ ..] => ip_link(state, rest, command),
        ["iptables", rest @ ..] => mangle(state, "iptables", rest, command),
        ["ip6tables", rest @ ..] => mangle(state, "ip6tables", rest, command),
        _ => unrecognized(command),
    }
}

fn tc_qdisc(state: &mut MockState, tokens: &[&str], command: &str) -> CommandOutput {
    let Some(device) = token_after(tokens, "dev") else {
        return unrecognized(command);
    };

    match tokens.first() {
        Some(&"add") => {
            let entry = state.devices.entry(device.to_string()).or_default();
            if tokens.contains(&"ingress") {
                if entry.ingress {
                    return file_exists();
                }
                entry.ingress = true;
                return ok();
            }
            if let Some(netem_pos) = tokens.iter().position(|t| *t == "netem") {
                let parent = if tokens.contains(&"root") {
                    "root".to_string()
                } else {
                    match token_after(tokens, "parent") {
                        Some(parent) => parent.to_string(),
                        None => return unrecognized(command),
                    }
                };
                if entry.netems.iter().any(|n| n.parent == parent) {
                    return file_exists();
                }
                let handle = token_after(tokens, "handle")
                    .unwrap_or("8001:")
                    .trim_end_matches(':')
                    .to_string();
                entry.netems.push(MockNetem {
                    handle,
                    parent,
                    args: tokens[netem_pos + 1..].iter().map(|t| t.to_string()).collect(),
                });
                return ok();
            }
            if tokens.contains(&"htb") {
                if entry.root_handle.is_some() {
                    return file_exists();
                }
                let handle = token_after(tokens, "handle")
                    .unwrap_or("1:")
                    .trim_end_matches(':')
                    .to_string();
                entry.root_handle = Some(handle);
                return ok();
            }
            if tokens.contains(&"tbf") {
                // Modeled as a netem-parented child; nothing reads it back.
                return ok();
            }
            unrecognized(command)
        }
        Some(&"change") => {
            let Some(entry) = state.devices.get_mut(device) else {
                return no_such_file();
            };
            let Some(netem_pos) = tokens.iter().position(|t| *t == "netem") else {
                return unrecognized(command);
            };
            let parent = token_after(tokens, "parent").unwrap_or("root").to_string();
            match entry.netems.iter_mut().find(|n| n.parent == parent) {
                Some(netem) => {
                    netem.args = tokens[netem_pos + 1..].iter().map(|t| t.to_string()).collect();
                    ok()
                }
                None => no_such_file(),
            }
        }
        Some(&"del") => {
            let Some(entry) = state.devices.get_mut(device) else {
                return no_such_file();
            };
            if tokens.contains(&"ingress") {
                if !entry.ingress {
                    return no_such_file();
                }
                entry.ingress = false;
                entry.redirect_to = None;
                return ok();
            }
            if entry.root_handle.is_none() && entry.netems.is_empty() {
                return no_such_file();
            }
            entry.root_handle = None;
            entry.classes.clear();
            entry.netems.clear();
            entry.filters.clear();
            ok()
        }
        Some(&"show") => {
            let Some(entry) = state.devices.get(device) else {
                return ok_with(String::new());
            };
            ok_with(render_qdiscs(entry))
        }
        _ => unrecognized(command),
    }
}

fn tc_class(state: &mut MockState, tokens: &[&str], command: &str) -> CommandOutput {
    let Some(device) = token_after(tokens, "dev") else {
        return unrecognized(command);
    };

    match tokens.first() {
        Some(&"add") => {
            let entry = state.devices.entry(device.to_string()).or_default();
            let (Some(classid), Some(rate)) =
                (token_after(tokens, "classid"), token_after(tokens, "rate"))
            else {
                return unrecognized(command);
            };
            if entry.classes.iter().any(|c| c.classid == classid) {
                return file_exists();
            }
            entry.classes.push(MockClass {
                classid: classid.to_string(),
                rate: rate.to_string(),
            });
            ok()
        }
        Some(&"change") => {
            let Some(entry) = state.devices.get_mut(device) else {
                return no_such_file();
            };
            let (Some(classid), Some(rate)) =
                (token_after(tokens, "classid"), token_after(tokens, "rate"))
            else {
                return unrecognized(command);
            };
            match entry.classes.iter_mut().find(|c| c.classid == classid) {
                Some(class) => {
                    class.rate = rate.to_string();
                    ok()
                }
                None => no_such_file(),
            }
        }
        Some(&"show") => {
            let Some(entry) = state.devices.get(device) else {
                return ok_with(String::new());
            };
            ok_with(render_classes(entry))
        }
        _ => unrecognized(command),
    }
}

fn tc_filter(state: &mut MockState, tokens: &[&str], command: &str) -> CommandOutput {
    let Some(device) = token_after(tokens, "dev") else {
        return unrecognized(command);
    };

    match tokens.first() {
        Some(&"add") => {
            let entry = state.devices.entry(device.to_string()).or_default();
            if tokens.contains(&"mirred") {
                let Some(target) = tokens.last() else {
                    return unrecognized(command);
                };
                entry.redirect_to = Some(target.to_string());
                return ok();
            }

            let protocol = token_after(tokens, "protocol").unwrap_or("ip").to_string();
            let parent = token_after(tokens, "parent").unwrap_or("1:").to_string();
            let pref: u16 = token_after(tokens, "prio")
                .and_then(|t| t.parse().ok())
                .unwrap_or(1);

            if tokens.contains(&"fw") {
                let (Some(mark), Some(classid)) =
                    (token_after(tokens, "handle"), token_after(tokens, "flowid"))
                else {
                    return unrecognized(command);
                };
                let Ok(mark) = mark.parse::<u32>() else {
                    return unrecognized(command);
                };
                entry.filters.push(MockFilter::Fw {
                    pref,
                    protocol,
                    parent,
                    mark,
                    classid: classid.to_string(),
                });
                return ok();
            }

            let Some(flowid) = token_after(tokens, "flowid") else {
                return unrecognized(command);
            };
            let matches = match parse_match_clauses(tokens) {
                Some(matches) => matches,
                None => return unrecognized(command),
            };
            entry.filter_seq += 1;
            let fh = format!("{:x}::{:x}", 0x800, 0x800 + entry.filter_seq - 1);
            entry.filters.push(MockFilter::U32 {
                pref,
                protocol,
                parent,
                matches,
                flowid: flowid.to_string(),
                fh,
            });
            ok()
        }
        Some(&"del") => {
            let Some(entry) = state.devices.get_mut(device) else {
                return no_such_file();
            };
            let Some(handle) = token_after(tokens, "handle") else {
                return unrecognized(command);
            };
            let before = entry.filters.len();
            if tokens.contains(&"fw") {
                let Ok(mark) = handle.parse::<u32>() else {
                    return unrecognized(command);
                };
                entry
                    .filters
                    .retain(|f| !matches!(f, MockFilter::Fw { mark: m, .. } if *m == mark));
            } else {
                entry
                    .filters
                    .retain(|f| !matches!(f, MockFilter::U32 { fh, .. } if fh == handle));
            }
            if entry.filters.len() == before {
                return no_such_file();
            }
            ok()
        }
        Some(&"show") => {
            let Some(entry) = state.devices.get(device) else {
                return ok_with(String::new());
            };
            ok_with(render_filters(entry))
        }
        _ => unrecognized(command),
    }
}

fn ip_link(state: &mut MockState, tokens: &[&str], command: &str) -> CommandOutput {
    match tokens.first() {
        Some(&"add") => {
            let Some(name) = tokens.get(1) else {
                return unrecognized(command);
            };
            if state.links.iter().any(|l| l == name) {
                return file_exists();
            }
            state.links.push(name.to_string());
            ok()
        }
        Some(&"set") => ok(),
        Some(&"delete") => {
            let Some(name) = tokens.get(1) else {
                return unrecognized(command);
            };
            state.links.retain(|l| l != *name);
            state.devices.remove(*name);
            ok()
        }
        _ => unrecognized(command),
    }
}

fn mangle(state: &mut MockState, tool: &str, tokens: &[&str], command: &str) -> CommandOutput {
    if tokens.first() != Some(&"-t") || tokens.get(1) != Some(&"mangle") {
        return unrecognized(command);
    }
    match tokens.get(2) {
        Some(&"-A") => {
            let Some(chain) = tokens.get(3) else {
                return unrecognized(command);
            };
            let Some(mark) = token_after(tokens, "--set-mark").and_then(|t| t.parse().ok()) else {
                return unrecognized(command);
            };
            state.mangle.push(MangleEntry {
                tool: tool.to_string(),
                chain: chain.to_string(),
                src: token_after(tokens, "-s").map(str::to_string),
                dst: token_after(tokens, "-d").map(str::to_string),
                mark,
            });
            ok()
        }
        Some(&"-D") => {
            let (Some(chain), Some(number)) = (tokens.get(3), tokens.get(4)) else {
                return unrecognized(command);
            };
            let Ok(number) = number.parse::<usize>() else {
                return unrecognized(command);
            };
            let mut seen = 0usize;
            let mut removed = false;
            state.mangle.retain(|entry| {
                if removed || entry.tool != tool || entry.chain != *chain {
                    return true;
                }
                seen += 1;
                if seen == number {
                    removed = true;
                    return false;
                }
                true
            });
            if removed {
                ok()
            } else {
                no_such_file()
            }
        }
        Some(&"-L") => {
            let Some(chain) = tokens.get(3) else {
                return unrecognized(command);
            };
            ok_with(render_mangle(state, tool, chain))
        }
        _ => unrecognized(command),
    }
}

// ---- rendering in the real tools' grammar ----

fn render_qdiscs(entry: &DeviceState) -> String {
    let mut out = String::new();
    if let Some(handle) = &entry.root_handle {
        out.push_str(&format!(
            "qdisc htb {}: root refcnt 2 r2q 10 default 0x1 direct_packets_stat 0\n",
            handle
        ));
    }
    if entry.ingress {
        out.push_str("qdisc ingress ffff: parent ffff:fff1 ----------------\n");
    }
    for netem in &entry.netems {
        let position = if netem.parent == "root" {
            "root".to_string()
        } else {
            format!("parent {}", netem.parent)
        };
        out.push_str(&format!(
            "qdisc netem {}: {} limit 1000{}\n",
            netem.handle,
            position,
            render_netem_args(&netem.args)
        ));
    }
    out
}

/// Netem argument rendering mirrors tc: time values get one decimal place,
/// jitter follows the delay after a double space.
fn render_netem_args(args: &[String]) -> String {
    let mut out = String::new();
    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "delay" => {
                if let Some(value) = args.get(index + 1) {
                    out.push_str(&format!(" delay {}", tc_time(value)));
                    index += 2;
                    if let Some(jitter) = args.get(index) {
                        if jitter.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                            out.push_str(&format!("  {}", tc_time(jitter)));
                            index += 1;
                        }
                    }
                } else {
                    index += 1;
                }
            }
            key @ ("loss" | "duplicate" | "corrupt" | "reorder") => {
                if let Some(value) = args.get(index + 1) {
                    out.push_str(&format!(" {} {}", key, value));
                }
                index += 2;
            }
            _ => index += 1,
        }
    }
    out
}

/// `10ms` -> `10.0ms`, the way tc prints time values.
fn tc_time(token: &str) -> String {
    let unit_start = token
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(token.len());
    let (number, unit) = token.split_at(unit_start);
    match number.parse::<f64>() {
        Ok(value) => format!("{:.1}{}", value, unit),
        Err(_) => token.to_string(),
    }
}

fn render_classes(entry: &DeviceState) -> String {
    let mut out = String::new();
    for class in &entry.classes {
        out.push_str(&format!(
            "class htb {} root prio 0 rate {rate} ceil {rate} burst 1600b cburst 1600b\n",
            class.classid,
            rate = class.rate
        ));
    }
    out
}

fn render_filters(entry: &DeviceState) -> String {
    let mut out = String::new();
    for filter in &entry.filters {
        match filter {
            MockFilter::U32 {
                pref,
                protocol,
                parent,
                matches,
                flowid,
                fh,
            } => {
                out.push_str(&format!(
                    "filter parent {parent} protocol {protocol} pref {pref} u32 chain 0\n"
                ));
                out.push_str(&format!(
                    "filter parent {parent} protocol {protocol} pref {pref} u32 chain 0 fh 800: ht divisor 1\n"
                ));
                out.push_str(&format!(
                    "filter parent {parent} protocol {protocol} pref {pref} u32 chain 0 fh {fh} order 2048 key ht 800 bkt 0 flowid {flowid} not_in_hw\n"
                ));
                for (value, mask, offset) in matches {
                    out.push_str(&format!(
                        "  match {:08x}/{:08x} at {}\n",
                        value, mask, offset
                    ));
                }
            }
            MockFilter::Fw {
                pref,
                protocol,
                parent,
                mark,
                classid,
            } => {
                out.push_str(&format!(
                    "filter parent {parent} protocol {protocol} pref {pref} fw chain 0 handle {mark:#x} classid {classid}\n"
                ));
            }
        }
    }
    if let Some(target) = &entry.redirect_to {
        out.push_str(
            "filter parent ffff: protocol ip pref 49152 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0 terminal flowid ??? not_in_hw\n",
        );
        out.push_str("  match 00000000/00000000 at 0\n");
        out.push_str(&format!(
            "\taction order 1: mirred (Egress Redirect to device {}) stream\n",
            target
        ));
    }
    out
}

fn render_mangle(state: &MockState, tool: &str, chain: &str) -> String {
    let anywhere = if tool == "ip6tables" { "::/0" } else { "0.0.0.0/0" };
    let mut out = format!("Chain {} (policy ACCEPT)\n", chain);
    if tool == "ip6tables" {
        out.push_str("num  target     prot     source               destination\n");
    } else {
        out.push_str("num  target     prot opt source               destination\n");
    }
    let mut number = 0;
    for entry in &state.mangle {
        if entry.tool != tool || entry.chain != chain {
            continue;
        }
        number += 1;
        let src = entry.src.as_deref().unwrap_or(anywhere);
        let dst = entry.dst.as_deref().unwrap_or(anywhere);
        if tool == "ip6tables" {
            out.push_str(&format!(
                "{}    MARK       all      {}            {}            MARK set {:#x}\n",
                number, src, dst, entry.mark
            ));
        } else {
            out.push_str(&format!(
                "{}    MARK       all  --  {}            {}            MARK set {:#x}\n",
                number, src, dst, entry.mark
            ));
        }
    }
    out
}

/// Translate the engine's symbolic match clauses into the hex value/mask
/// pairs the real tool prints back.
fn parse_match_clauses(tokens: &[&str]) -> Option<Vec<(u32, u32, u32)>> {
    let mut matches = Vec::new();
    let mut index = 0;
    while index < tokens.len() {
        if tokens[index] != "match" {
            index += 1;
            continue;
        }
        let keyword = tokens.get(index + 1)?;
        let field = tokens.get(index + 2)?;
        let value = tokens.get(index + 3)?;
        match (*keyword, *field) {
            ("u32", _) => {
                index += 4;
            }
            ("ip", "src") => {
                matches.push(v4_match(value, 12)?);
                index += 4;
            }
            ("ip", "dst") => {
                matches.push(v4_match(value, 16)?);
                index += 4;
            }
            ("ip", "sport") => {
                let port: u32 = value.parse().ok()?;
                matches.push((port << 16, 0xFFFF_0000, 20));
                index += 5;
            }
            ("ip", "dport") => {
                let port: u32 = value.parse().ok()?;
                matches.push((port, 0x0000_FFFF, 20));
                index += 5;
            }
            ("ip6", "src") => {
                matches.extend(v6_match(value, 8)?);
                index += 4;
            }
            ("ip6", "dst") => {
                matches.extend(v6_match(value, 24)?);
                index += 4;
            }
            ("ip6", "sport") => {
                let port: u32 = value.parse().ok()?;
                matches.push((port << 16, 0xFFFF_0000, 40));
                index += 5;
            }
            ("ip6", "dport") => {
                let port: u32 = value.parse().ok()?;
                matches.push((port, 0x0000_FFFF, 40));
                index += 5;
            }
            _ => return None,
        }
    }
    Some(matches)
}

fn v4_match(cidr: &str, offset: u32) -> Option<(u32, u32, u32)> {
    let (address, prefix) = split_cidr(cidr)?;
    let address: Ipv4Addr = address.parse().ok()?;
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    Some((u32::from(address) & mask, mask, offset))
}

fn v6_match(cidr: &str, base_offset: u32) -> Option<Vec<(u32, u32, u32)>> {
    let (address, prefix) = split_cidr(cidr)?;
    let address: Ipv6Addr = address.parse().ok()?;
    let bits = u128::from(address);
    let full_mask = if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    };
    let mut words = Vec::new();
    for slot in 0..4u32 {
        let shift = 96 - 32 * slot;
        let mask = ((full_mask >> shift) & 0xFFFF_FFFF) as u32;
        if mask == 0 {
            continue;
        }
        let value = ((bits >> shift) & 0xFFFF_FFFF) as u32;
        words.push((value & mask, mask, base_offset + 4 * slot));
    }
    Some(words)
}

fn split_cidr(cidr: &str) -> Option<(&str, u32)> {
    match cidr.split_once('/') {
        Some((address, prefix)) => Some((address, prefix.parse().ok()?)),
        None => Some((cidr, if cidr.contains(':') { 128 } else { 32 })),
    }
}
