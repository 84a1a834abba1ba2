//! CLI command implementations
//!
//! Thin argument-to-request translation over the tcshaper engine. All
//! magnitude parsing happens here, before any device lookup or backend
//! call, so typos fail fast and without privileges.

use std::sync::Arc;

use anyhow::Result;
use clap::{Args, ValueEnum};
use ipnetwork::IpNetwork;
use tcshaper::container::{container_device, resolve_container};
use tcshaper::show::{export, render};
use tcshaper::units::{parse_bandwidth, parse_percent, parse_time, KiloSize};
use tcshaper::{
    collect_rules, ensure_device, Direction, Protocol, RequestMode, ShaperError, Shaper,
    ShapingAlgorithm, ShapingBackend, ShapingRequest, TcBackend, TrafficSelector,
};
use tracing::info;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum DirectionArg {
    Outgoing,
    Incoming,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Outgoing => Direction::Outgoing,
            DirectionArg::Incoming => Direction::Incoming,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AlgorithmArg {
    Htb,
    Tbf,
}

impl From<AlgorithmArg> for ShapingAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Htb => ShapingAlgorithm::Htb,
            AlgorithmArg::Tbf => ShapingAlgorithm::Tbf,
        }
    }
}

#[derive(Args, Debug)]
pub struct SetArgs {
    /// Network device, or container name with --container
    pub device: String,

    /// Treat the target as a running docker container
    #[arg(long)]
    pub container: bool,

    /// Traffic direction to shape
    #[arg(long, value_enum, default_value = "outgoing")]
    pub direction: DirectionArg,

    /// Bandwidth cap, e.g. 250Kbps or 1Mbps
    #[arg(long)]
    pub rate: Option<String>,

    /// Added latency, e.g. 10ms (bare numbers are milliseconds)
    #[arg(long)]
    pub delay: Option<String>,

    /// Latency jitter, requires --delay
    #[arg(long)]
    pub delay_distro: Option<String>,

    /// Packet loss percentage
    #[arg(long)]
    pub loss: Option<String>,

    /// Packet duplication percentage
    #[arg(long)]
    pub duplicate: Option<String>,

    /// Packet corruption percentage
    #[arg(long)]
    pub corrupt: Option<String>,

    /// Packet reordering percentage, requires --delay
    #[arg(long)]
    pub reorder: Option<String>,

    /// Source network CIDR to match
    #[arg(long)]
    pub src_network: Option<String>,

    /// Destination network CIDR to match
    #[arg(long)]
    pub dst_network: Option<String>,

    /// Source port to match
    #[arg(long)]
    pub src_port: Option<u16>,

    /// Destination port to match
    #[arg(long)]
    pub dst_port: Option<u16>,

    /// Match IPv6 traffic instead of IPv4
    #[arg(long)]
    pub ipv6: bool,

    /// Shaping algorithm
    #[arg(long = "shaping-algo", value_enum, default_value = "htb")]
    pub shaping_algo: AlgorithmArg,

    /// Update an equivalent existing rule in place
    #[arg(long, conflicts_with_all = ["add", "change"])]
    pub overwrite: bool,

    /// Layer an additional rule next to the existing ones
    #[arg(long, conflicts_with = "change")]
    pub add: bool,

    /// Change shaping parameters without rebuilding the hierarchy
    #[arg(long)]
    pub change: bool,
}

#[derive(Args, Debug)]
pub struct DelArgs {
    /// Network device, or container name with --container
    pub device: String,

    /// Treat the target as a running docker container
    #[arg(long)]
    pub container: bool,

    /// Traffic direction the rule was applied to
    #[arg(long, value_enum, default_value = "outgoing")]
    pub direction: DirectionArg,

    /// Tear down every rule, both directions, including marks
    #[arg(long)]
    pub all: bool,

    /// Delete the rule with this filter id (as printed by show)
    #[arg(long, conflicts_with = "all")]
    pub filter_id: Option<String>,

    /// Source network CIDR of the rule to delete
    #[arg(long)]
    pub src_network: Option<String>,

    /// Destination network CIDR of the rule to delete
    #[arg(long)]
    pub dst_network: Option<String>,

    /// Source port of the rule to delete
    #[arg(long)]
    pub src_port: Option<u16>,

    /// Destination port of the rule to delete
    #[arg(long)]
    pub dst_port: Option<u16>,

    /// The rule matches IPv6 traffic
    #[arg(long)]
    pub ipv6: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Network device, or container name with --container
    pub device: String,

    /// Treat the target as a running docker container
    #[arg(long)]
    pub container: bool,

    /// Also write the JSON to a file
    #[arg(long)]
    pub export: Option<std::path::PathBuf>,
}

pub async fn cmd_set(args: SetArgs) -> Result<()> {
    let selector = build_selector(
        args.ipv6,
        args.src_network.as_deref(),
        args.dst_network.as_deref(),
        args.src_port,
        args.dst_port,
    )?;

    let rate_bps = args
        .rate
        .as_deref()
        .map(|text| parse_bandwidth(text, KiloSize::K1000))
        .transpose()?;
    let delay = args.delay.as_deref().map(parse_time).transpose()?;
    let delay_distro = args.delay_distro.as_deref().map(parse_time).transpose()?;
    let loss = parse_percent_arg(args.loss.as_deref())?;
    let duplicate = parse_percent_arg(args.duplicate.as_deref())?;
    let corrupt = parse_percent_arg(args.corrupt.as_deref())?;
    let reorder = parse_percent_arg(args.reorder.as_deref())?;

    let backend: Arc<dyn ShapingBackend> = Arc::new(TcBackend);
    let device = resolve_target(backend.as_ref(), &args.device, args.container).await?;

    let mut request = ShapingRequest::new(device, Direction::from(args.direction), selector);
    request.rate_bps = rate_bps;
    request.delay = delay;
    request.delay_distro = delay_distro;
    request.loss_percent = loss;
    request.duplicate_percent = duplicate;
    request.corrupt_percent = corrupt;
    request.reorder_percent = reorder;
    request.algorithm = args.shaping_algo.into();
    request.mode = if args.overwrite {
        RequestMode::Overwrite
    } else if args.change {
        RequestMode::Change
    } else if args.add {
        RequestMode::Add
    } else {
        RequestMode::New
    };

    let shaper = Shaper::new(backend);
    shaper.apply(&request).await?;
    Ok(())
}

pub async fn cmd_del(args: DelArgs) -> Result<()> {
    let backend: Arc<dyn ShapingBackend> = Arc::new(TcBackend);
    let device = resolve_target(backend.as_ref(), &args.device, args.container).await?;
    let shaper = Shaper::new(backend);

    if args.all {
        shaper.delete_all(&device).await?;
        info!("removed all shaping rules on {}", device);
        return Ok(());
    }

    let direction = Direction::from(args.direction);
    if let Some(filter_id) = &args.filter_id {
        shaper
            .delete_by_filter_id(&device, direction, filter_id)
            .await?;
        return Ok(());
    }

    let has_selector = args.src_network.is_some()
        || args.dst_network.is_some()
        || args.src_port.is_some()
        || args.dst_port.is_some();
    if !has_selector {
        return Err(ShaperError::parameter(
            "del",
            "nothing to delete; pass --all, --filter-id or selector flags",
        )
        .into());
    }

    let selector = build_selector(
        args.ipv6,
        args.src_network.as_deref(),
        args.dst_network.as_deref(),
        args.src_port,
        args.dst_port,
    )?;
    shaper.delete_rule(&device, direction, &selector).await?;
    Ok(())
}

pub async fn cmd_show(args: ShowArgs) -> Result<()> {
    let backend: Arc<dyn ShapingBackend> = Arc::new(TcBackend);
    let device = resolve_target(backend.as_ref(), &args.device, args.container).await?;

    let rules = collect_rules(backend.as_ref(), &device).await?;
    println!("{}", render(&rules)?);

    if let Some(path) = &args.export {
        export(path, &rules)?;
        info!("exported rules to {}", path.display());
    }
    Ok(())
}

/// Map the CLI target to the device the engine operates on. Containers
/// resolve through docker to the host-side veth device.
async fn resolve_target(
    backend: &dyn ShapingBackend,
    target: &str,
    container: bool,
) -> Result<String> {
    if container {
        let info = resolve_container(backend, target).await?;
        let device = container_device(backend, &info).await?;
        info!("container {} maps to device {}", info.name, device);
        return Ok(device);
    }
    ensure_device(target)?;
    Ok(target.to_string())
}

fn parse_percent_arg(text: Option<&str>) -> Result<Option<f64>> {
    Ok(text.map(|t| parse_percent(t, 100.0)).transpose()?)
}

fn build_selector(
    ipv6: bool,
    src_network: Option<&str>,
    dst_network: Option<&str>,
    src_port: Option<u16>,
    dst_port: Option<u16>,
) -> Result<TrafficSelector> {
    let protocol = if ipv6 { Protocol::Ipv6 } else { Protocol::Ip };
    let mut selector = TrafficSelector::new(protocol);
    selector.src_network = parse_network("src-network", src_network, protocol)?;
    selector.dst_network = parse_network("dst-network", dst_network, protocol)?;
    selector.src_port = src_port;
    selector.dst_port = dst_port;
    Ok(selector)
}

/// Parse a CIDR flag and reject a family that contradicts the protocol;
/// a silent mismatch would build a filter that never matches anything.
fn parse_network(
    flag: &str,
    text: Option<&str>,
    protocol: Protocol,
) -> Result<Option<IpNetwork>> {
    let Some(text) = text else {
        return Ok(None);
    };
    let network: IpNetwork = text
        .parse()
        .map_err(|error| ShaperError::parameter(flag, format!("{}: {}", text, error)))?;
    match (protocol, &network) {
        (Protocol::Ip, IpNetwork::V6(_)) => Err(ShaperError::parameter(
            flag,
            format!("{} is IPv6; pass --ipv6", text),
        )
        .into()),
        (Protocol::Ipv6, IpNetwork::V4(_)) => Err(ShaperError::parameter(
            flag,
            format!("{} is IPv4; drop --ipv6", text),
        )
        .into()),
        _ => Ok(Some(network)),
    }
}
