//! Container target resolution
//!
//! Shaping a container means shaping the host-side veth of its network
//! namespace. This module resolves a container name to that device by
//! asking the container runtime for the namespace pid, reading the peer
//! ifindex from inside the namespace, and finding the host interface with
//! that index. Nothing else couples the engine to the runtime.

use crate::backend::{run_ok, ShapingBackend};
use crate::error::{Result, ShaperError};

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub pid: u32,
    pub ip_address: Option<String>,
    pub image: String,
}

/// Look a container up by name or id.
pub async fn resolve_container(
    backend: &dyn ShapingBackend,
    name: &str,
) -> Result<ContainerInfo> {
    let command = format!(
        "docker inspect --format {{{{.Id}}}}|{{{{.Name}}}}|{{{{.State.Pid}}}}|{{{{.NetworkSettings.IPAddress}}}}|{{{{.Config.Image}}}} {}",
        name
    );
    let output = backend.run(&command).await?;
    if !output.success() {
        return Err(ShaperError::TargetNotFound {
            target: format!("container {}", name),
            alternatives: running_containers(backend).await,
        });
    }

    parse_inspect_line(output.stdout.trim()).ok_or_else(|| ShaperError::TargetNotFound {
        target: format!("container {}", name),
        alternatives: Vec::new(),
    })
}

/// Resolve the host-side veth device of a container.
pub async fn container_device(
    backend: &dyn ShapingBackend,
    container: &ContainerInfo,
) -> Result<String> {
    let inside = run_ok(
        backend,
        &format!("nsenter -t {} -n ip link show eth0", container.pid),
    )
    .await?;
    let peer_index = peer_ifindex(&inside.stdout).ok_or_else(|| ShaperError::TargetNotFound {
        target: format!("veth peer of container {}", container.name),
        alternatives: Vec::new(),
    })?;

    let host = run_ok(backend, "ip link show").await?;
    device_by_index(&host.stdout, peer_index).ok_or_else(|| ShaperError::TargetNotFound {
        target: format!("host veth with index {}", peer_index),
        alternatives: Vec::new(),
    })
}

async fn running_containers(backend: &dyn ShapingBackend) -> Vec<String> {
    match backend.run("docker ps --format {{.Names}}").await {
        Ok(output) if output.success() => output
            .stdout
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_inspect_line(line: &str) -> Option<ContainerInfo> {
    let mut fields = line.split('|');
    let id = fields.next()?.to_string();
    let name = fields.next()?.trim_start_matches('/').to_string();
    let pid: u32 = fields.next()?.parse().ok()?;
    let ip_address = fields.next().map(str::to_string).filter(|s| !s.is_empty());
    let image = fields.next()?.to_string();
    Some(ContainerInfo {
        id,
        name,
        pid,
        ip_address,
        image,
    })
}

/// Extract the peer ifindex from an `eth0@if<N>` link line.
fn peer_ifindex(text: &str) -> Option<u32> {
    for token in text.split_whitespace() {
        if let Some(rest) = token.split_once("@if").map(|(_, rest)| rest) {
            if let Ok(index) = rest.trim_end_matches(':').parse() {
                return Some(index);
            }
        }
    }
    None
}

/// Find the interface with a given index in an `ip link show` listing.
fn device_by_index(text: &str, index: u32) -> Option<String> {
    let prefix = format!("{}:", index);
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some(prefix.as_str()) {
            continue;
        }
        let name = tokens.next()?;
        let name = name.split('@').next().unwrap_or(name);
        return Some(name.trim_end_matches(':').to_string());
    }
    None
}
