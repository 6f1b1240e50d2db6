//! Node identity discovery
//!
//! This module handles:
//! - Node name resolution (config override, then hostname)
//! - Primary IPv4 address selection, published to templates as `host_ip`
//! - Alignment with the node name the coordination backend uses
//!
//! Interface priority when none is configured: Ethernet > WiFi > Other.

use if_addrs::{get_if_addrs, IfAddr};
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::coordination::Coordination;
use crate::error::{AgentError, AgentResult};

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Loopback,
    Other,
}

/// An IPv4-carrying interface
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub interface_type: InterfaceType,
}

/// Who this agent is in the fleet
#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub node_name: String,
    pub host_ip: Ipv4Addr,
}

impl NodeIdentity {
    /// Discover node name and primary address
    pub fn discover(config: &NodeConfig) -> AgentResult<Self> {
        let node_name = match &config.name {
            Some(name) => name.clone(),
            None => gethostname::gethostname().to_string_lossy().to_string(),
        };

        let interfaces = enumerate_interfaces()?;
        let host_ip = select_host_ip(&interfaces, config.interface.as_deref())?;

        info!("Node identity - name: {}, host_ip: {}", node_name, host_ip);
        Ok(Self { node_name, host_ip })
    }

    /// Adopt the node name the backend stamps on this agent's sessions.
    /// Keeps the local name when the backend cannot be asked.
    pub async fn align_with_backend<C>(&mut self, coordination: &C)
    where
        C: Coordination + ?Sized,
    {
        match coordination.agent_node_name().await {
            Ok(name) if name != self.node_name => {
                warn!(
                    "Backend knows this node as {} instead of {}, using the backend name",
                    name, self.node_name
                );
                self.node_name = name;
            }
            Ok(_) => {}
            Err(e) => warn!("Could not read backend node name, keeping {}: {}", self.node_name, e),
        }
    }
}

fn enumerate_interfaces() -> AgentResult<Vec<NetworkInterface>> {
    let if_addrs = get_if_addrs().map_err(|e| AgentError::Discovery(e.to_string()))?;

    let interfaces = if_addrs
        .into_iter()
        .filter_map(|if_addr| match if_addr.addr {
            IfAddr::V4(v4) => Some(NetworkInterface {
                interface_type: classify_interface(&if_addr.name),
                name: if_addr.name,
                ip: v4.ip,
            }),
            IfAddr::V6(_) => None,
        })
        .inspect(|interface| debug!("Found interface: {} ({})", interface.name, interface.ip))
        .collect();

    Ok(interfaces)
}

/// Classify interface type based on name patterns
pub fn classify_interface(name: &str) -> InterfaceType {
    let name_lower = name.to_lowercase();

    if name_lower == "lo" || name_lower.starts_with("lo0") || name_lower.starts_with("lo:") {
        return InterfaceType::Loopback;
    }

    if name_lower.contains("wlan") || name_lower.contains("wifi") ||
       name_lower.contains("wlp") || name_lower.contains("wlo") {
        return InterfaceType::Wireless;
    }

    // net0 is the first vnic inside an illumos zone
    if name_lower.starts_with("eth") || name_lower.starts_with("en") ||
       name_lower.starts_with("net") {
        return InterfaceType::Ethernet;
    }

    InterfaceType::Other
}

/// Pick the address published as `host_ip`
pub fn select_host_ip(interfaces: &[NetworkInterface], preferred: Option<&str>) -> AgentResult<Ipv4Addr> {
    if let Some(name) = preferred {
        if let Some(interface) = interfaces.iter().find(|i| i.name == name) {
            return Ok(interface.ip);
        }
        warn!("Configured interface {} has no IPv4 address, falling back to priority order", name);
    }

    let candidates: Vec<_> = interfaces
        .iter()
        .filter(|i| i.interface_type != InterfaceType::Loopback && !i.ip.is_loopback())
        .collect();

    for wanted in [InterfaceType::Ethernet, InterfaceType::Wireless] {
        if let Some(interface) = candidates.iter().find(|i| i.interface_type == wanted) {
            return Ok(interface.ip);
        }
    }

    candidates
        .first()
        .map(|i| i.ip)
        .ok_or_else(|| AgentError::Discovery("no non-loopback IPv4 interface".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: [u8; 4]) -> NetworkInterface {
        NetworkInterface {
            name: name.to_string(),
            ip: Ipv4Addr::from(ip),
            interface_type: classify_interface(name),
        }
    }

    #[test]
    fn test_interface_classification() {
        assert_eq!(classify_interface("eth0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("net0"), InterfaceType::Ethernet);
        assert_eq!(classify_interface("wlan0"), InterfaceType::Wireless);
        assert_eq!(classify_interface("lo"), InterfaceType::Loopback);
        assert_eq!(classify_interface("docker0"), InterfaceType::Other);
    }

    #[test]
    fn test_preferred_interface_wins() {
        let interfaces = vec![iface("eth0", [10, 0, 0, 1]), iface("net1", [10, 0, 1, 5])];
        assert_eq!(
            select_host_ip(&interfaces, Some("net1")).unwrap(),
            Ipv4Addr::new(10, 0, 1, 5)
        );
    }

    #[test]
    fn test_priority_fallback() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1]),
            iface("docker0", [172, 17, 0, 1]),
            iface("wlan0", [192, 168, 1, 20]),
        ];
        assert_eq!(
            select_host_ip(&interfaces, Some("net0")).unwrap(),
            Ipv4Addr::new(192, 168, 1, 20)
        );
    }

    #[test]
    fn test_loopback_only_fails() {
        let interfaces = vec![iface("lo", [127, 0, 0, 1])];
        assert!(select_host_ip(&interfaces, None).is_err());
    }
}
