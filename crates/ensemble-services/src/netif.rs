//! Network interface selection.
//!
//! Discovery, sync and broadcast must all use the same physical path, so
//! every transport resolves its interface through [`select_interface`].

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;

/// One enumerated interface with its first IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    pub addr: Option<Ipv4Addr>,
    pub up: bool,
    pub loopback: bool,
    pub multicast: bool,
    pub virtual_if: bool,
}

impl InterfaceInfo {
    /// Usable for discovery and sync traffic.
    pub fn is_viable(&self) -> bool {
        self.up
            && !self.loopback
            && self.multicast
            && !self.virtual_if
            && !self.name.to_ascii_lowercase().contains("virtual")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    /// Interface used when nothing viable is found.
    pub fn fallback_interface(self) -> &'static str {
        match self {
            Platform::MacOs => "en1",
            Platform::Linux | Platform::Windows | Platform::Other => "wlan0",
        }
    }
}

/// Primary wireless interface on macOS; preferred whenever it is viable.
const MACOS_PRIMARY: &str = "en0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Chosen(InterfaceInfo),
    Fallback(&'static str),
}

impl Selection {
    pub fn name(&self) -> &str {
        match self {
            Selection::Chosen(info) => &info.name,
            Selection::Fallback(name) => name,
        }
    }

    pub fn addr(&self) -> Option<Ipv4Addr> {
        match self {
            Selection::Chosen(info) => info.addr,
            Selection::Fallback(_) => None,
        }
    }
}

/// Pick the interface to use from `candidates`.
///
/// Pure function of its inputs: the same candidate set always yields the
/// same choice on a given platform. Names compare case-insensitively.
pub fn select_interface(candidates: &[InterfaceInfo], platform: Platform) -> Selection {
    let mut viable: Vec<&InterfaceInfo> = candidates.iter().filter(|i| i.is_viable()).collect();
    viable.sort_by(|a, b| {
        a.name
            .to_ascii_lowercase()
            .cmp(&b.name.to_ascii_lowercase())
            .then_with(|| a.name.cmp(&b.name))
    });
    viable.dedup_by(|a, b| a.name == b.name);

    let chosen = match viable.len() {
        0 => None,
        1 => viable.first().copied(),
        _ => match platform {
            Platform::MacOs => viable
                .iter()
                .find(|i| i.name == MACOS_PRIMARY)
                .or_else(|| viable.first())
                .copied(),
            Platform::Linux | Platform::Windows => viable.last().copied(),
            Platform::Other => {
                tracing::warn!(
                    viable = viable.len(),
                    "unrecognised platform, using the first viable interface"
                );
                viable.first().copied()
            }
        },
    };

    match chosen {
        Some(info) => Selection::Chosen(info.clone()),
        None => {
            let fallback = platform.fallback_interface();
            tracing::warn!(
                fallback,
                candidates = candidates.len(),
                "no viable network interface, using fallback"
            );
            Selection::Fallback(fallback)
        }
    }
}

/// Enumerate local interfaces, one entry per interface name.
pub fn enumerate() -> Result<Vec<InterfaceInfo>, nix::Error> {
    let mut by_name: BTreeMap<String, InterfaceInfo> = BTreeMap::new();

    for ifaddr in getifaddrs()? {
        let flags = ifaddr.flags;
        let addr = ifaddr
            .address
            .as_ref()
            .and_then(|a| a.as_sockaddr_in())
            .map(|sin| *SocketAddrV4::from(*sin).ip());

        let entry = by_name
            .entry(ifaddr.interface_name.clone())
            .or_insert_with(|| InterfaceInfo {
                virtual_if: is_virtual_name(&ifaddr.interface_name),
                name: ifaddr.interface_name.clone(),
                addr: None,
                up: flags.contains(InterfaceFlags::IFF_UP)
                    && flags.contains(InterfaceFlags::IFF_RUNNING),
                loopback: flags.contains(InterfaceFlags::IFF_LOOPBACK),
                multicast: flags.contains(InterfaceFlags::IFF_MULTICAST),
            });
        if entry.addr.is_none() {
            entry.addr = addr;
        }
    }

    Ok(by_name.into_values().collect())
}

/// Resolve the interface to use. `configured` wins when non-empty.
pub fn resolve(configured: &str) -> Selection {
    let candidates = match enumerate() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "interface enumeration failed");
            Vec::new()
        }
    };

    if !configured.is_empty() {
        if let Some(info) = candidates.iter().find(|i| i.name == configured) {
            return Selection::Chosen(info.clone());
        }
        tracing::warn!(interface = configured, "configured interface not found");
    }

    select_interface(&candidates, Platform::current())
}

/// Bridges, container pairs and hypervisor adapters.
fn is_virtual_name(name: &str) -> bool {
    const PREFIXES: &[&str] = &["docker", "veth", "virbr", "vmnet", "vboxnet", "br-", "utun"];
    PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str) -> InterfaceInfo {
        InterfaceInfo {
            name: name.to_string(),
            addr: Some(Ipv4Addr::new(10, 0, 0, 2)),
            up: true,
            loopback: false,
            multicast: true,
            virtual_if: false,
        }
    }

    #[test]
    fn filters_non_viable() {
        let mut lo = iface("lo");
        lo.loopback = true;
        let mut down = iface("eth1");
        down.up = false;
        let mut nomc = iface("eth2");
        nomc.multicast = false;
        let mut virt = iface("docker0");
        virt.virtual_if = true;
        let named = iface("VirtualBox Host-Only");

        let candidates = vec![lo, down, nomc, virt, named, iface("eth0")];
        let chosen = select_interface(&candidates, Platform::Linux);
        assert_eq!(chosen.name(), "eth0");
    }

    #[test]
    fn linux_picks_alphabetically_last() {
        let candidates = vec![iface("wlan0"), iface("eth0"), iface("enp3s0")];
        assert_eq!(select_interface(&candidates, Platform::Linux).name(), "wlan0");
        assert_eq!(select_interface(&candidates, Platform::Windows).name(), "wlan0");
    }

    #[test]
    fn ordering_ignores_case() {
        let candidates = vec![iface("Wi-Fi"), iface("ethernet")];
        assert_eq!(select_interface(&candidates, Platform::Windows).name(), "Wi-Fi");

        let candidates = vec![iface("Ethernet 2"), iface("ethernet 3"), iface("Ethernet 2")];
        assert_eq!(select_interface(&candidates, Platform::Windows).name(), "ethernet 3");
        assert_eq!(select_interface(&candidates, Platform::MacOs).name(), "Ethernet 2");
    }

    #[test]
    fn other_platform_picks_first() {
        let candidates = vec![iface("wlan0"), iface("em0"), iface("re0")];
        assert_eq!(select_interface(&candidates, Platform::Other).name(), "em0");
        assert_eq!(Platform::Other.fallback_interface(), "wlan0");
    }

    #[test]
    fn macos_prefers_primary_wireless() {
        let candidates = vec![iface("en5"), iface("en0"), iface("bridge0")];
        assert_eq!(select_interface(&candidates, Platform::MacOs).name(), "en0");
    }

    #[test]
    fn macos_without_primary_picks_alphabetically_first() {
        let candidates = vec![iface("en5"), iface("en3")];
        assert_eq!(select_interface(&candidates, Platform::MacOs).name(), "en3");
    }

    #[test]
    fn selection_is_order_independent() {
        let a = vec![iface("eth0"), iface("eth1")];
        let b = vec![iface("eth1"), iface("eth0")];
        assert_eq!(
            select_interface(&a, Platform::Linux),
            select_interface(&b, Platform::Linux)
        );
    }

    #[test]
    fn nothing_viable_falls_back() {
        let mut lo = iface("lo");
        lo.loopback = true;
        let sel = select_interface(&[lo], Platform::Linux);
        assert_eq!(sel, Selection::Fallback("wlan0"));
        assert_eq!(sel.addr(), None);
        assert_eq!(
            select_interface(&[], Platform::MacOs),
            Selection::Fallback("en1")
        );
    }

    #[test]
    fn virtual_prefixes() {
        assert!(is_virtual_name("veth1234"));
        assert!(is_virtual_name("docker0"));
        assert!(!is_virtual_name("eth0"));
    }
}
