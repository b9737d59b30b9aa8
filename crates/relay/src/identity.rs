//! Client identity derived from the connection itself.
//!
//! Clients never announce who they are. The relay names them (random
//! alias), classifies their device from the handshake User-Agent, and
//! groups them by source address so presence only spans one network.

use std::net::IpAddr;

/// Device classification shown to other clients in the same group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_type: String,
    pub device_model: String,
}

/// Best-effort User-Agent classification. Anything unrecognized counts
/// as a desktop.
pub fn parse_user_agent(user_agent: &str) -> DeviceIdentity {
    let ua = user_agent.to_ascii_lowercase();
    let (device_type, device_model) = if ua.contains("iphone") {
        ("mobile", "iPhone")
    } else if ua.contains("ipad") {
        ("tablet", "iPad")
    } else if ua.contains("android") {
        if ua.contains("mobile") {
            ("mobile", "Android")
        } else {
            ("tablet", "Android")
        }
    } else if ua.contains("mac") {
        ("desktop", "Mac")
    } else if ua.contains("windows") {
        ("desktop", "Windows PC")
    } else if ua.contains("linux") {
        ("desktop", "Linux PC")
    } else {
        ("desktop", "Unknown")
    };
    DeviceIdentity {
        device_type: device_type.into(),
        device_model: device_model.into(),
    }
}

/// Presence group key for a source address.
///
/// IPv4 groups by the full address (peers behind the same NAT share it).
/// IPv6 groups by the first four segments, which is the usual /64 prefix.
pub fn ip_group(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => format!("network_{v4}"),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "network_{:x}:{:x}:{:x}:{:x}",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_agents() {
        let phone = parse_user_agent(
            "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) AppleWebKit/605.1.15",
        );
        assert_eq!(phone.device_type, "mobile");
        assert_eq!(phone.device_model, "iPhone");

        let tablet = parse_user_agent("Mozilla/5.0 (Linux; Android 14; SM-X910) AppleWebKit");
        assert_eq!(tablet.device_type, "tablet");

        let desktop = parse_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64)");
        assert_eq!(desktop.device_model, "Windows PC");
    }

    #[test]
    fn classifies_native_client_agent() {
        let identity = parse_user_agent("peerbeam/0.1.0 (linux; workbench)");
        assert_eq!(identity.device_type, "desktop");
        assert_eq!(identity.device_model, "Linux PC");
    }

    #[test]
    fn empty_agent_falls_back_to_desktop() {
        let identity = parse_user_agent("");
        assert_eq!(identity.device_type, "desktop");
        assert_eq!(identity.device_model, "Unknown");
    }

    #[test]
    fn ipv4_groups_by_full_address() {
        let group = ip_group("203.0.113.9".parse().unwrap());
        assert_eq!(group, "network_203.0.113.9");
    }

    #[test]
    fn ipv6_groups_by_prefix() {
        let a = ip_group("2001:db8:aa:bb:1:2:3:4".parse().unwrap());
        let b = ip_group("2001:db8:aa:bb:9:9:9:9".parse().unwrap());
        let c = ip_group("2001:db8:aa:cc:1:2:3:4".parse().unwrap());
        assert_eq!(a, "network_2001:db8:aa:bb");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
