//! Neutron tags identifying the port created for a container interface
//!
//! The same container id, interface, namespace and host always produce the
//! same tags. That is the only way to find a port again on a retried ADD or
//! on DEL, since the cloud has no other record of which call created it.

use crate::models::CniCommand;
use crate::openstack::Port;

/// Marks every port this system creates
pub const MARKER_TAG: &str = "openstack-cni=true";

pub const TAG_CONTAINER_ID: &str = "containerid";
pub const TAG_IFNAME: &str = "ifname";
pub const TAG_NETNS: &str = "netns";
pub const TAG_HOST: &str = "host";

const CONTAINER_ID_LEN: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortTags {
    pub container_id: String,
    pub ifname: String,
    pub netns: String,
    pub host: String,
}

impl PortTags {
    pub fn new(cmd: &CniCommand, host: &str) -> Self {
        Self {
            container_id: cmd.container_id.chars().take(CONTAINER_ID_LEN).collect(),
            ifname: cmd.ifname.clone(),
            netns: cmd.netns.clone(),
            host: host.to_string(),
        }
    }

    /// Read the identifying tags back from a port; missing keys stay empty
    pub fn from_port(port: &Port) -> Self {
        let get = |key: &str| tag_value(&port.tags, key).unwrap_or_default().to_string();
        Self {
            container_id: get(TAG_CONTAINER_ID),
            ifname: get(TAG_IFNAME),
            netns: get(TAG_NETNS),
            host: get(TAG_HOST),
        }
    }

    /// Tag list in the order it is written to the port
    pub fn neutron_tags(&self) -> Vec<String> {
        vec![
            format!("{}={}", TAG_CONTAINER_ID, self.container_id),
            format!("{}={}", TAG_IFNAME, self.ifname),
            format!("{}={}", TAG_NETNS, self.netns),
            MARKER_TAG.to_string(),
            host_tag(&self.host),
        ]
    }
}

pub fn host_tag(host: &str) -> String {
    format!("{}={}", TAG_HOST, host)
}

/// Tags shared by every port created on `host`
pub fn key_tags(host: &str) -> Vec<String> {
    vec![MARKER_TAG.to_string(), host_tag(host)]
}

pub fn has_marker_tag(tags: &[String]) -> bool {
    tags.iter().any(|t| t == MARKER_TAG)
}

/// Value of the first `key=value` tag with the given key
pub fn tag_value<'a>(tags: &'a [String], key: &str) -> Option<&'a str> {
    tags.iter().find_map(|tag| match tag.split_once('=') {
        Some((k, v)) if k == key => Some(v),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(container_id: &str) -> CniCommand {
        CniCommand {
            command: "ADD".to_string(),
            container_id: container_id.to_string(),
            netns: "/proc/1234/ns/net".to_string(),
            ifname: "eth1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_tags_are_deterministic() {
        let cmd = command("0123456789abcdef0123");
        let first = PortTags::new(&cmd, "node-1").neutron_tags();
        let second = PortTags::new(&cmd, "node-1").neutron_tags();
        assert_eq!(first, second);
    }

    #[test]
    fn test_long_container_id_is_truncated() {
        let tags = PortTags::new(&command("0123456789abcdef0123"), "node-1");
        assert_eq!(tags.container_id, "0123456789ab");
        assert_eq!(tags.neutron_tags()[0], "containerid=0123456789ab");
    }

    #[test]
    fn test_short_container_id_is_kept() {
        let tags = PortTags::new(&command("abc"), "node-1");
        assert_eq!(tags.neutron_tags()[0], "containerid=abc");
    }

    #[test]
    fn test_tag_order() {
        let tags = PortTags::new(&command("abc"), "node-1").neutron_tags();
        assert_eq!(
            tags,
            vec![
                "containerid=abc",
                "ifname=eth1",
                "netns=/proc/1234/ns/net",
                "openstack-cni=true",
                "host=node-1",
            ]
        );
    }

    #[test]
    fn test_key_tags_match_neutron_tags() {
        let tags = PortTags::new(&command("abc"), "node-1").neutron_tags();
        for key in key_tags("node-1") {
            assert!(tags.contains(&key));
        }
    }

    #[test]
    fn test_from_port_round_trips_tags() {
        let tags = PortTags::new(&command("abc"), "node-1");
        let port = Port {
            id: "p-1".to_string(),
            name: String::new(),
            network_id: "net-1".to_string(),
            mac_address: String::new(),
            status: "DOWN".to_string(),
            device_id: String::new(),
            device_owner: String::new(),
            fixed_ips: vec![],
            tags: tags.neutron_tags(),
            created_at: None,
        };
        assert_eq!(PortTags::from_port(&port), tags);
        assert!(has_marker_tag(&port.tags));
    }

    #[test]
    fn test_tag_value() {
        let tags = vec!["netns=/proc/1/ns/net".to_string(), "bare".to_string()];
        assert_eq!(tag_value(&tags, "netns"), Some("/proc/1/ns/net"));
        assert_eq!(tag_value(&tags, "bare"), None);
        assert_eq!(tag_value(&tags, "host"), None);
    }
}
