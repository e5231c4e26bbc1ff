//! Typed configuration contract read once at `init`, deserialized from TOML
//! via `serde`, matching spec.md §6's field list exactly.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, TunnelError};

#[derive(Debug, Clone, Deserialize)]
pub struct MappedDnsConfig {
    pub map_address: Ipv4Addr,
    pub map_port: u16,
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_cache_size() -> usize {
    256
}

#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    pub tunnel_name: String,
    pub tunnel_mtu: u16,
    pub tunnel_ipv4_address: Option<IpAddr>,
    pub tunnel_ipv6_address: Option<IpAddr>,
    pub post_up_script: Option<String>,
    pub pre_down_script: Option<String>,
    #[serde(default)]
    pub max_session_count: usize,
    pub socks5_server: std::net::SocketAddr,
    pub mapped_dns: Option<MappedDnsConfig>,
    #[serde(default)]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub tunnel: TunnelConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| TunnelError::Configuration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TunnelError::Configuration(format!("reading {}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_round_trips() {
        let toml = r#"
            [tunnel]
            tunnel_name = "tun0"
            tunnel_mtu = 1500
            socks5_server = "127.0.0.1:1080"
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.tunnel.tunnel_name, "tun0");
        assert_eq!(config.tunnel.max_session_count, 0);
        assert!(config.tunnel.mapped_dns.is_none());
    }

    #[test]
    fn full_config_round_trips() {
        let toml = r#"
            [tunnel]
            tunnel_name = "tun0"
            tunnel_mtu = 1500
            tunnel_ipv4_address = "10.0.0.2"
            post_up_script = "/etc/tunwire/up.sh"
            pre_down_script = "/etc/tunwire/down.sh"
            max_session_count = 4096
            socks5_server = "127.0.0.1:1080"
            worker_threads = 8

            [tunnel.mapped_dns]
            map_address = "198.18.0.1"
            map_port = 53
            network = "198.18.0.0"
            netmask = "255.254.0.0"
            cache_size = 512
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.tunnel.max_session_count, 4096);
        let dns = config.tunnel.mapped_dns.unwrap();
        assert_eq!(dns.cache_size, 512);
    }

    #[test]
    fn invalid_toml_is_a_configuration_error() {
        let err = Config::from_toml_str("not valid toml {{{").unwrap_err();
        assert!(matches!(err, TunnelError::Configuration(_)));
    }
}
