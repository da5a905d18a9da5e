use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use geoip_cli::Cli;
use geoip_extensions::{parse_ip_list, IpSet};

use crate::dns::{parse_dns_server_list, DEFAULT_DNS_SERVERS};

/// Server settings resolved once from the command line.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind: SocketAddr,
    pub whitelist: Option<IpSet>,
    pub dns_servers: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8228)),
            whitelist: None,
            dns_servers: default_dns_servers(),
        }
    }
}

impl GatewayConfig {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let ip = cli
            .sip
            .trim()
            .parse::<IpAddr>()
            .with_context(|| format!("invalid --sip '{}': expected an IP address", cli.sip))?;

        let whitelist = match cli.whitelist.as_deref() {
            Some(path) if cli.serve => Some(load_whitelist(path)?),
            _ => None,
        };

        let dns_servers = match cli.dns_servers.as_deref() {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| {
                    format!("failed to read DNS server list {}", path.display())
                })?;
                parse_dns_server_list(&text)
            }
            None => default_dns_servers(),
        };

        Ok(Self {
            bind: SocketAddr::new(ip, cli.port),
            whitelist,
            dns_servers,
        })
    }
}

fn default_dns_servers() -> Vec<String> {
    DEFAULT_DNS_SERVERS
        .iter()
        .map(|server| server.to_string())
        .collect()
}

pub fn load_whitelist(path: &Path) -> Result<IpSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read whitelist {}", path.display()))?;
    let entries = parse_ip_list(&text)
        .map_err(|message| anyhow!(message))
        .with_context(|| format!("failed to parse whitelist {}", path.display()))?;
    IpSet::from_entries(entries).map_err(|message| anyhow!(message))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use geoip_cli::Cli;
    use tempfile::tempdir;

    use super::GatewayConfig;

    #[test]
    fn unit_gateway_config_reads_whitelist_and_dns_files() {
        let temp = tempdir().expect("tempdir");
        let whitelist = temp.path().join("allow.txt");
        std::fs::write(&whitelist, "# office\n198.51.100.0/24\n203.0.113.9\n").expect("write");
        let servers = temp.path().join("dns.txt");
        std::fs::write(&servers, "9.9.9.9\n").expect("write");

        let cli = Cli::try_parse_from([
            "geoip-service",
            "--serve",
            "--sip",
            "0.0.0.0",
            "--port",
            "9000",
            "--whitelist",
            whitelist.to_str().expect("utf8"),
            "--dns-servers",
            servers.to_str().expect("utf8"),
        ])
        .expect("parse");
        let config = GatewayConfig::from_cli(&cli).expect("config");

        assert_eq!(config.bind.to_string(), "0.0.0.0:9000");
        let whitelist = config.whitelist.expect("whitelist loaded");
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.contains("198.51.100.77"));
        assert_eq!(config.dns_servers, vec!["9.9.9.9:53".to_string()]);
    }

    #[test]
    fn regression_gateway_config_rejects_malformed_whitelist() {
        let temp = tempdir().expect("tempdir");
        let whitelist = temp.path().join("allow.txt");
        std::fs::write(&whitelist, "10.0.0.1\nnot-an-address\n").expect("write");
        let cli = Cli::try_parse_from([
            "geoip-service",
            "--serve",
            "--whitelist",
            whitelist.to_str().expect("utf8"),
        ])
        .expect("parse");

        let error = GatewayConfig::from_cli(&cli).expect_err("malformed whitelist");
        assert!(format!("{error:#}").contains("invalid IP address \"not-an-address\""));
    }

    #[test]
    fn unit_gateway_config_defaults_dns_servers() {
        let cli = Cli::try_parse_from(["geoip-service"]).expect("parse");
        let config = GatewayConfig::from_cli(&cli).expect("config");
        assert_eq!(config.bind.to_string(), "127.0.0.1:8228");
        assert!(config.whitelist.is_none());
        assert_eq!(config.dns_servers.len(), 3);
    }
}
