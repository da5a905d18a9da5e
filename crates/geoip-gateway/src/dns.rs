//! DNS collaborator and server-list parsing.

use std::collections::HashSet;
use std::net::IpAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;

/// Servers reported when no `--dns-servers` file is configured: Cloudflare,
/// Google, and OpenDNS.
pub const DEFAULT_DNS_SERVERS: &[&str] = &["1.1.1.1:53", "8.8.8.8:53", "208.67.222.222:53"];
const DNS_DEFAULT_PORT: u16 = 53;

#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>>;
}

/// Resolves through the operating system's resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn resolve(&self, hostname: &str) -> Result<Vec<IpAddr>> {
        let resolved = tokio::net::lookup_host((hostname, 0))
            .await
            .with_context(|| format!("failed to resolve '{hostname}'"))?;
        let mut seen = HashSet::new();
        Ok(resolved
            .map(|addr| addr.ip())
            .filter(|ip| seen.insert(*ip))
            .collect())
    }
}

/// One server per line; `#` starts a comment. Entries without a port get
/// `:53`.
pub fn parse_dns_server_list(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(with_default_port)
        .collect()
}

fn with_default_port(server: &str) -> String {
    if server.parse::<std::net::SocketAddr>().is_ok() {
        return server.to_string();
    }
    if let Ok(ip) = server.trim_matches(['[', ']']).parse::<IpAddr>() {
        return std::net::SocketAddr::new(ip, DNS_DEFAULT_PORT).to_string();
    }
    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{server}:{DNS_DEFAULT_PORT}"),
    }
}

/// Loose RFC 1123 hostname check applied before resolving.
pub fn is_dns_name(hostname: &str) -> bool {
    let hostname = hostname.strip_suffix('.').unwrap_or(hostname);
    if hostname.is_empty() || hostname.len() > 253 || hostname.parse::<IpAddr>().is_ok() {
        return false;
    }
    hostname.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::{is_dns_name, parse_dns_server_list};

    #[test]
    fn unit_parse_dns_server_list_appends_default_port() {
        let servers = parse_dns_server_list(
            "# resolvers\n9.9.9.9\n1.0.0.1:5353\n\n2606:4700:4700::1111\nns1.example.net # primary\n",
        );
        assert_eq!(
            servers,
            vec![
                "9.9.9.9:53".to_string(),
                "1.0.0.1:5353".to_string(),
                "[2606:4700:4700::1111]:53".to_string(),
                "ns1.example.net:53".to_string(),
            ]
        );
    }

    #[test]
    fn unit_is_dns_name_accepts_hostnames_only() {
        assert!(is_dns_name("example.com"));
        assert!(is_dns_name("a-b.example.co.uk."));
        assert!(is_dns_name("localhost"));
        assert!(!is_dns_name("1.2.3.4"));
        assert!(!is_dns_name("-bad.example.com"));
        assert!(!is_dns_name("bad..example.com"));
        assert!(!is_dns_name("spaces are.bad"));
        assert!(!is_dns_name(""));
    }
}
