use std::path::PathBuf;

use clap::{ArgAction, Parser};

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Parser)]
#[command(
    name = "geoip-service",
    about = "IP and domain geolocation service with scripted extensions",
    version
)]
pub struct Cli {
    #[arg(
        long = "serve",
        env = "GEOIP_SERVE",
        action = ArgAction::SetTrue,
        help = "Run the HTTP server"
    )]
    pub serve: bool,

    #[arg(
        long = "sip",
        env = "GEOIP_SERVE_IP",
        default_value = "127.0.0.1",
        value_name = "ip",
        help = "The IP to serve on (127.0.0.1 will make it accessible only from localhost)"
    )]
    pub sip: String,

    #[arg(
        long = "port",
        env = "GEOIP_PORT",
        default_value_t = 8228,
        value_name = "port",
        help = "The TCP port to serve on"
    )]
    pub port: u16,

    #[arg(
        long = "ip",
        env = "GEOIP_IP",
        value_name = "addr",
        help = "Look up a single IP address, print the record as JSON, and exit"
    )]
    pub ip: Option<String>,

    #[arg(
        long = "domain",
        env = "GEOIP_DOMAIN",
        conflicts_with = "ip",
        value_name = "name",
        help = "Resolve a domain, print one record per address as JSON, and exit"
    )]
    pub domain: Option<String>,

    #[arg(
        long = "whitelist",
        env = "GEOIP_WHITELIST",
        value_name = "path",
        help = "File of allowed client IPs/CIDR ranges, one per line (only used with --serve)"
    )]
    pub whitelist: Option<PathBuf>,

    #[arg(
        long = "dns-servers",
        env = "GEOIP_DNS_SERVERS",
        value_name = "path",
        help = "File listing DNS servers, one per line; defaults to Cloudflare, Google, and OpenDNS"
    )]
    pub dns_servers: Option<PathBuf>,

    #[arg(
        long = "extensions-dir",
        env = "GEOIP_EXTENSIONS_DIR",
        default_value = "extensions",
        value_name = "path",
        help = "Root directory holding one subdirectory per extension"
    )]
    pub extensions_dir: PathBuf,

    #[arg(
        long = "extension-list",
        env = "GEOIP_EXTENSION_LIST",
        action = ArgAction::SetTrue,
        conflicts_with = "serve",
        help = "List discovered extension packages from --extensions-dir and exit"
    )]
    pub extension_list: bool,

    #[arg(
        long = "extension-call-timeout-ms",
        env = "GEOIP_EXTENSION_CALL_TIMEOUT_MS",
        default_value_t = 5_000,
        value_parser = parse_positive_u64,
        value_name = "ms",
        help = "Deadline for one extension endpoint, job, or lookup call"
    )]
    pub extension_call_timeout_ms: u64,

    #[arg(
        long = "extension-memory-limit-mb",
        env = "GEOIP_EXTENSION_MEMORY_LIMIT_MB",
        default_value_t = 64,
        value_parser = parse_positive_usize,
        value_name = "mb",
        help = "Heap ceiling for each extension interpreter"
    )]
    pub extension_memory_limit_mb: usize,

    #[arg(
        long = "skip-broken-extensions",
        env = "GEOIP_SKIP_BROKEN_EXTENSIONS",
        action = ArgAction::SetTrue,
        help = "Log and skip extensions that fail to bootstrap instead of aborting startup"
    )]
    pub skip_broken_extensions: bool,
}
