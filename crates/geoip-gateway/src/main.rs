use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use geoip_cli::{validate_cli, Cli};
use geoip_extensions::{execute_extension_list_command, ExtensionHost, ExtensionHostOptions};
use geoip_gateway::{
    run_gateway_server, GatewayConfig, GatewayState, SystemDnsResolver, UnconfiguredGeoLookup,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    validate_cli(&cli)?;

    if cli.extension_list {
        return execute_extension_list_command(&cli);
    }
    if !cli.serve && cli.ip.is_none() && cli.domain.is_none() {
        println!("Nothing queried");
        return Ok(());
    }

    let config = GatewayConfig::from_cli(&cli)?;
    let extensions = ExtensionHost::load(ExtensionHostOptions::from_cli(&cli))
        .await
        .context("failed to start extensions")?;
    let state = Arc::new(GatewayState::new(
        config,
        Arc::new(UnconfiguredGeoLookup),
        Arc::new(SystemDnsResolver),
        Arc::new(extensions),
    ));

    let result = run_mode(&cli, Arc::clone(&state)).await;
    state.extensions.shutdown().await;
    result
}

async fn run_mode(cli: &Cli, state: Arc<GatewayState>) -> Result<()> {
    if cli.serve {
        return run_gateway_server(state).await;
    }
    if let Some(ip) = cli.ip.as_deref() {
        let address = ip
            .trim()
            .parse::<IpAddr>()
            .with_context(|| format!("invalid --ip '{ip}'"))?;
        let record = state.lookup_ip_record(address, None).await?;
        println!("{}", serde_json::to_string(&record)?);
        return Ok(());
    }
    if let Some(domain) = cli.domain.as_deref() {
        let records = state.lookup_domain_records(domain.trim(), None).await?;
        println!("{}", serde_json::to_string(&records)?);
    }
    Ok(())
}
