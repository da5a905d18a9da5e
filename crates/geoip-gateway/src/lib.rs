//! HTTP surface of the geoip service.
//!
//! Serves the fixed lookup routes, mounts every extension's endpoints under
//! `/api/<name>/`, enriches lookup records with extension fan-out data, and
//! guards everything behind the optional client whitelist.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Json, Router};
use geoip_extensions::registrar::resolve_client_ip;
use geoip_extensions::ExtensionHost;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub mod config;
pub mod dns;
pub mod geo;
pub mod whitelist;

pub use config::GatewayConfig;
pub use dns::{DnsResolver, SystemDnsResolver};
pub use geo::{GeoLookup, IpRecord, UnconfiguredGeoLookup};

pub const IP_INFO_ENDPOINT: &str = "/api/ip_address/info/{hostname}";
pub const DOMAIN_INFO_ENDPOINT: &str = "/api/domain/info/{hostname}";
pub const DNS_SERVERS_ENDPOINT: &str = "/api/dns/servers";

/// Everything a request handler needs; built once at startup.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub geo: Arc<dyn GeoLookup>,
    pub dns: Arc<dyn DnsResolver>,
    pub extensions: Arc<ExtensionHost>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        geo: Arc<dyn GeoLookup>,
        dns: Arc<dyn DnsResolver>,
        extensions: Arc<ExtensionHost>,
    ) -> Self {
        Self {
            config,
            geo,
            dns,
            extensions,
        }
    }

    /// Geo record for `address` with extension fan-out attached.
    pub async fn lookup_ip_record(&self, address: IpAddr, caller: Option<&str>) -> Result<IpRecord> {
        let mut record = self.geo.lookup(address)?;
        record.additional_data = self
            .extensions
            .lookup_additional_data(&address.to_string(), caller)
            .await;
        Ok(record)
    }

    /// One record per resolved address. Addresses the geo backend cannot
    /// answer for are left out.
    pub async fn lookup_domain_records(
        &self,
        hostname: &str,
        caller: Option<&str>,
    ) -> Result<Vec<IpRecord>> {
        if !dns::is_dns_name(hostname) {
            anyhow::bail!("invalid input");
        }
        let addresses = self.dns.resolve(hostname).await?;
        let mut records = Vec::with_capacity(addresses.len());
        for address in addresses {
            match self.lookup_ip_record(address, caller).await {
                Ok(record) => records.push(record),
                Err(error) => {
                    debug!(hostname, address = %address, error = %error, "skipping unresolvable address")
                }
            }
        }
        Ok(records)
    }
}

#[derive(Debug, Serialize)]
struct RecordResponse {
    success: bool,
    status: String,
    record: Option<IpRecord>,
}

#[derive(Debug, Serialize)]
struct RecordsResponse {
    success: bool,
    status: String,
    records: Vec<IpRecord>,
}

#[derive(Debug, Serialize)]
struct DnsServersResponse {
    success: bool,
    servers: Vec<String>,
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(IP_INFO_ENDPOINT, get(handle_ip_info))
        .route(DOMAIN_INFO_ENDPOINT, get(handle_domain_info))
        .route(DNS_SERVERS_ENDPOINT, get(handle_dns_servers))
        .with_state(Arc::clone(&state))
        .merge(state.extensions.router())
        .fallback(handle_not_found)
        .layer(middleware::from_fn_with_state(
            state,
            whitelist::enforce_whitelist,
        ))
}

async fn handle_ip_info(
    State(state): State<Arc<GatewayState>>,
    Path(hostname): Path<String>,
    request: Request,
) -> Response {
    let Ok(address) = hostname.trim().parse::<IpAddr>() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(RecordResponse {
                success: false,
                status: "Invalid input".to_string(),
                record: None,
            }),
        )
            .into_response();
    };
    let (parts, _) = request.into_parts();
    let caller = resolve_client_ip(&parts);
    let caller = (!caller.is_empty()).then_some(caller.as_str());

    let response = match state.lookup_ip_record(address, caller).await {
        Ok(record) => RecordResponse {
            success: true,
            status: "Retrieved".to_string(),
            record: Some(record),
        },
        Err(error) => RecordResponse {
            success: true,
            status: error.to_string(),
            record: None,
        },
    };
    Json(response).into_response()
}

async fn handle_domain_info(
    State(state): State<Arc<GatewayState>>,
    Path(hostname): Path<String>,
    request: Request,
) -> Response {
    let (parts, _) = request.into_parts();
    let caller = resolve_client_ip(&parts);
    let caller = (!caller.is_empty()).then_some(caller.as_str());

    let response = match state.lookup_domain_records(hostname.trim(), caller).await {
        Ok(records) => RecordsResponse {
            success: true,
            status: "Retrieved".to_string(),
            records,
        },
        Err(error) => RecordsResponse {
            success: false,
            status: error.to_string(),
            records: Vec::new(),
        },
    };
    Json(response).into_response()
}

async fn handle_dns_servers(State(state): State<Arc<GatewayState>>) -> Response {
    Json(DnsServersResponse {
        success: true,
        servers: state.config.dns_servers.clone(),
    })
    .into_response()
}

async fn handle_not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Serves until Ctrl-C. The caller owns the extension host and shuts it
/// down afterwards.
pub async fn run_gateway_server(state: Arc<GatewayState>) -> Result<()> {
    let bind_addr = state.config.bind;
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind geoip server on {bind_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound geoip server address")?;

    println!(
        "geoip server listening: addr={} extensions={} whitelist={}",
        local_addr,
        state.extensions.instances().len(),
        state
            .config
            .whitelist
            .as_ref()
            .map(|whitelist| whitelist.len().to_string())
            .unwrap_or_else(|| "off".to_string())
    );

    let app = build_gateway_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .context("geoip server exited unexpectedly")?;
    info!("geoip server stopped");
    Ok(())
}
