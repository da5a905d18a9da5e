//! Mounts manifest endpoints as axum routes under `/api/<name>/`.
//!
//! Each route handler snapshots the request, hands it to the extension's
//! worker, and awaits the one-shot reply that the script's response facade
//! completes. Failures become JSON error responses, never panics.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, MethodRouter};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::instance::ExtensionInstance;
use crate::manifest::EndpointMethod;

/// Largest request body forwarded into a script.
pub const EXTENSION_REQUEST_BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Request snapshot handed to the script's request facade.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionRequest {
    pub method: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub client_ip: String,
    pub body: String,
}

/// Response finalized by the script's response facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl IntoResponse for ExtensionResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, Body::from(self.body)).into_response();
        if let Ok(content_type) = HeaderValue::from_str(&self.content_type) {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
    }
}

fn method_filter(method: EndpointMethod) -> MethodFilter {
    match method {
        EndpointMethod::Get => MethodFilter::GET,
        EndpointMethod::Post => MethodFilter::POST,
        EndpointMethod::Put => MethodFilter::PUT,
        EndpointMethod::Delete => MethodFilter::DELETE,
    }
}

/// Router holding every endpoint of every instance. Endpoints sharing a
/// path are merged into one method router.
pub fn build_extension_router(instances: &[Arc<ExtensionInstance>]) -> Router {
    let mut routes: BTreeMap<String, MethodRouter> = BTreeMap::new();
    for instance in instances {
        let manifest = instance.manifest();
        for (index, endpoint) in manifest.endpoints.iter().enumerate() {
            let route = manifest.route_path(endpoint);
            let handler_instance = Arc::clone(instance);
            let handler = move |request: Request| {
                let instance = Arc::clone(&handler_instance);
                async move { serve_endpoint(instance, index, request).await }
            };
            debug!(
                extension = %instance.name(),
                method = %endpoint.method,
                route = %route,
                handler = %endpoint.handler,
                "registering extension endpoint"
            );
            let method_router = routes.remove(&route).unwrap_or_else(MethodRouter::new);
            routes.insert(route, method_router.on(method_filter(endpoint.method), handler));
        }
    }
    routes
        .into_iter()
        .fold(Router::new(), |router, (route, method_router)| {
            router.route(&route, method_router)
        })
}

/// Source address: first `X-Forwarded-For` hop, then `X-Real-IP`, then
/// the socket peer.
pub fn resolve_client_ip(parts: &Parts) -> String {
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    if let Some(forwarded) = header("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return first.to_string();
        }
    }
    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.ip().to_string())
        .unwrap_or_default()
}

async fn snapshot_request(request: Request) -> Result<ExtensionRequest, Response> {
    let (mut parts, body) = request.into_parts();
    let params = Path::<HashMap<String, String>>::from_request_parts(&mut parts, &())
        .await
        .map(|Path(params)| params.into_iter().collect())
        .unwrap_or_default();
    let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
        .map(|Query(query)| query.into_iter().collect())
        .unwrap_or_default();

    let mut headers = BTreeMap::<String, String>::new();
    for (name, value) in &parts.headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        headers
            .entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    let body = to_bytes(body, EXTENSION_REQUEST_BODY_LIMIT_BYTES)
        .await
        .map_err(|error| {
            (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "success": false, "status": error.to_string() })),
            )
                .into_response()
        })?;

    Ok(ExtensionRequest {
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        client_ip: resolve_client_ip(&parts),
        params,
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn serve_endpoint(
    instance: Arc<ExtensionInstance>,
    index: usize,
    request: Request,
) -> Response {
    let snapshot = match snapshot_request(request).await {
        Ok(snapshot) => snapshot,
        Err(response) => return response,
    };
    let route = snapshot.path.clone();
    match instance.call_endpoint(index, snapshot).await {
        Ok(response) => response.into_response(),
        Err(error) => {
            warn!(
                extension = %instance.name(),
                route = %route,
                error = %error,
                "extension endpoint failed"
            );
            error.into_response()
        }
    }
}
