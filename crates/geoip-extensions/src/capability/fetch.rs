//! Outbound HTTP for scripts, backed by one pooled `reqwest::Client`.

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;

use reqwest::Method;
use rquickjs::{Ctx, Function, Object};
use serde::Deserialize;
use serde_json::{json, Value};

use super::CapabilityScope;
use crate::bridge::OpOutcome;

pub const FETCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const SUPPORTED_FETCH_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];

/// Client shared by every extension's `fetch`.
pub fn build_fetch_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(FETCH_REQUEST_TIMEOUT)
        .user_agent(concat!("geoip-service/", env!("CARGO_PKG_VERSION")))
        .build()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchOptions {
    method: Option<String>,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
}

fn resolve_method(raw: Option<&str>) -> Result<Method, String> {
    let method = raw.unwrap_or("GET").trim().to_ascii_uppercase();
    if !SUPPORTED_FETCH_METHODS.contains(&method.as_str()) {
        return Err(format!("fetch: unsupported method '{method}'"));
    }
    Method::from_bytes(method.as_bytes()).map_err(|error| format!("fetch: {error}"))
}

async fn perform_fetch(
    client: reqwest::Client,
    url: String,
    method: Method,
    options: FetchOptions,
) -> OpOutcome {
    let mut request = client.request(method, &url);
    let has_content_type = options
        .headers
        .keys()
        .any(|name| name.eq_ignore_ascii_case("content-type"));
    for (name, value) in &options.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    match options.body {
        None | Some(Value::Null) => {}
        Some(Value::String(text)) => request = request.body(text),
        Some(other) => {
            let encoded = serde_json::to_vec(&other)
                .map_err(|error| format!("fetch: failed to encode body: {error}"))?;
            if !has_content_type {
                request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
            }
            request = request.body(encoded);
        }
    }

    let response = request
        .send()
        .await
        .map_err(|error| format!("fetch {url} failed: {error}"))?;
    let status = response.status();
    let final_url = response.url().to_string();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect::<BTreeMap<_, _>>();
    let body = response
        .text()
        .await
        .map_err(|error| format!("fetch {url}: failed to read body: {error}"))?;

    Ok(Some(json!({
        "status": status.as_u16(),
        "ok": status.is_success(),
        "url": final_url,
        "headers": headers,
        "body": body,
    })))
}

pub(crate) fn install<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    scope: &Rc<CapabilityScope>,
) -> rquickjs::Result<()> {
    let scope = Rc::clone(scope);
    host.set(
        "fetch",
        Function::new(ctx.clone(), move |url: String, options: Option<String>| {
            let bridge = &scope.bridge;
            let options = match options.as_deref() {
                Some(raw) => match serde_json::from_str::<FetchOptions>(raw) {
                    Ok(options) => options,
                    Err(error) => {
                        return bridge.reject(format!("fetch: invalid options: {error}")) as f64
                    }
                },
                None => FetchOptions::default(),
            };
            let method = match resolve_method(options.method.as_deref()) {
                Ok(method) => method,
                Err(message) => return bridge.reject(message) as f64,
            };
            bridge.spawn(perform_fetch(scope.http.clone(), url, method, options)) as f64
        })?,
    )
}

#[cfg(test)]
mod tests {
    use super::resolve_method;

    #[test]
    fn unit_resolve_method_defaults_to_get_and_is_case_insensitive() {
        assert_eq!(resolve_method(None).expect("default"), reqwest::Method::GET);
        assert_eq!(
            resolve_method(Some("patch")).expect("patch"),
            reqwest::Method::PATCH
        );
    }

    #[test]
    fn regression_resolve_method_rejects_unsupported_methods() {
        let error = resolve_method(Some("TRACE")).expect_err("trace unsupported");
        assert!(error.contains("unsupported method 'TRACE'"));
    }
}
