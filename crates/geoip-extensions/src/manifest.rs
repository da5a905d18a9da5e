//! Manifest returned by an extension's `install()` entry point.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::ExtensionBootstrapError;

/// Route segments owned by the host's fixed routes under `/api`.
pub const RESERVED_EXTENSION_NAMES: &[&str] = &["ip_address", "domain", "dns"];
/// Symbol resolved when a manifest declares lookup capability.
pub const LOOKUP_HANDLER_SYMBOL: &str = "lookupIP";
const MANIFEST_VERSION_DEFAULT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EndpointMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl EndpointMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!(
                "unsupported endpoint method '{other}': expected one of GET, POST, PUT, DELETE"
            )),
        }
    }
}

impl fmt::Display for EndpointMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDeclaration {
    /// Path suffix below `/api/<name>/`, in router syntax (`{param}`).
    pub path: String,
    pub method: EndpointMethod,
    pub handler: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobDeclaration {
    /// Normalised seconds-first expression accepted by the `cron` crate.
    pub cron: String,
    pub handler: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionManifest {
    pub name: String,
    pub version: u32,
    pub has_lookup: bool,
    pub endpoints: Vec<EndpointDeclaration>,
    pub jobs: Vec<JobDeclaration>,
}

impl ExtensionManifest {
    /// Full host route for one endpoint: `/api/<name>/<path>`.
    pub fn route_path(&self, endpoint: &EndpointDeclaration) -> String {
        if endpoint.path.is_empty() {
            format!("/api/{}", self.name)
        } else {
            format!("/api/{}/{}", self.name, endpoint.path)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<u32>,
    #[serde(default)]
    has_lookup: bool,
    #[serde(default)]
    endpoints: Vec<RawEndpoint>,
    #[serde(default)]
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawEndpoint {
    endpoint: String,
    method: String,
    handler: String,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    cron: String,
    job: String,
}

/// Parses and validates the JSON rendering of `install()`'s return value.
pub fn parse_extension_manifest(raw_json: &str) -> Result<ExtensionManifest, ExtensionBootstrapError> {
    let raw = serde_json::from_str::<RawManifest>(raw_json)
        .map_err(|error| ExtensionBootstrapError::ManifestShape(error.to_string()))?;

    let name = raw.name.unwrap_or_default();
    validate_extension_name(&name)?;

    let mut seen_routes = HashSet::new();
    let mut route_shapes = HashMap::<String, String>::new();
    let mut endpoints = Vec::with_capacity(raw.endpoints.len());
    for endpoint in raw.endpoints {
        let method =
            EndpointMethod::parse(&endpoint.method).map_err(ExtensionBootstrapError::InvalidManifest)?;
        let path = normalize_endpoint_path(&endpoint.endpoint)?;
        validate_symbol_name(&endpoint.handler)?;
        if !seen_routes.insert((method, path.clone())) {
            return Err(ExtensionBootstrapError::InvalidManifest(format!(
                "endpoint {method} '/{path}' is declared more than once"
            )));
        }
        let shape = route_shape(&path);
        match route_shapes.get(&shape) {
            Some(existing) if existing != &path => {
                return Err(ExtensionBootstrapError::InvalidManifest(format!(
                    "endpoints '/{existing}' and '/{path}' differ only in parameter names"
                )));
            }
            Some(_) => {}
            None => {
                route_shapes.insert(shape, path.clone());
            }
        }
        endpoints.push(EndpointDeclaration {
            path,
            method,
            handler: endpoint.handler,
        });
    }

    let mut jobs = Vec::with_capacity(raw.jobs.len());
    for job in raw.jobs {
        validate_symbol_name(&job.job)?;
        let cron = normalize_cron_expression(&job.cron).map_err(|message| {
            ExtensionBootstrapError::InvalidCron {
                cron: job.cron.clone(),
                job: job.job.clone(),
                message,
            }
        })?;
        jobs.push(JobDeclaration {
            cron,
            handler: job.job,
        });
    }

    Ok(ExtensionManifest {
        name,
        version: raw.version.unwrap_or(MANIFEST_VERSION_DEFAULT),
        has_lookup: raw.has_lookup,
        endpoints,
        jobs,
    })
}

fn validate_extension_name(name: &str) -> Result<(), ExtensionBootstrapError> {
    if name.is_empty() {
        return Err(ExtensionBootstrapError::InvalidManifest(
            "extension doesn't have a name".to_string(),
        ));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ExtensionBootstrapError::InvalidManifest(format!(
            "extension name '{name}' must not contain whitespace"
        )));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        || name == "."
        || name == ".."
    {
        return Err(ExtensionBootstrapError::InvalidManifest(format!(
            "extension name '{name}' may only contain ASCII letters, digits, '-', '_', and '.'"
        )));
    }
    if RESERVED_EXTENSION_NAMES.contains(&name) {
        return Err(ExtensionBootstrapError::InvalidManifest(format!(
            "extension name '{name}' is reserved by the host"
        )));
    }
    Ok(())
}

fn validate_symbol_name(symbol: &str) -> Result<(), ExtensionBootstrapError> {
    let mut chars = symbol.chars();
    let valid_start = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_' || ch == '$');
    if !valid_start || !chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$') {
        return Err(ExtensionBootstrapError::InvalidManifest(format!(
            "handler '{symbol}' is not a valid function name"
        )));
    }
    Ok(())
}

/// Trims slashes and rewrites gin-style `:param` / `*rest` segments to the
/// router's `{param}` / `{*rest}` syntax.
pub fn normalize_endpoint_path(raw: &str) -> Result<String, ExtensionBootstrapError> {
    let trimmed = raw.trim().trim_matches('/');
    let invalid = |reason: &str| {
        ExtensionBootstrapError::InvalidManifest(format!("endpoint '{raw}' {reason}"))
    };
    let raw_segments = trimmed
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    let mut segments = Vec::with_capacity(raw_segments.len());
    for (index, segment) in raw_segments.iter().enumerate() {
        if *segment == "." || *segment == ".." {
            return Err(invalid("must not contain '.' or '..' segments"));
        }
        if segment.contains(['{', '}']) {
            return Err(invalid("must not contain '{' or '}'"));
        }
        let rewritten = if let Some(param) = segment.strip_prefix(':') {
            validate_parameter_name(param).map_err(&invalid)?;
            format!("{{{param}}}")
        } else if let Some(rest) = segment.strip_prefix('*') {
            validate_parameter_name(rest).map_err(&invalid)?;
            if index + 1 != raw_segments.len() {
                return Err(invalid("may only use a '*' wildcard as its last segment"));
            }
            format!("{{*{rest}}}")
        } else {
            segment.to_string()
        };
        segments.push(rewritten);
    }
    Ok(segments.join("/"))
}

fn validate_parameter_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("has an unnamed parameter segment");
    }
    if name.contains([':', '*']) {
        return Err("has a parameter name containing ':' or '*'");
    }
    Ok(())
}

/// Path with parameter names erased; two routes with the same shape but
/// different names cannot share a router.
fn route_shape(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.starts_with("{*") {
                "{*}"
            } else if segment.starts_with('{') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Accepts 5-field (minute resolution) or 6/7-field (seconds first)
/// expressions and returns the seconds-first form.
pub fn normalize_cron_expression(raw: &str) -> Result<String, String> {
    let fields = raw.split_whitespace().collect::<Vec<_>>();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 | 7 => fields.join(" "),
        count => {
            return Err(format!(
                "expected 5, 6, or 7 fields but found {count}"
            ))
        }
    };
    Schedule::from_str(&normalized).map_err(|error| error.to_string())?;
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::{
        normalize_cron_expression, normalize_endpoint_path, parse_extension_manifest,
        EndpointMethod,
    };
    use crate::error::ExtensionBootstrapError;

    #[test]
    fn unit_parse_extension_manifest_applies_defaults() {
        let manifest = parse_extension_manifest(r#"{"name":"myext"}"#).expect("valid manifest");
        assert_eq!(manifest.name, "myext");
        assert_eq!(manifest.version, 1);
        assert!(!manifest.has_lookup);
        assert!(manifest.endpoints.is_empty());
        assert!(manifest.jobs.is_empty());
    }

    #[test]
    fn unit_parse_extension_manifest_normalizes_endpoints_and_jobs() {
        let manifest = parse_extension_manifest(
            r#"{
  "name": "blocklist",
  "hasLookup": true,
  "endpoints": [
    {"endpoint": "/lists/:id/", "method": "get", "handler": "getList"},
    {"endpoint": "", "method": "POST", "handler": "refresh"}
  ],
  "jobs": [{"cron": "*/5 * * * *", "job": "sync"}]
}"#,
        )
        .expect("valid manifest");

        assert!(manifest.has_lookup);
        assert_eq!(manifest.endpoints[0].path, "lists/{id}");
        assert_eq!(manifest.endpoints[0].method, EndpointMethod::Get);
        assert_eq!(
            manifest.route_path(&manifest.endpoints[0]),
            "/api/blocklist/lists/{id}"
        );
        assert_eq!(manifest.route_path(&manifest.endpoints[1]), "/api/blocklist");
        assert_eq!(manifest.jobs[0].cron, "0 */5 * * * *");
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_name_with_space() {
        let error = parse_extension_manifest(r#"{"name":"my ext"}"#).expect_err("space in name");
        assert!(matches!(error, ExtensionBootstrapError::InvalidManifest(_)));
        assert!(error.to_string().contains("whitespace"));
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_missing_or_reserved_name() {
        let missing = parse_extension_manifest(r#"{"endpoints":[]}"#).expect_err("no name");
        assert!(missing.to_string().contains("doesn't have a name"));

        let reserved = parse_extension_manifest(r#"{"name":"ip_address"}"#).expect_err("reserved");
        assert!(reserved.to_string().contains("reserved"));
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_unknown_method_and_duplicates() {
        let method = parse_extension_manifest(
            r#"{"name":"x","endpoints":[{"endpoint":"a","method":"PATCH","handler":"h"}]}"#,
        )
        .expect_err("patch unsupported");
        assert!(method.to_string().contains("unsupported endpoint method 'PATCH'"));

        let duplicate = parse_extension_manifest(
            r#"{"name":"x","endpoints":[
                {"endpoint":"a","method":"GET","handler":"h"},
                {"endpoint":"/a/","method":"get","handler":"g"}]}"#,
        )
        .expect_err("duplicate route");
        assert!(duplicate.to_string().contains("declared more than once"));
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_conflicting_parameter_names() {
        let error = parse_extension_manifest(
            r#"{"name":"x","endpoints":[
                {"endpoint":"items/:id","method":"GET","handler":"h"},
                {"endpoint":"items/:key","method":"DELETE","handler":"g"}]}"#,
        )
        .expect_err("conflicting params");
        assert!(error.to_string().contains("differ only in parameter names"));
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_bad_cron_and_handler_names() {
        let cron = parse_extension_manifest(
            r#"{"name":"x","jobs":[{"cron":"every minute","job":"tick"}]}"#,
        )
        .expect_err("bad cron");
        assert!(matches!(cron, ExtensionBootstrapError::InvalidCron { .. }));

        let handler = parse_extension_manifest(
            r#"{"name":"x","endpoints":[{"endpoint":"a","method":"GET","handler":"h(); evil"}]}"#,
        )
        .expect_err("bad handler");
        assert!(handler.to_string().contains("not a valid function name"));
    }

    #[test]
    fn regression_parse_extension_manifest_rejects_non_object_result() {
        let error = parse_extension_manifest("42").expect_err("number is not a manifest");
        assert!(matches!(error, ExtensionBootstrapError::ManifestShape(_)));
    }

    #[test]
    fn unit_normalize_endpoint_path_handles_wildcards_and_traversal() {
        assert_eq!(
            normalize_endpoint_path("files/*rest").expect("wildcard"),
            "files/{*rest}"
        );
        assert!(normalize_endpoint_path("a/../b").is_err());
        assert!(normalize_endpoint_path("a/:").is_err());
    }

    #[test]
    fn regression_normalize_endpoint_path_rejects_shapes_the_router_cannot_mount() {
        for raw in ["*rest/tail", "files/{", "a}b", "{id}", "*", "items/:", "a/::id"] {
            let error = normalize_endpoint_path(raw).expect_err(raw);
            assert!(
                matches!(error, ExtensionBootstrapError::InvalidManifest(_)),
                "{raw}: {error}"
            );
        }
        assert_eq!(
            normalize_endpoint_path("lists/:id/*rest").expect("trailing wildcard"),
            "lists/{id}/{*rest}"
        );
    }

    #[test]
    fn unit_normalize_cron_expression_keeps_seconds_form() {
        assert_eq!(
            normalize_cron_expression("30 0 * * * *").expect("six fields"),
            "30 0 * * * *"
        );
        assert!(normalize_cron_expression("* *").is_err());
    }
}
