//! Native half of the capability surface.
//!
//! Every binding is attached to a private `host` object that only the
//! prelude can see; the prelude turns those primitives into the globals
//! scripts use (`console`, `fetch`, `IP`, `IPList`, `IPSet`, `storage`,
//! `DB`).

use std::path::PathBuf;
use std::rc::Rc;

use rquickjs::{Ctx, Object};

use crate::bridge::AsyncBridge;

pub(crate) mod console;
pub(crate) mod fetch;
pub mod net;
pub(crate) mod sql;
pub(crate) mod storage;

/// Everything one interpreter's capabilities may touch. Never shared with
/// another extension, except the pooled HTTP client.
pub(crate) struct CapabilityScope {
    pub extension: String,
    pub store_dir: PathBuf,
    pub http: reqwest::Client,
    pub database: sql::DatabaseHandle,
    pub bridge: Rc<AsyncBridge>,
}

impl CapabilityScope {
    pub(crate) fn new(
        extension: impl Into<String>,
        store_dir: PathBuf,
        http: reqwest::Client,
        bridge: Rc<AsyncBridge>,
    ) -> Self {
        let database = sql::DatabaseHandle::new(store_dir.join(sql::DATABASE_FILE_NAME));
        Self {
            extension: extension.into(),
            store_dir,
            http,
            database,
            bridge,
        }
    }
}

pub(crate) fn install_capabilities<'js>(
    ctx: &Ctx<'js>,
    host: &Object<'js>,
    scope: &Rc<CapabilityScope>,
) -> rquickjs::Result<()> {
    console::install(ctx, host, &scope.extension)?;
    fetch::install(ctx, host, scope)?;
    net::install(ctx, host)?;
    storage::install(ctx, host, scope)?;
    sql::install(ctx, host, scope)?;
    Ok(())
}
