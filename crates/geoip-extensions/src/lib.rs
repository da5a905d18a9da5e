//! Scripted extension runtime for the geoip service.
//!
//! Discovers extension packages, boots each into its own QuickJS
//! interpreter with the host capability surface, and wires the declared
//! endpoints, cron jobs, and lookup enrichment into the host.

use anyhow::{Context, Result};
use geoip_cli::Cli;

mod bridge;
pub mod capability;
pub mod error;
pub mod fanout;
pub mod host;
pub mod instance;
pub mod loader;
pub mod manifest;
pub mod registrar;
mod sandbox;
pub mod scheduler;

pub use capability::net::{parse_ip_list, IpSet, IpValue};
pub use error::{
    ExtensionBootstrapError, ExtensionCallError, ExtensionHostError, ExtensionLoadError,
};
pub use fanout::collect_additional_data;
pub use host::{
    BootstrapFailurePolicy, ExtensionHost, ExtensionHostOptions, EXTENSION_BOOTSTRAP_TIMEOUT,
};
pub use instance::ExtensionInstance;
pub use loader::{
    discover_extension_packages, render_extension_package_report, ExtensionPackage,
    EXTENSION_ENTRY_FILE_NAME, EXTENSION_STORE_DIR_NAME,
};
pub use manifest::{
    parse_extension_manifest, EndpointDeclaration, EndpointMethod, ExtensionManifest,
    JobDeclaration,
};
pub use registrar::{build_extension_router, ExtensionRequest, ExtensionResponse};
pub use scheduler::{start_extension_scheduler, ExtensionSchedulerHandle};

pub fn execute_extension_list_command(cli: &Cli) -> Result<()> {
    if !cli.extension_list {
        return Ok(());
    }
    let packages = discover_extension_packages(&cli.extensions_dir).with_context(|| {
        format!(
            "failed to list extensions in {}",
            cli.extensions_dir.display()
        )
    })?;
    println!(
        "{}",
        render_extension_package_report(&cli.extensions_dir, &packages)
    );
    Ok(())
}
