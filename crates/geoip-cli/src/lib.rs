//! CLI argument model and validation helpers for the geoip service binary.
//!
//! Exposes the clap-backed `Cli` used by startup dispatch, the gateway server,
//! and the extension listing command.

pub mod cli_args;

pub use cli_args::Cli;

use anyhow::{bail, Result};

/// Validates flag combinations clap cannot express on its own.
pub fn validate_cli(cli: &Cli) -> Result<()> {
    if cli.serve && (cli.ip.is_some() || cli.domain.is_some()) {
        bail!("--serve cannot be combined with --ip or --domain");
    }
    if cli.whitelist.is_some() && !cli.serve {
        bail!("--whitelist is only used together with --serve");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{validate_cli, Cli};

    #[test]
    fn unit_cli_defaults_match_reference_service() {
        let cli = Cli::try_parse_from(["geoip-service"]).expect("parse defaults");
        assert!(!cli.serve);
        assert_eq!(cli.sip, "127.0.0.1");
        assert_eq!(cli.port, 8228);
        assert_eq!(cli.extensions_dir.to_string_lossy(), "extensions");
        assert_eq!(cli.extension_call_timeout_ms, 5_000);
        assert_eq!(cli.extension_memory_limit_mb, 64);
        assert!(!cli.skip_broken_extensions);
    }

    #[test]
    fn regression_cli_rejects_zero_call_timeout() {
        let error = Cli::try_parse_from(["geoip-service", "--extension-call-timeout-ms", "0"])
            .expect_err("zero timeout should fail");
        assert!(error.to_string().contains("greater than 0"));
    }

    #[test]
    fn regression_validate_cli_rejects_serve_with_one_shot_lookup() {
        let cli = Cli::try_parse_from(["geoip-service", "--serve", "--ip", "1.1.1.1"])
            .expect("parse flags");
        let error = validate_cli(&cli).expect_err("serve plus ip should fail");
        assert!(error.to_string().contains("--serve cannot be combined"));
    }

    #[test]
    fn unit_validate_cli_accepts_whitelist_with_serve() {
        let cli = Cli::try_parse_from(["geoip-service", "--serve", "--whitelist", "allow.txt"])
            .expect("parse flags");
        validate_cli(&cli).expect("whitelist with serve is valid");
    }
}
