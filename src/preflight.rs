//! Safety rails that run before any network call or database write.
//!
//! Development and test environments must run with DRY_RUN=true and must not
//! point at a production upstream host. Both checks happen before the first
//! side effect of an operation, never after.

use crate::error::EtlError;
use crate::settings::Settings;

/// Upstream hosts that only production is allowed to touch.
const PRODUCTION_HOSTS: &[&str] = &["tektonresearch.clinicalconductor.com"];

pub fn check_environment(settings: &Settings) -> Result<(), EtlError> {
    if (settings.is_development() || settings.is_test()) && !settings.dry_run {
        return Err(EtlError::PreflightBlocked(format!(
            "DRY_RUN must be true in the {} environment; set DRY_RUN=true or ENVIRONMENT=production",
            settings.environment
        )));
    }
    Ok(())
}

pub fn check_api_host(settings: &Settings) -> Result<(), EtlError> {
    if settings.is_production() {
        return Ok(());
    }

    let url = settings.api_base_url.to_lowercase();
    for host in PRODUCTION_HOSTS {
        if url.contains(host) {
            return Err(EtlError::PreflightBlocked(format!(
                "cannot call production API ({host}) in the {} environment",
                settings.environment
            )));
        }
    }
    Ok(())
}

fn check_database_write(settings: &Settings, dry_run_override: Option<bool>) -> Result<(), EtlError> {
    let dry_run = dry_run_override.unwrap_or(settings.dry_run);
    if dry_run {
        return Err(EtlError::PreflightBlocked(
            "database writes are disabled in DRY_RUN mode".to_string(),
        ));
    }
    Ok(())
}

fn check_network_request(settings: &Settings, dry_run_override: Option<bool>) -> Result<(), EtlError> {
    let dry_run = dry_run_override.unwrap_or(settings.dry_run);
    if dry_run {
        return Err(EtlError::PreflightBlocked(
            "network requests are disabled in DRY_RUN mode".to_string(),
        ));
    }
    Ok(())
}

/// Run every applicable check for an operation about to perform side effects.
pub fn preflight(
    settings: &Settings,
    allow_network: bool,
    allow_db_write: bool,
    dry_run_override: Option<bool>,
) -> Result<(), EtlError> {
    check_environment(settings)?;

    if allow_network {
        check_api_host(settings)?;
        check_network_request(settings, dry_run_override)?;
    }

    if allow_db_write {
        check_database_write(settings, dry_run_override)?;
    }

    Ok(())
}

/// Dry-run status of the process-wide settings snapshot, for startup
/// banners. `None` when writes are live or no snapshot is installed yet.
pub fn dry_run_status() -> Option<String> {
    let settings = crate::settings::global()?;
    settings
        .dry_run
        .then(|| format!("DRY_RUN=true in the {} environment", settings.environment))
}
