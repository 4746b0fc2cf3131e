//! Volume-mount resolver.
//!
//! Resolves a sandbox create/resume request's named volume-mount list into
//! concrete `(volume_id, path)` pairs, gated behind the `volume_mounts`
//! feature flag. Every request in the batch is checked before
//! any lookup happens, and every failure is reported against its index
//! rather than stopping at the first one -- a caller sending five mounts
//! wants to fix all the bad ones in one round trip, not one per request.

use crate::config::PlatformConfig;
use crate::error::{ApiError, ApiResult};
use crate::model::{ResolvedMount, Team, VolumeMountRequest};
use crate::store::Store;

fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path must not be empty".to_string());
    }
    if !path.starts_with('/') {
        return Err("path must be absolute".to_string());
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err("path must not have a trailing slash".to_string());
    }
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.iter().any(|s| *s == "." || *s == "..") {
        return Err("path must not contain '.' or '..' segments".to_string());
    }
    if path.contains("//") {
        return Err("path must not contain empty segments".to_string());
    }
    Ok(())
}

/// `ResolveVolumeMounts(ctx, team, requests)`. Returns one resolved mount
/// per request, in request order, or an aggregated error naming every bad
/// request by its position in the batch.
pub async fn resolve_mounts(
    store: &dyn Store,
    config: &PlatformConfig,
    team: &Team,
    requests: &[VolumeMountRequest],
) -> ApiResult<Vec<ResolvedMount>> {
    if requests.is_empty() {
        return Ok(Vec::new());
    }
    if !config.feature_flags.volume_mounts {
        return Err(ApiError::precondition_failed("volume mounts are not enabled for this deployment"));
    }

    let mut errors: Vec<String> = Vec::new();
    for (i, req) in requests.iter().enumerate() {
        if let Err(msg) = validate_path(&req.path) {
            errors.push(format!("request[{i}]: {msg}"));
        }
        if req.name.is_empty() {
            errors.push(format!("request[{i}]: volume name must not be empty"));
        }
    }

    let mut seen_paths = std::collections::HashSet::new();
    for (i, req) in requests.iter().enumerate() {
        if !seen_paths.insert(&req.path) {
            errors.push(format!("request[{i}]: duplicate mount path '{}'", req.path));
        }
    }

    if !errors.is_empty() {
        return Err(ApiError::invalid_input(errors.join("; ")));
    }

    let mut resolved = Vec::with_capacity(requests.len());
    for (i, req) in requests.iter().enumerate() {
        match store.get_volume_by_name(team.id, &req.name).await? {
            Some(volume) => resolved.push(ResolvedMount {
                volume_id: volume.id,
                path: req.path.clone(),
            }),
            None => errors.push(format!("request[{i}]: volume '{}' not found", req.name)),
        }
    }

    if !errors.is_empty() {
        return Err(ApiError::not_found(errors.join("; ")));
    }

    Ok(resolved)
}
