use std::path::PathBuf;

fn env_path(name: &str) -> Option<PathBuf> {
    let raw = std::env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

/// Explicit flag, then `DRIFT_CONFIG`, then the workspace-local default.
#[must_use]
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env_path(crate::ENV_DRIFT_CONFIG))
        .unwrap_or_else(|| PathBuf::from(".bijux").join("drift.toml"))
}

#[must_use]
pub fn resolve_store_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env_path(crate::ENV_DRIFT_STORE))
        .unwrap_or_else(|| PathBuf::from(".bijux").join("drift-issues.sqlite"))
}

#[must_use]
pub fn resolve_artifacts_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| env_path(crate::ENV_DRIFT_ARTIFACTS_DIR))
        .unwrap_or_else(|| PathBuf::from("artifacts").join("drift"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_path_wins_over_defaults() {
        let path = resolve_store_path(Some(PathBuf::from("/tmp/x.sqlite")));
        assert_eq!(path, PathBuf::from("/tmp/x.sqlite"));
    }
}
