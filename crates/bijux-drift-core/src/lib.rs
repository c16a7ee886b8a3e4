// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod canonical;
mod errors;
mod paths;

pub use canonical::{canonical_json, sha256_hex, short_content_id, ID_HEX_LEN};
pub use errors::{ExitCode, MachineError};
pub use paths::{resolve_artifacts_dir, resolve_config_path, resolve_store_path};

pub const CRATE_NAME: &str = "bijux-drift-core";

pub const ENV_DRIFT_CONFIG: &str = "DRIFT_CONFIG";
pub const ENV_DRIFT_STORE: &str = "DRIFT_STORE";
pub const ENV_DRIFT_ARTIFACTS_DIR: &str = "DRIFT_ARTIFACTS_DIR";
pub const ENV_DRIFT_LOG_JSON: &str = "DRIFT_LOG_JSON";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_content_id_is_prefixed_and_truncated() {
        let id = short_content_id("mm", &json!({"b": 1, "a": 2})).expect("id");
        assert!(id.starts_with("mm_"));
        assert_eq!(id.len(), 3 + 16);
    }

    #[test]
    fn short_content_id_ignores_key_order() {
        let a = short_content_id("fix", &json!({"x": 1, "y": [1, 2]})).expect("a");
        let b = short_content_id("fix", &json!({"y": [1, 2], "x": 1})).expect("b");
        assert_eq!(a, b);
    }
}
