// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod error;
mod issues;
mod runlog;

pub use error::StoreError;
pub use issues::{Finding, IssueStore, STORE_SCHEMA_VERSION};
pub use runlog::{RunLog, RUN_LOG_FILE};

pub const CRATE_NAME: &str = "bijux-drift-store";
