// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

mod classifier;
mod comparator;
pub mod duplicates;
pub mod evidence;
pub mod planner;
pub mod ports;

pub use classifier::classify;
pub use comparator::{compare, Comparison};
pub use duplicates::{similarity, DuplicateGraph, LinkOutcome, DUPLICATE_THRESHOLD};
pub use evidence::{
    CodeInspector, EvidenceCollector, HandlerProbe, RouteProbe, SourceTreeInspector,
};
pub use planner::{is_eligible, RemediationPlanner};
pub use ports::{AdapterError, Fs, FsWrite, ProcessRunner, RealFs, RealProcessRunner};

pub const CRATE_NAME: &str = "bijux-drift-analysis";
