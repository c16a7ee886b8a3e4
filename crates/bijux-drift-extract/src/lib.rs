// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

pub mod client;
mod error;
mod scan;
pub mod server;
pub mod spec;

use std::path::PathBuf;

use bijux_drift_model::{ArtifactKind, ContractModel};

pub use client::extract_client_sources;
pub use error::ExtractError;
pub use scan::{walk_sources, SourceFile};
pub use server::{
    extract_server_sources, HandlerEntry, RouteEntry, RouterSite, ServerExtraction, ServerIndex,
    StructEntry, StructField,
};
pub use spec::extract_spec_text;

pub const CRATE_NAME: &str = "bijux-drift-extract";

/// One artifact source turned into a contract fragment.
pub trait ArtifactExtractor: Send + Sync {
    fn artifact(&self) -> ArtifactKind;
    fn extract(&self) -> Result<ContractModel, ExtractError>;
}

#[derive(Debug, Clone)]
pub struct SpecExtractor {
    pub path: PathBuf,
}

impl ArtifactExtractor for SpecExtractor {
    fn artifact(&self) -> ArtifactKind {
        ArtifactKind::Spec
    }

    fn extract(&self) -> Result<ContractModel, ExtractError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|err| ExtractError::io(&self.path, &err))?;
        extract_spec_text(&text)
    }
}

#[derive(Debug, Clone)]
pub struct ClientExtractor {
    pub root: PathBuf,
}

pub const CLIENT_EXTENSIONS: [&str; 5] = ["ts", "tsx", "js", "jsx", "mjs"];

impl ArtifactExtractor for ClientExtractor {
    fn artifact(&self) -> ArtifactKind {
        ArtifactKind::Client
    }

    fn extract(&self) -> Result<ContractModel, ExtractError> {
        let files = walk_sources(&self.root, &CLIENT_EXTENSIONS, &["node_modules", "dist", "build"])?;
        extract_client_sources(&files)
    }
}

#[derive(Debug, Clone)]
pub struct ServerExtractor {
    pub root: PathBuf,
}

impl ServerExtractor {
    pub fn extract_with_index(&self) -> Result<ServerExtraction, ExtractError> {
        let files = walk_sources(&self.root, &["rs"], &["target"])?;
        extract_server_sources(&files)
    }
}

impl ArtifactExtractor for ServerExtractor {
    fn artifact(&self) -> ArtifactKind {
        ArtifactKind::Server
    }

    fn extract(&self) -> Result<ContractModel, ExtractError> {
        Ok(self.extract_with_index()?.model)
    }
}
