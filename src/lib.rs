//! Content-addressed asset conversion and bundle building.
//!
//! Resolves content hashes to an on-disk layout, fetches raw content from
//! a remote store, stages it into importable artifacts with deterministic
//! identities, and packs everything into dependency-annotated bundles.

pub mod address;
pub mod artifacts;
pub mod build;
pub mod cleanup;
pub mod config;
pub mod convert;
pub mod fetch;
pub mod hash;
pub mod identity;
pub mod stage;

pub use self::{
    address::{resolve, CasingTable, ContentMapping, ResolvedLocation},
    artifacts::{ArtifactStore, FsArtifactStore},
    build::{BundleBuilder, DirBundler},
    config::{Config, Platform},
    convert::{Conversion, ExitCode, Report},
    fetch::{HttpStore, RemoteStore},
    hash::ContentHash,
    identity::ArtifactId,
    stage::AssetKind,
};

pub fn install_tracing_subscriber() {
    use tracing_subscriber::layer::SubscriberExt as _;
    if let Err(err) = tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    ) {
        panic!("Failed to install tracing subscriber: {}", err);
    }
}
