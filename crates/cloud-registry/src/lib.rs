//! Cloud-Registry: image and server API client for imagectl
//!
//! This crate is the only place that speaks HTTP to the cloud provider.
//! It exposes the `CloudApi` trait, a reqwest-backed implementation, and
//! an in-memory fake for tests.
//!
//! ## Layer 0 - Remote resources
//!
//! Focus: typed decoding. Absent fields surface as `Option` or as
//! `CloudError::MissingField`, never as sentinel strings.

pub mod api;
pub mod client;
mod error;
pub mod fakes;
pub mod model;

pub use api::CloudApi;
pub use client::{HcloudClient, HcloudConfig, DEFAULT_ENDPOINT};
pub use error::{CloudError, CloudResult};
pub use model::{
    CreateServer, ImageArtifact, ImageId, ImageQuery, Instance, InstanceStatus, Label, ServerId,
    AUTO_CLEANUP_KEY, PROVENANCE_KEY,
};
