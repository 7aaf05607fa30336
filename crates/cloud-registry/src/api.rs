//! The cloud API seam.
//!
//! `CloudApi` covers exactly the operations the image lifecycle needs:
//! list/delete images and create/delete servers. `HcloudClient` talks to
//! the real endpoint; `fakes::MemoryCloud` satisfies the same contract
//! in memory for tests.

use async_trait::async_trait;

use crate::error::CloudResult;
use crate::model::{CreateServer, ImageArtifact, ImageId, ImageQuery, Instance, ServerId};

/// Image registry and compute operations.
///
/// Guarantees:
/// - `list_images` returns every matching image across all pages, ordered
///   as requested by the query.
/// - `create_server` only returns `Ok` when the response carried a server id.
/// - Deletes are single-shot; nothing is retried.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// List images matching the query.
    async fn list_images(&self, query: &ImageQuery) -> CloudResult<Vec<ImageArtifact>>;

    /// Delete one image.
    async fn delete_image(&self, id: ImageId) -> CloudResult<()>;

    /// Create (and start) a server.
    async fn create_server(&self, request: &CreateServer) -> CloudResult<Instance>;

    /// Delete one server.
    async fn delete_server(&self, id: ServerId) -> CloudResult<()>;
}
