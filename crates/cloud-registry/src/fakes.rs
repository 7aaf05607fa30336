//! In-memory fake of the cloud API (testing only)
//!
//! `MemoryCloud` satisfies the `CloudApi` contract without any network,
//! records every call it receives, and can be told to fail specific
//! operations so callers' failure paths can be exercised.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::api::CloudApi;
use crate::error::{CloudError, CloudResult};
use crate::model::{
    CreateServer, ImageArtifact, ImageId, ImageQuery, Instance, InstanceStatus, Label, ServerId,
};

/// One call received by the fake, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    ListImages,
    DeleteImage(ImageId),
    CreateServer(String),
    DeleteServer(ServerId),
}

/// How a `create_server` call should misbehave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFault {
    /// The API rejects the request; no server exists.
    Reject,
    /// The server is created but has no public address yet.
    NoAddress,
}

#[derive(Debug, Default)]
struct Faults {
    image_deletes: HashSet<ImageId>,
    create_server: Option<CreateFault>,
    server_delete: bool,
    listing: bool,
}

/// In-memory image registry and compute API.
#[derive(Debug)]
pub struct MemoryCloud {
    images: Mutex<BTreeMap<ImageId, ImageArtifact>>,
    servers: Mutex<BTreeMap<ServerId, Instance>>,
    calls: Mutex<Vec<CloudCall>>,
    faults: Mutex<Faults>,
    next_id: AtomicU64,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self {
            images: Mutex::default(),
            servers: Mutex::default(),
            calls: Mutex::default(),
            faults: Mutex::default(),
            next_id: AtomicU64::new(1000),
        }
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the registry with images.
    pub fn with_images(images: impl IntoIterator<Item = ImageArtifact>) -> Self {
        let cloud = Self::new();
        for image in images {
            cloud.insert_image(image);
        }
        cloud
    }

    pub fn insert_image(&self, image: ImageArtifact) {
        self.images.lock().unwrap().insert(image.id, image);
    }

    /// Register a fresh snapshot, as a successful build would.
    pub fn register_snapshot(
        &self,
        description: &str,
        created: DateTime<Utc>,
        labels: &[Label],
    ) -> ImageId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.insert_image(ImageArtifact {
            id,
            description: description.to_string(),
            image_size: Some(1.0),
            created,
            labels: labels
                .iter()
                .map(|l| (l.key.clone(), l.value.clone()))
                .collect(),
        });
        id
    }

    /// Current images, ascending by id.
    pub fn images(&self) -> Vec<ImageArtifact> {
        self.images.lock().unwrap().values().cloned().collect()
    }

    /// Servers that currently exist.
    pub fn servers(&self) -> Vec<Instance> {
        self.servers.lock().unwrap().values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Ids passed to `delete_server`, including failed attempts.
    pub fn server_delete_calls(&self) -> Vec<ServerId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CloudCall::DeleteServer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `delete_image`, including failed attempts.
    pub fn image_delete_calls(&self) -> Vec<ImageId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                CloudCall::DeleteImage(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn fail_image_delete(&self, id: ImageId) {
        self.faults.lock().unwrap().image_deletes.insert(id);
    }

    pub fn fail_server_create(&self, fault: CreateFault) {
        self.faults.lock().unwrap().create_server = Some(fault);
    }

    pub fn fail_server_delete(&self) {
        self.faults.lock().unwrap().server_delete = true;
    }

    pub fn fail_listing(&self) {
        self.faults.lock().unwrap().listing = true;
    }

    fn record(&self, call: CloudCall) {
        self.calls.lock().unwrap().push(call);
    }
}

fn injected(status: u16, code: &str) -> CloudError {
    CloudError::Api {
        status,
        code: code.to_string(),
        message: "injected failure".to_string(),
    }
}

fn not_found(what: &str, id: u64) -> CloudError {
    CloudError::Api {
        status: 404,
        code: "not_found".to_string(),
        message: format!("{what} {id} not found"),
    }
}

#[async_trait]
impl CloudApi for MemoryCloud {
    async fn list_images(&self, query: &ImageQuery) -> CloudResult<Vec<ImageArtifact>> {
        self.record(CloudCall::ListImages);
        if self.faults.lock().unwrap().listing {
            return Err(injected(503, "unavailable"));
        }

        let images = self.images.lock().unwrap();
        let mut matching: Vec<ImageArtifact> = images
            .values()
            .filter(|img| query.label.as_ref().map(|l| img.has_label(l)).unwrap_or(true))
            .cloned()
            .collect();

        if query.newest_first {
            matching.sort_by(|a, b| b.created.cmp(&a.created).then_with(|| b.id.cmp(&a.id)));
        }
        Ok(matching)
    }

    async fn delete_image(&self, id: ImageId) -> CloudResult<()> {
        self.record(CloudCall::DeleteImage(id));
        if self.faults.lock().unwrap().image_deletes.contains(&id) {
            return Err(injected(500, "server_error"));
        }
        self.images
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("image", id))
    }

    async fn create_server(&self, request: &CreateServer) -> CloudResult<Instance> {
        self.record(CloudCall::CreateServer(request.name.clone()));
        let fault = self.faults.lock().unwrap().create_server;
        if fault == Some(CreateFault::Reject) {
            return Err(injected(422, "invalid_input"));
        }

        let image_id: Option<ImageId> = request.image.parse().ok();
        let image_exists = image_id
            .map(|id| self.images.lock().unwrap().contains_key(&id))
            .unwrap_or(false);
        if !image_exists {
            return Err(CloudError::Api {
                status: 404,
                code: "not_found".to_string(),
                message: format!("image {} not found", request.image),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let public_ipv4 = match fault {
            Some(CreateFault::NoAddress) => None,
            _ => Some(format!("192.0.2.{}", id % 250 + 1)),
        };
        let instance = Instance {
            id,
            name: request.name.clone(),
            status: InstanceStatus::Initializing,
            public_ipv4,
        };
        self.servers.lock().unwrap().insert(id, instance.clone());
        Ok(instance)
    }

    async fn delete_server(&self, id: ServerId) -> CloudResult<()> {
        self.record(CloudCall::DeleteServer(id));
        if self.faults.lock().unwrap().server_delete {
            return Err(injected(500, "server_error"));
        }
        self.servers
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found("server", id))
    }
}
