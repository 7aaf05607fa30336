//! Resource types exchanged with the cloud API.
//!
//! Wire payloads (`*Payload`) decode every field as optional; conversion
//! into the domain types below is where a missing field becomes an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CloudError, CloudResult};

/// Opaque image identifier.
pub type ImageId = u64;

/// Opaque server identifier.
pub type ServerId = u64;

/// Label key that marks resources created by this tool.
pub const PROVENANCE_KEY: &str = "created_by";

/// Label key that marks throwaway servers for out-of-band reaping.
pub const AUTO_CLEANUP_KEY: &str = "auto-cleanup";

/// A `key=value` resource label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: String,
    pub value: String,
}

impl Label {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The provenance tag `created_by=<value>`.
    pub fn provenance(value: impl Into<String>) -> Self {
        Self::new(PROVENANCE_KEY, value)
    }

    /// Parse a `key=value` selector. Returns `None` if there is no `=`.
    pub fn parse(selector: &str) -> Option<Self> {
        let (key, value) = selector.split_once('=')?;
        Some(Self::new(key.trim(), value.trim()))
    }

    /// Whether `labels` carries this exact key/value pair.
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        labels.get(&self.key).map(|v| v == &self.value).unwrap_or(false)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// A bootable disk image snapshot registered with the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageArtifact {
    pub id: ImageId,
    pub description: String,
    /// Compressed size in GB, when the provider has computed it.
    pub image_size: Option<f64>,
    pub created: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

impl ImageArtifact {
    pub fn has_label(&self, label: &Label) -> bool {
        label.matches(&self.labels)
    }
}

/// Lifecycle state reported for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    #[serde(other)]
    Unknown,
}

/// A server created to exercise an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: ServerId,
    pub name: String,
    pub status: InstanceStatus,
    pub public_ipv4: Option<String>,
}

/// Filter for image listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageQuery {
    /// Image kind, e.g. `snapshot`.
    pub image_type: Option<String>,
    pub label: Option<Label>,
    /// Newest first when set.
    pub newest_first: bool,
}

impl ImageQuery {
    /// Snapshots only, newest first.
    pub fn snapshots() -> Self {
        Self {
            image_type: Some("snapshot".to_string()),
            label: None,
            newest_first: true,
        }
    }

    pub fn with_label(mut self, label: Label) -> Self {
        self.label = Some(label);
        self
    }

    /// Render as API query parameters.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(kind) = &self.image_type {
            params.push(("type", kind.clone()));
        }
        if let Some(label) = &self.label {
            params.push(("label_selector", label.to_string()));
        }
        if self.newest_first {
            params.push(("sort", "created:desc".to_string()));
        }
        params
    }
}

/// Body of a server creation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateServer {
    pub name: String,
    pub server_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Image id rendered as a string; the API accepts ids or names here.
    pub image: String,
    pub labels: BTreeMap<String, String>,
    pub start_after_create: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ssh_keys: Vec<String>,
}

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ImagePayload {
    pub id: Option<ImageId>,
    pub description: Option<String>,
    pub image_size: Option<f64>,
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl ImagePayload {
    pub(crate) fn into_artifact(self) -> CloudResult<ImageArtifact> {
        Ok(ImageArtifact {
            id: self.id.ok_or(CloudError::MissingField("image.id"))?,
            description: self.description.unwrap_or_default(),
            image_size: self.image_size,
            created: self.created.ok_or(CloudError::MissingField("image.created"))?,
            labels: self.labels,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ImageListPayload {
    #[serde(default)]
    pub images: Vec<ImagePayload>,
    pub meta: Option<MetaPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MetaPayload {
    pub pagination: Option<PaginationPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PaginationPayload {
    pub next_page: Option<u32>,
}

impl ImageListPayload {
    pub(crate) fn next_page(&self) -> Option<u32> {
        self.meta
            .as_ref()
            .and_then(|m| m.pagination.as_ref())
            .and_then(|p| p.next_page)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Ipv4Payload {
    pub ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublicNetPayload {
    pub ipv4: Option<Ipv4Payload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerPayload {
    pub id: Option<ServerId>,
    pub name: Option<String>,
    pub status: Option<InstanceStatus>,
    pub public_net: Option<PublicNetPayload>,
}

impl ServerPayload {
    pub(crate) fn into_instance(self) -> CloudResult<Instance> {
        let id = self.id.ok_or(CloudError::MissingField("server.id"))?;
        let public_ipv4 = self.public_net.and_then(|n| n.ipv4).and_then(|v4| v4.ip);
        Ok(Instance {
            id,
            name: self.name.unwrap_or_default(),
            status: self.status.unwrap_or(InstanceStatus::Unknown),
            public_ipv4,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateServerPayload {
    pub server: Option<ServerPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_display_and_parse() {
        let label = Label::provenance("imagectl");
        assert_eq!(label.to_string(), "created_by=imagectl");
        assert_eq!(Label::parse("created_by=imagectl"), Some(label));
        assert_eq!(Label::parse("no-equals-sign"), None);
    }

    #[test]
    fn test_label_matches_exact_value_only() {
        let mut labels = BTreeMap::new();
        labels.insert("created_by".to_string(), "someone-else".to_string());
        assert!(!Label::provenance("imagectl").matches(&labels));

        labels.insert("created_by".to_string(), "imagectl".to_string());
        assert!(Label::provenance("imagectl").matches(&labels));
    }

    #[test]
    fn test_query_params() {
        let query = ImageQuery::snapshots().with_label(Label::provenance("imagectl"));
        let params = query.to_params();
        assert!(params.contains(&("type", "snapshot".to_string())));
        assert!(params.contains(&("label_selector", "created_by=imagectl".to_string())));
        assert!(params.contains(&("sort", "created:desc".to_string())));
    }

    #[test]
    fn test_server_payload_null_address() {
        let payload: ServerPayload = serde_json::from_str(
            r#"{"id": 42, "name": "t", "status": "initializing", "public_net": {"ipv4": null}}"#,
        )
        .unwrap();
        let instance = payload.into_instance().unwrap();
        assert_eq!(instance.id, 42);
        assert_eq!(instance.status, InstanceStatus::Initializing);
        assert!(instance.public_ipv4.is_none());
    }

    #[test]
    fn test_server_payload_missing_id() {
        let payload: ServerPayload = serde_json::from_str(r#"{"id": null, "name": "t"}"#).unwrap();
        assert!(matches!(
            payload.into_instance(),
            Err(CloudError::MissingField("server.id"))
        ));
    }

    #[test]
    fn test_unknown_status_decodes() {
        let status: InstanceStatus = serde_json::from_str(r#""rebuilding""#).unwrap();
        assert_eq!(status, InstanceStatus::Unknown);
    }

    #[test]
    fn test_image_payload_conversion() {
        let payload: ImagePayload = serde_json::from_str(
            r#"{"id": 7, "description": null, "image_size": 1.5,
                "created": "2024-03-01T10:00:00+00:00", "labels": {"created_by": "imagectl"}}"#,
        )
        .unwrap();
        let artifact = payload.into_artifact().unwrap();
        assert_eq!(artifact.id, 7);
        assert_eq!(artifact.description, "");
        assert!(artifact.has_label(&Label::provenance("imagectl")));
    }
}
