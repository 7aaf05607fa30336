//! HTTP client for the Hetzner-Cloud-shaped REST API.
//!
//! Bearer-token authenticated JSON over HTTPS. Every request carries the
//! client-wide timeout, so no call can block indefinitely.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::CloudApi;
use crate::error::{CloudError, CloudResult};
use crate::model::{
    CreateServer, CreateServerPayload, ErrorEnvelope, ImageArtifact, ImageId, ImageListPayload,
    ImageQuery, Instance, ServerId,
};

/// Default public API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";

/// Upper bound on pages followed by a single listing.
const MAX_PAGES: u32 = 100;

const PER_PAGE: u32 = 50;

/// Cloud API client configuration
#[derive(Clone)]
pub struct HcloudConfig {
    /// API base URL, without trailing slash
    pub endpoint: String,
    /// Bearer token
    pub token: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl HcloudConfig {
    /// Create config for the public endpoint
    pub fn new(token: &str) -> Self {
        HcloudConfig {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: token.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Point the client at another endpoint (mock servers, proxies)
    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    /// Set the per-request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Debug for HcloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HcloudConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Cloud API client
pub struct HcloudClient {
    config: HcloudConfig,
    http_client: reqwest::Client,
}

impl HcloudClient {
    /// Create a new client
    pub fn new(config: HcloudConfig) -> CloudResult<Self> {
        if config.token.trim().is_empty() {
            return Err(CloudError::Config("API token is empty".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .user_agent(concat!("imagectl/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| CloudError::Config(e.to_string()))?;

        Ok(HcloudClient {
            config,
            http_client,
        })
    }

    pub fn config(&self) -> &HcloudConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint, path.trim_start_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, self.url(path))
            .bearer_auth(&self.config.token)
    }

    /// Send and decode a JSON body, mapping error envelopes to `CloudError::Api`.
    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> CloudResult<T> {
        let response = check_status(request.send().await?).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Send a request whose response body is irrelevant.
    async fn send_discarding(&self, request: reqwest::RequestBuilder) -> CloudResult<()> {
        check_status(request.send().await?).await?;
        Ok(())
    }
}

async fn check_status(response: reqwest::Response) -> CloudResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => (envelope.error.code, envelope.error.message),
        Err(_) => (
            status.canonical_reason().unwrap_or("unknown").to_string(),
            body,
        ),
    };

    Err(CloudError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl CloudApi for HcloudClient {
    async fn list_images(&self, query: &ImageQuery) -> CloudResult<Vec<ImageArtifact>> {
        let params = query.to_params();
        let mut images = Vec::new();
        let mut page = 1u32;

        loop {
            let request = self
                .request(reqwest::Method::GET, "images")
                .query(&params)
                .query(&[("page", page), ("per_page", PER_PAGE)]);
            let payload: ImageListPayload = self.send_json(request).await?;
            let next = payload.next_page();

            for image in payload.images {
                images.push(image.into_artifact()?);
            }

            match next {
                Some(n) if n > MAX_PAGES => {
                    warn!(next_page = n, max_pages = MAX_PAGES, "image listing truncated");
                    return Err(CloudError::TooManyPages {
                        max_pages: MAX_PAGES,
                    });
                }
                Some(n) if n > page => page = n,
                _ => break,
            }
        }

        debug!(count = images.len(), "listed images");
        Ok(images)
    }

    async fn delete_image(&self, id: ImageId) -> CloudResult<()> {
        let request = self.request(reqwest::Method::DELETE, &format!("images/{id}"));
        self.send_discarding(request).await?;
        info!(image_id = id, "deleted image");
        Ok(())
    }

    async fn create_server(&self, request: &CreateServer) -> CloudResult<Instance> {
        let http_request = self.request(reqwest::Method::POST, "servers").json(request);
        let payload: CreateServerPayload = self.send_json(http_request).await?;
        let instance = payload
            .server
            .ok_or(CloudError::MissingField("server"))?
            .into_instance()?;
        info!(server_id = instance.id, name = %instance.name, "created server");
        Ok(instance)
    }

    async fn delete_server(&self, id: ServerId) -> CloudResult<()> {
        let request = self.request(reqwest::Method::DELETE, &format!("servers/{id}"));
        self.send_discarding(request).await?;
        info!(server_id = id, "deleted server");
        Ok(())
    }
}
