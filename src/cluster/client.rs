//! Hypervisor REST Client
//!
//! [`PveClient`] implements [`HypervisorApi`] against the cluster's JSON
//! API. Every response is wrapped in a `{"data": ...}` envelope.

use super::config::{ClusterConfig, Credentials};
use crate::domain::ports::{
    ApiVersion, ClusterMember, ClusterResource, DiskRequest, HypervisorApi, ResourceKind,
    StorageStatus, StorageVolume, TaskStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Per-request timeout towards the cluster API
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

enum Auth {
    Token(String),
    Login {
        username: String,
        password: String,
        session: RwLock<Option<Ticket>>,
    },
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Token(_) => f.write_str("Token"),
            Auth::Login { username, .. } => write!(f, "Login {{ username: {:?} }}", username),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// REST client for one hypervisor cluster
#[derive(Debug)]
pub struct PveClient {
    region: String,
    base_url: String,
    http: reqwest::Client,
    auth: Auth,
}

impl PveClient {
    /// Build a client from its cluster configuration
    pub fn new(config: &ClusterConfig) -> Result<Self> {
        if config.url.is_empty() {
            return Err(Error::Configuration(format!(
                "cluster {} has no url",
                config.region
            )));
        }

        let auth = match config.credentials()? {
            Credentials::Token { id, secret } => {
                Auth::Token(format!("PVEAPIToken={}={}", id, secret))
            }
            Credentials::Password { username, password } => Auth::Login {
                username,
                password,
                session: RwLock::new(None),
            },
        };

        if config.insecure {
            warn!("TLS verification disabled for cluster {}", config.region);
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            region: config.region.clone(),
            base_url: config.url.trim_end_matches('/').to_string(),
            http,
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn login(&self, username: &str, password: &str) -> Result<Ticket> {
        debug!("Requesting ticket for {} on {}", username, self.region);

        let response = self
            .http
            .post(self.url("/access/ticket"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        let ticket: Envelope<Ticket> = self.decode(response).await?;
        Ok(ticket.data)
    }

    async fn send(
        &self,
        method: &Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method.clone(), self.url(path));
        if !form.is_empty() {
            request = request.form(form);
        }

        match &self.auth {
            Auth::Token(value) => {
                request = request.header(header::AUTHORIZATION, value);
            }
            Auth::Login {
                username,
                password,
                session,
            } => {
                if session.read().await.is_none() {
                    let ticket = self.login(username, password).await?;
                    *session.write().await = Some(ticket);
                }

                let guard = session.read().await;
                if let Some(ticket) = guard.as_ref() {
                    request = request
                        .header(header::COOKIE, format!("PVEAuthCookie={}", ticket.ticket));
                    if *method != Method::GET {
                        request = request.header("CSRFPreventionToken", &ticket.csrf_token);
                    }
                }
            }
        }

        Ok(request.send().await?)
    }

    /// Issue a call and decode the `data` field of the envelope.
    /// An expired ticket is renewed once.
    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let mut response = self.send(&method, path, form).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Auth::Login { session, .. } = &self.auth {
                debug!("Ticket rejected by {}, logging in again", self.region);
                *session.write().await = None;
                response = self.send(&method, path, form).await?;
            }
        }

        let envelope: Envelope<T> = self.decode(response).await?;
        Ok(envelope.data)
    }

    async fn decode<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(Error::ClusterApi {
                region: self.region.clone(),
                status: Some(status.as_u16()),
                reason: error_reason(status, &body),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.call(Method::GET, path, &[]).await
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: BTreeMap<String, serde_json::Value>,
}

/// Reason of a failed call. Rejected parameters come back as a 400 whose
/// body carries a per-field `errors` map; any other failure keeps its body.
fn error_reason(status: StatusCode, body: &str) -> String {
    if status == StatusCode::BAD_REQUEST {
        let errors = serde_json::from_str::<ErrorBody>(body)
            .map(|parsed| parsed.errors)
            .unwrap_or_default();
        if !errors.is_empty() {
            let fields: Vec<String> = errors
                .into_iter()
                .map(|(field, message)| match message {
                    serde_json::Value::String(s) => format!("{}: {}", field, s.trim()),
                    other => format!("{}: {}", field, other),
                })
                .collect();
            return format!("Parameter verification failed. ({})", fields.join(", "));
        }
    }

    format!("{}: {}", status, body.trim())
}

/// Flatten a VM configuration into string values
fn flatten_config(raw: BTreeMap<String, serde_json::Value>) -> BTreeMap<String, String> {
    raw.into_iter()
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

/// Size argument in mebibytes, rounded up
fn size_argument(size_bytes: u64) -> String {
    format!("{}M", size_bytes.div_ceil(1024 * 1024))
}

#[async_trait]
impl HypervisorApi for PveClient {
    fn region(&self) -> &str {
        &self.region
    }

    fn is_privileged(&self) -> bool {
        matches!(self.auth, Auth::Login { .. })
    }

    async fn version(&self) -> Result<ApiVersion> {
        self.get("/version").await
    }

    async fn cluster_status(&self) -> Result<Vec<ClusterMember>> {
        self.get("/cluster/status").await
    }

    async fn cluster_resources(&self, kind: ResourceKind) -> Result<Vec<ClusterResource>> {
        self.get(&format!("/cluster/resources?type={}", kind.as_str()))
            .await
    }

    async fn storage_status(&self, node: &str, storage: &str) -> Result<StorageStatus> {
        self.get(&format!("/nodes/{}/storage/{}/status", node, storage))
            .await
    }

    async fn storage_content(&self, node: &str, storage: &str) -> Result<Vec<StorageVolume>> {
        self.get(&format!(
            "/nodes/{}/storage/{}/content?content=images",
            node, storage
        ))
        .await
    }

    async fn create_disk(
        &self,
        node: &str,
        storage: &str,
        request: &DiskRequest,
    ) -> Result<String> {
        let mut form = vec![
            ("vmid", request.vmid.to_string()),
            ("filename", request.filename.clone()),
            ("size", size_argument(request.size_bytes)),
        ];
        if let Some(format) = &request.format {
            form.push(("format", format.clone()));
        }

        self.call(
            Method::POST,
            &format!("/nodes/{}/storage/{}/content", node, storage),
            &form,
        )
        .await
    }

    async fn delete_disk(&self, node: &str, storage: &str, volid: &str) -> Result<()> {
        let _: Option<String> = self
            .call(
                Method::DELETE,
                &format!(
                    "/nodes/{}/storage/{}/content/{}",
                    node,
                    storage,
                    urlencoding::encode(volid)
                ),
                &[],
            )
            .await?;
        Ok(())
    }

    async fn vm_config(&self, node: &str, vmid: u32) -> Result<BTreeMap<String, String>> {
        let raw: BTreeMap<String, serde_json::Value> = self
            .get(&format!("/nodes/{}/qemu/{}/config", node, vmid))
            .await?;
        Ok(flatten_config(raw))
    }

    async fn copy_volume(
        &self,
        node: &str,
        storage: &str,
        volid: &str,
        target: &str,
    ) -> Result<String> {
        let form = [
            ("target", volid.to_string()),
            ("target_node", target.to_string()),
        ];

        self.call(
            Method::POST,
            &format!(
                "/nodes/{}/storage/{}/content/{}",
                node,
                storage,
                urlencoding::encode(volid)
            ),
            &form,
        )
        .await
    }

    async fn task_status(&self, node: &str, upid: &str) -> Result<TaskStatus> {
        self.get(&format!(
            "/nodes/{}/tasks/{}/status",
            node,
            urlencoding::encode(upid)
        ))
        .await
    }
}
