//! Cluster API client.
//!
//! The orchestrator submits work to a Kubernetes-like cluster and polls for
//! its completion; it never builds or runs anything locally. This module
//! defines the typed surface the orchestrator needs (namespaces, secrets,
//! access reviews, image streams, workloads, watches) behind the
//! [`ClusterClient`] trait, an HTTP implementation, and an in-memory
//! implementation for tests and development.

mod http;
mod memory;

pub use http::HttpClusterClient;
pub use memory::MemoryClusterClient;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error talking to the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The API rejected the request.
    #[error("api error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Server-provided message.
        message: String,
    },

    /// The resource kind is not served by this cluster.
    #[error("kind not served: {0}")]
    KindNotFound(String),

    /// The request never reached the API.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClusterError {
    /// Whether the error reports that the object already exists.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Api { status: 409, .. })
    }

    /// Whether the error reports a missing object.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// Whether the error reports insufficient permissions.
    #[must_use]
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Api { status: 403, .. })
    }
}

/// Common object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    #[serde(default)]
    pub name: String,
    /// Object namespace, when namespaced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Server-assigned unique identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// When the object was created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when the object is being deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Lifecycle phase of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NamespacePhase {
    /// Namespace is live.
    #[default]
    Active,
    /// Namespace is being torn down.
    Terminating,
}

/// A namespace and its lifecycle phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Namespace {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Lifecycle phase.
    pub phase: NamespacePhase,
}

/// A request to create a new project (self-service namespace).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRequest {
    /// Name of the namespace to create.
    pub name: String,
    /// Human-readable display name.
    pub display_name: String,
    /// Longer description shown in consoles.
    pub description: String,
    /// Labels applied at creation.
    pub labels: BTreeMap<String, String>,
}

/// Kubernetes secret types the orchestrator mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SecretType {
    /// Arbitrary data.
    #[default]
    #[serde(rename = "Opaque")]
    Opaque,
    /// `.dockerconfigjson` pull credentials.
    #[serde(rename = "kubernetes.io/dockerconfigjson")]
    DockerConfigJson,
    /// Legacy `.dockercfg` pull credentials.
    #[serde(rename = "kubernetes.io/dockercfg")]
    Dockercfg,
    /// SSH private key.
    #[serde(rename = "kubernetes.io/ssh-auth")]
    SshAuth,
    /// Username/password pair.
    #[serde(rename = "kubernetes.io/basic-auth")]
    BasicAuth,
}

/// A secret. Data values are raw bytes; implementations encode them on the
/// wire as the API requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secret {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Secret payload.
    pub data: BTreeMap<String, Vec<u8>>,
    /// Secret type.
    pub secret_type: SecretType,
    /// Whether the secret rejects updates. Every secret the orchestrator
    /// creates sets this.
    pub immutable: bool,
}

/// A service account, read to learn whether pull secrets were minted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAccount {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Names of attached image pull secrets.
    pub image_pull_secrets: Vec<String>,
}

/// A subject granted a role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject kind (`User`, `Group`, ...).
    pub kind: String,
    /// Subject name.
    pub name: String,
}

/// A role binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleBinding {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Granted subjects.
    pub subjects: Vec<Subject>,
    /// Kind of the referenced role.
    pub role_kind: String,
    /// Name of the referenced role.
    pub role_name: String,
}

/// An image stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageStream {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Whether tags resolve locally inside the namespace.
    pub lookup_policy_local: bool,
}

/// A pod disruption budget pinning pods with a label key in place.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodDisruptionBudget {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Maximum number of selected pods that may be unavailable.
    pub max_unavailable: i32,
    /// Label key selecting the protected pods (exists-operator match).
    pub selector_key: String,
}

/// Severity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Routine lifecycle event.
    Normal,
    /// Something went wrong.
    Warning,
}

/// A cluster event emitted for job lifecycle visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    /// Severity.
    pub event_type: EventType,
    /// Machine-readable reason (`CiJobStarted`, ...).
    pub reason: String,
    /// Human-readable message.
    pub message: String,
}

/// A change observed on a watched namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEvent {
    /// Namespace name.
    pub name: String,
    /// Deletion timestamp, set once teardown has begun.
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

/// Terminal and non-terminal phases of submitted workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadPhase {
    /// Accepted, not yet scheduled.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Succeeded,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl WorkloadPhase {
    /// Whether the phase is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// A build submitted to the cluster-side image builder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildRequest {
    /// Build name.
    pub name: String,
    /// Image tag the build starts from.
    pub from_tag: Option<String>,
    /// Output tag in the pipeline stream.
    pub to_tag: String,
    /// Dockerfile path relative to the source root.
    pub dockerfile_path: Option<String>,
    /// Labels applied to the build.
    pub labels: BTreeMap<String, String>,
}

/// A pod submitted to run a test.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodRequest {
    /// Pod name.
    pub name: String,
    /// Image tag the container runs.
    pub image: String,
    /// Shell commands executed by the container.
    pub commands: String,
    /// Environment exposed to the container.
    pub env: BTreeMap<String, String>,
    /// Labels applied to the pod.
    pub labels: BTreeMap<String, String>,
    /// Node the pod is pinned to, when scheduling is restricted.
    pub node_name: Option<String>,
}

/// Typed access to the cluster API surface the orchestrator uses.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Requests creation of a new project.
    async fn create_project_request(&self, request: &ProjectRequest) -> Result<(), ClusterError>;

    /// Reads a namespace.
    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError>;

    /// Replaces a namespace's labels and annotations.
    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError>;

    /// Merge-patches annotations onto a namespace.
    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError>;

    /// Issues a self-subject access review: can the current identity perform
    /// `verb` on `resource` in `namespace`?
    async fn can_i(&self, namespace: &str, verb: &str, resource: &str)
        -> Result<bool, ClusterError>;

    /// Reads a service account.
    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError>;

    /// Creates a secret.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    /// Reads a secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    /// Creates a secret, replacing any existing object whose payload
    /// differs. Returns whether the secret was newly created.
    async fn upsert_immutable_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<bool, ClusterError>;

    /// Creates a role binding.
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), ClusterError>;

    /// Creates an image stream.
    async fn create_image_stream(
        &self,
        namespace: &str,
        stream: &ImageStream,
    ) -> Result<(), ClusterError>;

    /// Reads an image stream.
    async fn get_image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageStream, ClusterError>;

    /// Creates or updates a pod disruption budget.
    async fn ensure_pod_disruption_budget(
        &self,
        namespace: &str,
        pdb: &PodDisruptionBudget,
    ) -> Result<(), ClusterError>;

    /// Deletes an egress firewall object.
    async fn delete_egress_firewall(&self, namespace: &str, name: &str)
        -> Result<(), ClusterError>;

    /// Emits a lifecycle event into the namespace.
    async fn emit_event(&self, namespace: &str, event: &ClusterEvent) -> Result<(), ClusterError>;

    /// Lists a resource collection as raw JSON, for artifact dumps.
    async fn list_raw(
        &self,
        namespace: &str,
        resource: &str,
    ) -> Result<serde_json::Value, ClusterError>;

    /// Lists the distinct architectures of the cluster's nodes, sorted.
    async fn list_node_architectures(&self) -> Result<Vec<String>, ClusterError>;

    /// Watches a single namespace. The channel closes when the underlying
    /// connection drops; callers reconnect until their context is done.
    async fn watch_namespace(
        &self,
        name: &str,
    ) -> Result<mpsc::Receiver<NamespaceEvent>, ClusterError>;

    /// Submits a build to the cluster-side builder.
    async fn submit_build(
        &self,
        namespace: &str,
        build: &BuildRequest,
    ) -> Result<(), ClusterError>;

    /// Reads the phase of a submitted build.
    async fn build_phase(&self, namespace: &str, name: &str)
        -> Result<WorkloadPhase, ClusterError>;

    /// Submits a test pod.
    async fn submit_pod(&self, namespace: &str, pod: &PodRequest) -> Result<(), ClusterError>;

    /// Reads the phase of a submitted pod.
    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<WorkloadPhase, ClusterError>;

    /// Imports an external image as a tag on a stream.
    async fn import_image_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        from_pull_spec: &str,
    ) -> Result<(), ClusterError>;
}
