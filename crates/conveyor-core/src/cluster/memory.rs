//! In-memory cluster client for tests and development.
//!
//! Objects live in maps behind a single mutex. Workloads submitted here
//! succeed immediately, so graph execution can be exercised without a
//! cluster. Namespace watch events are injected by tests through
//! [`MemoryClusterClient::push_namespace_event`].

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{
    BuildRequest, ClusterClient, ClusterError, ClusterEvent, ImageStream, Namespace,
    NamespaceEvent, NamespacePhase, ObjectMeta, PodDisruptionBudget, PodRequest, ProjectRequest,
    RoleBinding, Secret, ServiceAccount, WorkloadPhase,
};

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, Namespace>,
    secrets: BTreeMap<(String, String), Secret>,
    service_accounts: BTreeMap<(String, String), ServiceAccount>,
    role_bindings: BTreeMap<(String, String), RoleBinding>,
    image_streams: BTreeMap<(String, String), ImageStream>,
    pdbs: BTreeMap<(String, String), PodDisruptionBudget>,
    builds: BTreeMap<(String, String), WorkloadPhase>,
    pods: BTreeMap<(String, String), WorkloadPhase>,
    events: Vec<(String, ClusterEvent)>,
    watchers: Vec<mpsc::Sender<NamespaceEvent>>,
}

/// A cluster client holding all state in memory.
#[derive(Default)]
pub struct MemoryClusterClient {
    state: Mutex<State>,
    /// Whether self-subject access reviews report access.
    pub allow_rbac: bool,
    /// Whether service accounts come pre-provisioned with pull secrets.
    pub mint_pull_secrets: bool,
}

impl MemoryClusterClient {
    /// Creates a fully permissive in-memory cluster.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::default(), allow_rbac: true, mint_pull_secrets: true }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Injects a namespace event into every active watcher.
    pub fn push_namespace_event(&self, event: NamespaceEvent) {
        let watchers = {
            let state = self.lock();
            state.watchers.clone()
        };
        for watcher in watchers {
            let _ = watcher.try_send(event.clone());
        }
    }

    /// Returns the events emitted into a namespace.
    #[must_use]
    pub fn events(&self, namespace: &str) -> Vec<ClusterEvent> {
        self.lock()
            .events
            .iter()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Returns a stored secret, if present.
    #[must_use]
    pub fn stored_secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Seeds a secret, for tests that read pre-existing cluster state.
    pub fn seed_secret(&self, namespace: &str, secret: Secret) {
        self.lock()
            .secrets
            .insert((namespace.to_string(), secret.metadata.name.clone()), secret);
    }
}

fn already_exists(kind: &str, name: &str) -> ClusterError {
    ClusterError::Api { status: 409, message: format!("{kind} {name:?} already exists") }
}

fn not_found(kind: &str, name: &str) -> ClusterError {
    ClusterError::Api { status: 404, message: format!("{kind} {name:?} not found") }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryClusterClient {
    async fn create_project_request(&self, request: &ProjectRequest) -> Result<(), ClusterError> {
        let mut state = self.lock();
        if state.namespaces.contains_key(&request.name) {
            return Err(already_exists("namespace", &request.name));
        }
        state.namespaces.insert(
            request.name.clone(),
            Namespace {
                metadata: ObjectMeta {
                    name: request.name.clone(),
                    labels: request.labels.clone(),
                    ..ObjectMeta::default()
                },
                phase: NamespacePhase::Active,
            },
        );
        if self.mint_pull_secrets {
            for account in ["builder", "default"] {
                state.service_accounts.insert(
                    (request.name.clone(), account.to_string()),
                    ServiceAccount {
                        metadata: ObjectMeta { name: account.to_string(), ..ObjectMeta::default() },
                        image_pull_secrets: vec![format!("{account}-dockercfg")],
                    },
                );
            }
        }
        Ok(())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        self.lock()
            .namespaces
            .get(name)
            .cloned()
            .ok_or_else(|| not_found("namespace", name))
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let name = namespace.metadata.name.clone();
        if !state.namespaces.contains_key(&name) {
            return Err(not_found("namespace", &name));
        }
        state.namespaces.insert(name, namespace.clone());
        Ok(())
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let namespace = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| not_found("namespace", name))?;
        for (key, value) in annotations {
            namespace.metadata.annotations.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    async fn can_i(&self, _: &str, _: &str, _: &str) -> Result<bool, ClusterError> {
        Ok(self.allow_rbac)
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError> {
        self.lock()
            .service_accounts
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("serviceaccount", name))
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), secret.metadata.name.clone());
        if state.secrets.contains_key(&key) {
            return Err(already_exists("secret", &secret.metadata.name));
        }
        state.secrets.insert(key, secret.clone());
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.lock()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("secret", name))
    }

    async fn upsert_immutable_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<bool, ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), secret.metadata.name.clone());
        let created = !state.secrets.contains_key(&key);
        state.secrets.insert(key, secret.clone());
        Ok(created)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), binding.metadata.name.clone());
        if state.role_bindings.contains_key(&key) {
            return Err(already_exists("rolebinding", &binding.metadata.name));
        }
        state.role_bindings.insert(key, binding.clone());
        Ok(())
    }

    async fn create_image_stream(
        &self,
        namespace: &str,
        stream: &ImageStream,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), stream.metadata.name.clone());
        if state.image_streams.contains_key(&key) {
            return Err(already_exists("imagestream", &stream.metadata.name));
        }
        let mut stored = stream.clone();
        stored.metadata.uid = Some(format!("uid-{}", stream.metadata.name));
        state.image_streams.insert(key, stored);
        Ok(())
    }

    async fn get_image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageStream, ClusterError> {
        self.lock()
            .image_streams
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| not_found("imagestream", name))
    }

    async fn ensure_pod_disruption_budget(
        &self,
        namespace: &str,
        pdb: &PodDisruptionBudget,
    ) -> Result<(), ClusterError> {
        self.lock()
            .pdbs
            .insert((namespace.to_string(), pdb.metadata.name.clone()), pdb.clone());
        Ok(())
    }

    async fn delete_egress_firewall(&self, _: &str, name: &str) -> Result<(), ClusterError> {
        Err(not_found("egressfirewall", name))
    }

    async fn emit_event(&self, namespace: &str, event: &ClusterEvent) -> Result<(), ClusterError> {
        self.lock().events.push((namespace.to_string(), event.clone()));
        Ok(())
    }

    async fn list_raw(&self, _: &str, resource: &str) -> Result<Value, ClusterError> {
        match resource {
            "pods" | "events" | "builds" | "imagestreams" | "templateinstances" => {
                Ok(json!({ "items": [] }))
            }
            other => Err(ClusterError::KindNotFound(other.to_string())),
        }
    }

    async fn list_node_architectures(&self) -> Result<Vec<String>, ClusterError> {
        Ok(vec!["amd64".to_string()])
    }

    async fn watch_namespace(
        &self,
        _: &str,
    ) -> Result<mpsc::Receiver<NamespaceEvent>, ClusterError> {
        let (tx, rx) = mpsc::channel(16);
        self.lock().watchers.push(tx);
        Ok(rx)
    }

    async fn submit_build(&self, namespace: &str, build: &BuildRequest) -> Result<(), ClusterError> {
        self.lock()
            .builds
            .insert((namespace.to_string(), build.name.clone()), WorkloadPhase::Succeeded);
        Ok(())
    }

    async fn build_phase(&self, namespace: &str, name: &str) -> Result<WorkloadPhase, ClusterError> {
        self.lock()
            .builds
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| not_found("build", name))
    }

    async fn submit_pod(&self, namespace: &str, pod: &PodRequest) -> Result<(), ClusterError> {
        self.lock()
            .pods
            .insert((namespace.to_string(), pod.name.clone()), WorkloadPhase::Succeeded);
        Ok(())
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<WorkloadPhase, ClusterError> {
        self.lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
            .ok_or_else(|| not_found("pod", name))
    }

    async fn import_image_tag(
        &self,
        namespace: &str,
        stream: &str,
        _tag: &str,
        _from_pull_spec: &str,
    ) -> Result<(), ClusterError> {
        let mut state = self.lock();
        let key = (namespace.to_string(), stream.to_string());
        state.image_streams.entry(key).or_insert_with(|| ImageStream {
            metadata: ObjectMeta { name: stream.to_string(), ..ObjectMeta::default() },
            lookup_policy_local: true,
        });
        Ok(())
    }
}
