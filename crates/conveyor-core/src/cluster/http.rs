//! HTTP implementation of the cluster client.
//!
//! Speaks the JSON REST dialect of the cluster API with bearer-token
//! authentication. Only the handful of resource groups the orchestrator
//! touches are mapped; everything else stays behind [`super::ClusterClient`].

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{
    BuildRequest, ClusterClient, ClusterError, ClusterEvent, EventType, ImageStream, Namespace,
    NamespaceEvent, NamespacePhase, ObjectMeta, PodDisruptionBudget, PodRequest, ProjectRequest,
    RoleBinding, Secret, SecretType, ServiceAccount, WorkloadPhase,
};

/// Cluster client backed by the HTTP API.
pub struct HttpClusterClient {
    base_url: String,
    token: SecretString,
    impersonate: Option<String>,
    client: reqwest::Client,
}

impl HttpClusterClient {
    /// Creates a client for the API server at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        impersonate: Option<String>,
    ) -> Result<Self, ClusterError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            impersonate,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(self.token.expose_secret());
        if let Some(user) = &self.impersonate {
            builder = builder.header("Impersonate-User", user);
        }
        builder
    }

    async fn execute(&self, builder: reqwest::RequestBuilder) -> Result<Value, ClusterError> {
        let response = builder
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        if !status.is_success() {
            let message = String::from_utf8_lossy(&body).into_owned();
            if status.as_u16() == 404 && message.contains("the server could not find the requested resource") {
                return Err(ClusterError::KindNotFound(message));
            }
            return Err(ClusterError::Api { status: status.as_u16(), message });
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&body).map_err(|err| ClusterError::Malformed(err.to_string()))
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value, ClusterError> {
        self.execute(self.request(reqwest::Method::POST, path).json(&body)).await
    }

    async fn get(&self, path: &str) -> Result<Value, ClusterError> {
        self.execute(self.request(reqwest::Method::GET, path)).await
    }

    async fn put(&self, path: &str, body: Value) -> Result<Value, ClusterError> {
        self.execute(self.request(reqwest::Method::PUT, path).json(&body)).await
    }
}

fn meta_json(meta: &ObjectMeta) -> Value {
    let mut out = json!({ "name": meta.name });
    if let Some(namespace) = &meta.namespace {
        out["namespace"] = json!(namespace);
    }
    if !meta.labels.is_empty() {
        out["labels"] = json!(meta.labels);
    }
    if !meta.annotations.is_empty() {
        out["annotations"] = json!(meta.annotations);
    }
    out
}

fn meta_from_json(value: &Value) -> ObjectMeta {
    let meta = &value["metadata"];
    let string_map = |v: &Value| -> BTreeMap<String, String> {
        v.as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    };
    ObjectMeta {
        name: meta["name"].as_str().unwrap_or_default().to_string(),
        namespace: meta["namespace"].as_str().map(str::to_string),
        labels: string_map(&meta["labels"]),
        annotations: string_map(&meta["annotations"]),
        uid: meta["uid"].as_str().map(str::to_string),
        creation_timestamp: meta["creationTimestamp"]
            .as_str()
            .and_then(|s| s.parse().ok()),
        deletion_timestamp: meta["deletionTimestamp"]
            .as_str()
            .and_then(|s| s.parse().ok()),
    }
}

fn secret_type_str(secret_type: SecretType) -> &'static str {
    match secret_type {
        SecretType::Opaque => "Opaque",
        SecretType::DockerConfigJson => "kubernetes.io/dockerconfigjson",
        SecretType::Dockercfg => "kubernetes.io/dockercfg",
        SecretType::SshAuth => "kubernetes.io/ssh-auth",
        SecretType::BasicAuth => "kubernetes.io/basic-auth",
    }
}

fn secret_type_from_str(value: &str) -> SecretType {
    match value {
        "kubernetes.io/dockerconfigjson" => SecretType::DockerConfigJson,
        "kubernetes.io/dockercfg" => SecretType::Dockercfg,
        "kubernetes.io/ssh-auth" => SecretType::SshAuth,
        "kubernetes.io/basic-auth" => SecretType::BasicAuth,
        _ => SecretType::Opaque,
    }
}

fn secret_json(secret: &Secret) -> Value {
    let data: BTreeMap<String, String> = secret
        .data
        .iter()
        .map(|(k, v)| (k.clone(), BASE64.encode(v)))
        .collect();
    json!({
        "metadata": meta_json(&secret.metadata),
        "data": data,
        "type": secret_type_str(secret.secret_type),
        "immutable": secret.immutable,
    })
}

fn phase_from_str(phase: &str) -> WorkloadPhase {
    match phase {
        "Running" => WorkloadPhase::Running,
        "Succeeded" | "Complete" => WorkloadPhase::Succeeded,
        "Failed" | "Error" => WorkloadPhase::Failed,
        "Cancelled" => WorkloadPhase::Cancelled,
        _ => WorkloadPhase::Pending,
    }
}

#[async_trait::async_trait]
impl ClusterClient for HttpClusterClient {
    async fn create_project_request(&self, request: &ProjectRequest) -> Result<(), ClusterError> {
        self.post(
            "/apis/project.openshift.io/v1/projectrequests",
            json!({
                "metadata": { "name": request.name, "labels": request.labels },
                "displayName": request.display_name,
                "description": request.description,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_namespace(&self, name: &str) -> Result<Namespace, ClusterError> {
        let value = self.get(&format!("/api/v1/namespaces/{name}")).await?;
        let phase = match value["status"]["phase"].as_str() {
            Some("Terminating") => NamespacePhase::Terminating,
            _ => NamespacePhase::Active,
        };
        Ok(Namespace { metadata: meta_from_json(&value), phase })
    }

    async fn update_namespace(&self, namespace: &Namespace) -> Result<(), ClusterError> {
        self.put(
            &format!("/api/v1/namespaces/{}", namespace.metadata.name),
            json!({ "metadata": meta_json(&namespace.metadata) }),
        )
        .await
        .map(|_| ())
    }

    async fn patch_namespace_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<(), ClusterError> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        self.execute(
            self.request(reqwest::Method::PATCH, &format!("/api/v1/namespaces/{name}"))
                .header("Content-Type", "application/merge-patch+json")
                .body(patch.to_string()),
        )
        .await
        .map(|_| ())
    }

    async fn can_i(
        &self,
        namespace: &str,
        verb: &str,
        resource: &str,
    ) -> Result<bool, ClusterError> {
        let value = self
            .post(
                "/apis/authorization.k8s.io/v1/selfsubjectaccessreviews",
                json!({
                    "spec": { "resourceAttributes": {
                        "namespace": namespace, "verb": verb, "resource": resource,
                    }},
                }),
            )
            .await?;
        Ok(value["status"]["allowed"].as_bool().unwrap_or(false))
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceAccount, ClusterError> {
        let value = self
            .get(&format!("/api/v1/namespaces/{namespace}/serviceaccounts/{name}"))
            .await?;
        let image_pull_secrets = value["imagePullSecrets"]
            .as_array()
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r["name"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Ok(ServiceAccount { metadata: meta_from_json(&value), image_pull_secrets })
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        self.post(&format!("/api/v1/namespaces/{namespace}/secrets"), secret_json(secret))
            .await
            .map(|_| ())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        let value = self
            .get(&format!("/api/v1/namespaces/{namespace}/secrets/{name}"))
            .await?;
        let data = value["data"]
            .as_object()
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| {
                        let decoded = BASE64.decode(v.as_str()?).ok()?;
                        Some((k.clone(), decoded))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Secret {
            metadata: meta_from_json(&value),
            data,
            secret_type: secret_type_from_str(value["type"].as_str().unwrap_or_default()),
            immutable: value["immutable"].as_bool().unwrap_or(false),
        })
    }

    async fn upsert_immutable_secret(
        &self,
        namespace: &str,
        secret: &Secret,
    ) -> Result<bool, ClusterError> {
        match self.create_secret(namespace, secret).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_already_exists() => {
                let existing = self.get_secret(namespace, &secret.metadata.name).await?;
                if existing.data == secret.data && existing.immutable == secret.immutable {
                    return Ok(false);
                }
                // Immutable secrets cannot be updated in place.
                self.execute(self.request(
                    reqwest::Method::DELETE,
                    &format!("/api/v1/namespaces/{namespace}/secrets/{}", secret.metadata.name),
                ))
                .await?;
                self.create_secret(namespace, secret).await?;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<(), ClusterError> {
        self.post(
            &format!("/apis/rbac.authorization.k8s.io/v1/namespaces/{namespace}/rolebindings"),
            json!({
                "metadata": meta_json(&binding.metadata),
                "subjects": binding.subjects,
                "roleRef": { "kind": binding.role_kind, "name": binding.role_name },
            }),
        )
        .await
        .map(|_| ())
    }

    async fn create_image_stream(
        &self,
        namespace: &str,
        stream: &ImageStream,
    ) -> Result<(), ClusterError> {
        self.post(
            &format!("/apis/image.openshift.io/v1/namespaces/{namespace}/imagestreams"),
            json!({
                "metadata": meta_json(&stream.metadata),
                "spec": { "lookupPolicy": { "local": stream.lookup_policy_local } },
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_image_stream(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ImageStream, ClusterError> {
        let value = self
            .get(&format!(
                "/apis/image.openshift.io/v1/namespaces/{namespace}/imagestreams/{name}"
            ))
            .await?;
        Ok(ImageStream {
            metadata: meta_from_json(&value),
            lookup_policy_local: value["spec"]["lookupPolicy"]["local"].as_bool().unwrap_or(false),
        })
    }

    async fn ensure_pod_disruption_budget(
        &self,
        namespace: &str,
        pdb: &PodDisruptionBudget,
    ) -> Result<(), ClusterError> {
        let body = json!({
            "metadata": meta_json(&pdb.metadata),
            "spec": {
                "maxUnavailable": pdb.max_unavailable,
                "selector": { "matchExpressions": [
                    { "key": pdb.selector_key, "operator": "Exists" },
                ]},
            },
        });
        match self
            .post(
                &format!("/apis/policy/v1/namespaces/{namespace}/poddisruptionbudgets"),
                body.clone(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_already_exists() => self
                .put(
                    &format!(
                        "/apis/policy/v1/namespaces/{namespace}/poddisruptionbudgets/{}",
                        pdb.metadata.name
                    ),
                    body,
                )
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        }
    }

    async fn delete_egress_firewall(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), ClusterError> {
        self.execute(self.request(
            reqwest::Method::DELETE,
            &format!("/apis/k8s.ovn.org/v1/namespaces/{namespace}/egressfirewalls/{name}"),
        ))
        .await
        .map(|_| ())
    }

    async fn emit_event(&self, namespace: &str, event: &ClusterEvent) -> Result<(), ClusterError> {
        let event_type = match event.event_type {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        self.post(
            &format!("/api/v1/namespaces/{namespace}/events"),
            json!({
                "metadata": { "generateName": "conveyor-" },
                "involvedObject": { "kind": "Namespace", "name": namespace },
                "type": event_type,
                "reason": event.reason,
                "message": event.message,
                "source": { "component": namespace },
            }),
        )
        .await
        .map(|_| ())
    }

    async fn list_raw(&self, namespace: &str, resource: &str) -> Result<Value, ClusterError> {
        let path = match resource {
            "pods" | "events" => format!("/api/v1/namespaces/{namespace}/{resource}"),
            "builds" => {
                format!("/apis/build.openshift.io/v1/namespaces/{namespace}/builds")
            }
            "imagestreams" => {
                format!("/apis/image.openshift.io/v1/namespaces/{namespace}/imagestreams")
            }
            "templateinstances" => format!(
                "/apis/template.openshift.io/v1/namespaces/{namespace}/templateinstances"
            ),
            other => return Err(ClusterError::KindNotFound(other.to_string())),
        };
        self.get(&path).await
    }

    async fn list_node_architectures(&self) -> Result<Vec<String>, ClusterError> {
        let value = self.get("/api/v1/nodes").await?;
        let mut architectures: Vec<String> = value["items"]
            .as_array()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| n["status"]["nodeInfo"]["architecture"].as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        architectures.sort();
        architectures.dedup();
        Ok(architectures)
    }

    async fn watch_namespace(
        &self,
        name: &str,
    ) -> Result<mpsc::Receiver<NamespaceEvent>, ClusterError> {
        let response = self
            .request(
                reqwest::Method::GET,
                &format!("/api/v1/namespaces?fieldSelector=metadata.name%3D{name}&watch=true"),
            )
            .send()
            .await
            .map_err(|err| ClusterError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ClusterError::Api {
                status: response.status().as_u16(),
                message: "watch rejected".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel(16);
        let mut stream = response.bytes_stream();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            while let Some(chunk) = stream.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.extend_from_slice(&chunk);
                while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let Ok(value) = serde_json::from_slice::<Value>(&line) else {
                        continue;
                    };
                    let object = &value["object"];
                    let event = NamespaceEvent {
                        name: object["metadata"]["name"].as_str().unwrap_or_default().to_string(),
                        deletion_timestamp: object["metadata"]["deletionTimestamp"]
                            .as_str()
                            .and_then(|s| s.parse().ok()),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            // Channel closes here; the caller reconnects.
        });
        Ok(rx)
    }

    async fn submit_build(
        &self,
        namespace: &str,
        build: &BuildRequest,
    ) -> Result<(), ClusterError> {
        let mut spec = json!({
            "output": { "to": { "kind": "ImageStreamTag", "name": build.to_tag } },
        });
        if let Some(from) = &build.from_tag {
            spec["strategy"] = json!({ "dockerStrategy": { "from": {
                "kind": "ImageStreamTag", "name": from,
            }}});
        }
        if let Some(path) = &build.dockerfile_path {
            spec["source"] = json!({ "type": "Git", "contextDir": path });
        }
        self.post(
            &format!("/apis/build.openshift.io/v1/namespaces/{namespace}/builds"),
            json!({
                "metadata": { "name": build.name, "namespace": namespace, "labels": build.labels },
                "spec": spec,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn build_phase(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<WorkloadPhase, ClusterError> {
        let value = self
            .get(&format!("/apis/build.openshift.io/v1/namespaces/{namespace}/builds/{name}"))
            .await?;
        Ok(phase_from_str(value["status"]["phase"].as_str().unwrap_or_default()))
    }

    async fn submit_pod(&self, namespace: &str, pod: &PodRequest) -> Result<(), ClusterError> {
        let env: Vec<Value> = pod
            .env
            .iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect();
        let mut spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": "test",
                "image": pod.image,
                "command": ["/bin/sh", "-c", pod.commands],
                "env": env,
            }],
        });
        if let Some(node) = &pod.node_name {
            spec["nodeName"] = json!(node);
        }
        self.post(
            &format!("/api/v1/namespaces/{namespace}/pods"),
            json!({
                "metadata": { "name": pod.name, "namespace": namespace, "labels": pod.labels },
                "spec": spec,
            }),
        )
        .await
        .map(|_| ())
    }

    async fn pod_phase(&self, namespace: &str, name: &str) -> Result<WorkloadPhase, ClusterError> {
        let value = self
            .get(&format!("/api/v1/namespaces/{namespace}/pods/{name}"))
            .await?;
        Ok(phase_from_str(value["status"]["phase"].as_str().unwrap_or_default()))
    }

    async fn import_image_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
        from_pull_spec: &str,
    ) -> Result<(), ClusterError> {
        self.post(
            &format!("/apis/image.openshift.io/v1/namespaces/{namespace}/imagestreamimports"),
            json!({
                "metadata": { "name": stream, "namespace": namespace },
                "spec": {
                    "import": true,
                    "images": [{
                        "from": { "kind": "DockerImage", "name": from_pull_spec },
                        "to": { "name": tag },
                    }],
                },
            }),
        )
        .await
        .map(|_| ())
    }
}
