//! Configuration loading.
//!
//! A configuration can arrive by file, inline environment variable (possibly
//! base64 and gzip encoded by the rehearsal tooling), object-store URL, or
//! from the config resolver. Unresolved configurations are round-tripped
//! through the resolver. Each path carries its own stable failure reason so
//! the caller can report it.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::read::GzDecoder;
use serde::Deserialize;
use thiserror::Error;

use super::{Metadata, ReleaseBuildConfiguration};

/// Inline configuration environment variable.
pub const CONFIG_SPEC_VAR: &str = "CONFIG_SPEC";
/// Object-store configuration URL environment variable.
pub const CONFIG_SPEC_GCS_URL_VAR: &str = "CONFIG_SPEC_GCS_URL";
/// Inline unresolved configuration environment variable.
pub const UNRESOLVED_CONFIG_VAR: &str = "UNRESOLVED_CONFIG";

/// Where the configuration is loaded from, in priority order.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// `--config FILE`.
    File(PathBuf),
    /// Inline `CONFIG_SPEC`.
    Inline(String),
    /// `CONFIG_SPEC_GCS_URL` pointing into an object store.
    ObjectStore(String),
    /// `--unresolved-config FILE`, resolved remotely.
    UnresolvedFile(PathBuf),
    /// Inline `UNRESOLVED_CONFIG`, resolved remotely.
    UnresolvedInline(String),
    /// Resolved remotely from the configuration identity.
    Resolver(Metadata),
}

/// Error loading a configuration, tagged with its reporting reason.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct LoadError {
    /// Stable reason reported to the results sink.
    pub reason: &'static str,
    /// Human-readable failure description.
    pub message: String,
}

impl LoadError {
    fn new(reason: &'static str, message: impl Into<String>) -> Self {
        Self { reason, message: message.into() }
    }
}

/// Details the resolver publishes about a cluster profile.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterProfileDetails {
    /// Name of the secret backing the profile.
    pub secret: String,
}

/// Client for the configuration resolver service.
#[async_trait::async_trait]
pub trait ResolverClient: Send + Sync {
    /// Fetches the resolved configuration for an identity.
    async fn config(&self, info: &Metadata) -> Result<ReleaseBuildConfiguration, String>;

    /// Resolves a raw unresolved configuration.
    async fn resolve(&self, raw: &[u8]) -> Result<ReleaseBuildConfiguration, String>;

    /// Fetches the configuration for an identity with a test injected from
    /// another configuration, identified by `ORG/REPO@BRANCH{__VARIANT}:TEST`.
    async fn config_with_test(
        &self,
        info: &Metadata,
        test: &str,
    ) -> Result<ReleaseBuildConfiguration, String>;

    /// Looks up cluster profile details by name.
    async fn cluster_profile(&self, name: &str) -> Result<ClusterProfileDetails, String>;
}

/// Reader for object-store paths, supplied by the binary when the
/// environment requests an object-store read.
pub trait ObjectOpener: Send + Sync {
    /// Reads the object at `path` in full.
    fn read(&self, path: &str) -> std::io::Result<Vec<u8>>;
}

/// HTTP implementation of [`ResolverClient`].
pub struct HttpResolverClient {
    address: String,
    client: reqwest::Client,
}

impl HttpResolverClient {
    /// Creates a client against the resolver at `address`.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into(), client: reqwest::Client::new() }
    }

    async fn get_config(&self, query: &[(&str, &str)]) -> Result<ReleaseBuildConfiguration, String> {
        let url = format!("{}/config", self.address);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|err| format!("could not reach resolver: {err}"))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("could not read resolver response: {err}"))?;
        if !status.is_success() {
            return Err(format!(
                "resolver returned {status}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        serde_json::from_slice(&body).map_err(|err| format!("malformed resolver response: {err}"))
    }
}

#[async_trait::async_trait]
impl ResolverClient for HttpResolverClient {
    async fn config(&self, info: &Metadata) -> Result<ReleaseBuildConfiguration, String> {
        let variant = info.variant.clone().unwrap_or_default();
        self.get_config(&[
            ("org", info.org.as_str()),
            ("repo", info.repo.as_str()),
            ("branch", info.branch.as_str()),
            ("variant", variant.as_str()),
        ])
        .await
    }

    async fn resolve(&self, raw: &[u8]) -> Result<ReleaseBuildConfiguration, String> {
        let url = format!("{}/resolve", self.address);
        let response = self
            .client
            .post(&url)
            .body(raw.to_vec())
            .send()
            .await
            .map_err(|err| format!("could not reach resolver: {err}"))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("could not read resolver response: {err}"))?;
        if !status.is_success() {
            return Err(format!(
                "resolver returned {status}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        serde_json::from_slice(&body).map_err(|err| format!("malformed resolver response: {err}"))
    }

    async fn config_with_test(
        &self,
        info: &Metadata,
        test: &str,
    ) -> Result<ReleaseBuildConfiguration, String> {
        let variant = info.variant.clone().unwrap_or_default();
        self.get_config(&[
            ("org", info.org.as_str()),
            ("repo", info.repo.as_str()),
            ("branch", info.branch.as_str()),
            ("variant", variant.as_str()),
            ("injectTestFrom", test),
        ])
        .await
    }

    async fn cluster_profile(&self, name: &str) -> Result<ClusterProfileDetails, String> {
        let url = format!("{}/clusterProfile", self.address);
        let response = self
            .client
            .get(&url)
            .query(&[("name", name)])
            .send()
            .await
            .map_err(|err| format!("could not reach resolver: {err}"))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| format!("could not read resolver response: {err}"))?;
        if !status.is_success() {
            return Err(format!(
                "resolver returned {status}: {}",
                String::from_utf8_lossy(&body)
            ));
        }
        serde_json::from_slice(&body).map_err(|err| format!("malformed resolver response: {err}"))
    }
}

/// Reads bytes that may or may not be gzip compressed.
pub fn read_bytes_maybe_gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if data.starts_with(&[0x1f, 0x8b]) {
        let mut decoder = GzDecoder::new(data);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out)?;
        return Ok(out);
    }
    Ok(data.to_vec())
}

/// Reads a file that may be gzip compressed.
pub fn read_file_maybe_gzip(path: &Path) -> std::io::Result<Vec<u8>> {
    let data = std::fs::read(path)?;
    read_bytes_maybe_gzip(&data)
}

/// Decodes inline configuration that the rehearsal tooling may have base64
/// encoded and gzip compressed. Values that are not base64 pass through.
fn decode_and_unzip(raw: &str) -> std::io::Result<String> {
    match BASE64.decode(raw.trim()) {
        Err(_) => Ok(raw.to_string()),
        Ok(decoded) => {
            let data = read_bytes_maybe_gzip(&decoded)?;
            Ok(String::from_utf8_lossy(&data).into_owned())
        }
    }
}

/// Loads the configuration from its source, in the documented priority
/// order. The returned error carries the stable reporting reason for the
/// path that failed.
pub async fn load_configuration(
    source: &ConfigSource,
    resolver: &dyn ResolverClient,
    opener: Option<&dyn ObjectOpener>,
) -> Result<ReleaseBuildConfiguration, LoadError> {
    let raw = match source {
        ConfigSource::File(path) => {
            let data = read_file_maybe_gzip(path).map_err(|err| {
                LoadError::new("loading_config", format!("--config error: {err}"))
            })?;
            String::from_utf8_lossy(&data).into_owned()
        }
        ConfigSource::Inline(value) => {
            if value.is_empty() {
                return Err(LoadError::new(
                    "loading_config",
                    format!("{CONFIG_SPEC_VAR} environment variable cannot be set to an empty string"),
                ));
            }
            decode_and_unzip(value).map_err(|err| {
                LoadError::new("loading_config", format!("{CONFIG_SPEC_VAR} error: {err}"))
            })?
        }
        ConfigSource::ObjectStore(url) => {
            if url.is_empty() {
                return Err(LoadError::new(
                    "loading_config",
                    format!(
                        "{CONFIG_SPEC_GCS_URL_VAR} environment variable cannot be set to an empty string"
                    ),
                ));
            }
            let opener = opener.ok_or_else(|| {
                LoadError::new(
                    "loading_config",
                    format!("no object-store opener configured to read {CONFIG_SPEC_GCS_URL_VAR}"),
                )
            })?;
            let content = opener.read(url).map_err(|err| {
                LoadError::new("loading_config", format!("error reading {url}: {err}"))
            })?;
            decode_and_unzip(&String::from_utf8_lossy(&content)).map_err(|err| {
                LoadError::new("loading_config", format!("{CONFIG_SPEC_GCS_URL_VAR} error: {err}"))
            })?
        }
        ConfigSource::UnresolvedFile(path) => {
            let data = read_file_maybe_gzip(path).map_err(|err| {
                LoadError::new("loading_config", format!("--unresolved-config error: {err}"))
            })?;
            return resolver
                .resolve(&data)
                .await
                .map_err(|err| LoadError::new("config_resolver_literal", err));
        }
        ConfigSource::UnresolvedInline(value) => {
            return resolver
                .resolve(value.as_bytes())
                .await
                .map_err(|err| LoadError::new("config_resolver_literal", err));
        }
        ConfigSource::Resolver(info) => {
            return resolver
                .config(info)
                .await
                .map_err(|err| LoadError::new("config_resolver", err));
        }
    };

    ReleaseBuildConfiguration::from_yaml(&raw)
        .map_err(|err| LoadError::new("loading_config", format!("invalid configuration: {err}")))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use super::*;

    struct RejectingResolver;

    #[async_trait::async_trait]
    impl ResolverClient for RejectingResolver {
        async fn config(&self, _: &Metadata) -> Result<ReleaseBuildConfiguration, String> {
            Err("resolver unavailable".to_string())
        }
        async fn resolve(&self, _: &[u8]) -> Result<ReleaseBuildConfiguration, String> {
            Err("resolver unavailable".to_string())
        }
        async fn config_with_test(
            &self,
            _: &Metadata,
            _: &str,
        ) -> Result<ReleaseBuildConfiguration, String> {
            Err("resolver unavailable".to_string())
        }
        async fn cluster_profile(&self, _: &str) -> Result<ClusterProfileDetails, String> {
            Err("resolver unavailable".to_string())
        }
    }

    const MINIMAL: &str = "tests:\n- as: unit\n  commands: make test\n  from: src\n";

    #[tokio::test]
    async fn loads_plain_inline_config() {
        let source = ConfigSource::Inline(MINIMAL.to_string());
        let config = load_configuration(&source, &RejectingResolver, None).await.unwrap();
        assert_eq!(config.tests[0].as_name, "unit");
    }

    #[tokio::test]
    async fn loads_base64_gzip_inline_config() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(MINIMAL.as_bytes()).unwrap();
        let packed = BASE64.encode(encoder.finish().unwrap());

        let source = ConfigSource::Inline(packed);
        let config = load_configuration(&source, &RejectingResolver, None).await.unwrap();
        assert_eq!(config.tests[0].as_name, "unit");
    }

    #[tokio::test]
    async fn empty_inline_config_is_an_error() {
        let source = ConfigSource::Inline(String::new());
        let err = load_configuration(&source, &RejectingResolver, None).await.unwrap_err();
        assert_eq!(err.reason, "loading_config");
    }

    #[tokio::test]
    async fn resolver_failures_carry_resolver_reason() {
        let source = ConfigSource::Resolver(Metadata::default());
        let err = load_configuration(&source, &RejectingResolver, None).await.unwrap_err();
        assert_eq!(err.reason, "config_resolver");

        let source = ConfigSource::UnresolvedInline("tests: []".to_string());
        let err = load_configuration(&source, &RejectingResolver, None).await.unwrap_err();
        assert_eq!(err.reason, "config_resolver_literal");
    }
}
