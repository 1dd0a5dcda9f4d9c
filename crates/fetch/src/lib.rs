//! Keel fetch: resolve an artifact locator (path, `file://`, `http(s)://`,
//! `oci://`) to raw archive bytes.
//!
//! The resolver holds an ordered list of scheme fetchers plus a default
//! (local file) fetcher and dispatches to the first fetcher whose
//! `provides(scheme)` is true. Nothing is cached and nothing is retried;
//! every `resolve` goes back to the source.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

mod file;
mod http;
mod oci;

pub use file::FileFetcher;
pub use http::HttpFetcher;
pub use oci::{OciFetcher, OciReference};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("invalid locator {locator:?}: {reason}")]
    InvalidLocator { locator: String, reason: String },
    #[error("source unavailable for {locator}: {reason}")]
    SourceUnavailable { locator: String, reason: String },
    #[error("building {scheme} transport: {reason}")]
    Transport { scheme: &'static str, reason: String },
}

impl FetchError {
    pub fn invalid(locator: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::InvalidLocator { locator: locator.into(), reason: reason.to_string() }
    }

    pub fn unavailable(locator: impl Into<String>, reason: impl ToString) -> Self {
        FetchError::SourceUnavailable { locator: locator.into(), reason: reason.to_string() }
    }
}

/// Upper bound for a downloaded artifact, in bytes.
pub(crate) fn max_artifact_bytes() -> u64 {
    std::env::var("KEEL_MAX_ARTIFACT_BYTES")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(100 * 1024 * 1024) // 100 MiB default
}

pub(crate) fn check_size(locator: &str, len: u64) -> Result<(), FetchError> {
    let max = max_artifact_bytes();
    if len > max {
        return Err(FetchError::unavailable(locator, format!("artifact too large ({} bytes, max {})", len, max)));
    }
    Ok(())
}

/// A parsed artifact locator. Strings without `://` are local paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    raw: String,
    scheme: String,
    url: Option<Url>,
}

impl Locator {
    pub fn parse(raw: &str) -> Result<Self, FetchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::invalid(raw, "empty locator"));
        }
        if !trimmed.contains("://") {
            return Ok(Self { raw: trimmed.to_string(), scheme: "file".into(), url: None });
        }
        let url = Url::parse(trimmed).map_err(|e| FetchError::invalid(raw, e))?;
        let scheme = url.scheme().to_ascii_lowercase();
        Ok(Self { raw: trimmed.to_string(), scheme, url: Some(url) })
    }

    pub fn as_str(&self) -> &str { &self.raw }
    pub fn scheme(&self) -> &str { &self.scheme }
    pub fn url(&self) -> Option<&Url> { self.url.as_ref() }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.raw) }
}

/// Scheme-specific artifact source. Each fetcher owns its transport
/// configuration, fixed at construction.
#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &'static str;
    fn provides(&self, scheme: &str) -> bool;
    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOptions {
    /// Relative paths are resolved below this directory when set.
    #[serde(default)]
    pub root_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOptions {
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Default for HttpOptions {
    fn default() -> Self { Self { timeout: default_timeout_secs(), insecure_skip_verify: false } }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciOptions {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Skip TLS verification against the registry.
    #[serde(default)]
    pub insecure: bool,
    /// Talk plain HTTP to the registry.
    #[serde(default)]
    pub plain_http: bool,
    #[serde(default = "default_oci_timeout_secs")]
    pub timeout: u64,
}

impl Default for OciOptions {
    fn default() -> Self {
        Self { username: None, password: None, insecure: false, plain_http: false, timeout: default_oci_timeout_secs() }
    }
}

fn default_timeout_secs() -> u64 { 5 }
fn default_oci_timeout_secs() -> u64 { 30 }

/// Transport configuration for every scheme, plus the registry used by
/// name/version lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    #[serde(default)]
    pub global_registry_url: Option<String>,
    #[serde(default)]
    pub file: FileOptions,
    #[serde(default)]
    pub http: HttpOptions,
    #[serde(default)]
    pub oci: OciOptions,
}

impl FetchOptions {
    /// Options used when no download configuration is supplied: short HTTP
    /// timeout, TLS verification off (in-cluster chart repos commonly use
    /// self-signed certificates).
    pub fn builtin() -> Self {
        Self { http: HttpOptions { timeout: 5, insecure_skip_verify: true }, ..Default::default() }
    }
}

pub struct ArtifactResolver {
    registry: Option<Url>,
    default: Box<dyn Fetcher>,
    fetchers: Vec<Box<dyn Fetcher>>,
}

impl ArtifactResolver {
    /// Resolver with the file (default), HTTP and OCI fetchers.
    pub fn new(opts: &FetchOptions) -> Result<Self, FetchError> {
        let registry = match opts.global_registry_url.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => Some(Url::parse(s).map_err(|e| FetchError::invalid(s, e))?),
            _ => None,
        };
        let default: Box<dyn Fetcher> = Box::new(FileFetcher::new(&opts.file));
        let fetchers: Vec<Box<dyn Fetcher>> = vec![Box::new(HttpFetcher::new(&opts.http)?), Box::new(OciFetcher::new(&opts.oci)?)];
        Ok(Self { registry, default, fetchers })
    }

    pub fn with_fetchers(default: Box<dyn Fetcher>, fetchers: Vec<Box<dyn Fetcher>>) -> Self {
        Self { registry: None, default, fetchers }
    }

    /// Fetcher that serves `locator`: the first whose `provides` matches, else the default.
    pub fn route(&self, locator: &Locator) -> &dyn Fetcher {
        self.fetchers
            .iter()
            .find(|f| f.provides(locator.scheme()))
            .map(|f| f.as_ref())
            .unwrap_or(self.default.as_ref())
    }

    pub async fn resolve(&self, locator: &str) -> Result<Vec<u8>, FetchError> {
        let t0 = Instant::now();
        let loc = Locator::parse(locator)?;
        let fetcher = self.route(&loc);
        debug!(locator = %loc, scheme = %loc.scheme(), fetcher = fetcher.name(), "resolving artifact");
        match fetcher.get(&loc).await {
            Ok(bytes) => {
                histogram!("fetch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                counter!("fetch_ok", 1u64);
                info!(locator = %loc, bytes = bytes.len(), took_ms = %t0.elapsed().as_millis(), "artifact fetched");
                Ok(bytes)
            }
            Err(e) => {
                counter!("fetch_err", 1u64);
                Err(e)
            }
        }
    }

    /// Build the locator for `name`/`version` below the global registry and resolve it:
    /// `<registry>/<name>:<version>` for OCI registries, `<registry>/<name>-<version>.tgz` otherwise.
    pub async fn resolve_by_name_version(&self, name: &str, version: &str) -> Result<Vec<u8>, FetchError> {
        let locator = self.locator_for(name, version)?;
        self.resolve(&locator).await
    }

    pub fn locator_for(&self, name: &str, version: &str) -> Result<String, FetchError> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| FetchError::invalid(format!("{}-{}", name, version), "no globalRegistryUrl configured"))?;
        let base = registry.as_str().trim_end_matches('/');
        if registry.scheme() == "oci" {
            Ok(format!("{}/{}:{}", base, name, version))
        } else {
            Ok(format!("{}/{}-{}.tgz", base, name, version))
        }
    }

    pub fn with_registry(mut self, registry: &str) -> Result<Self, FetchError> {
        self.registry = Some(Url::parse(registry).map_err(|e| FetchError::invalid(registry, e))?);
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        name: &'static str,
        schemes: &'static [&'static str],
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Fetcher for Recording {
        fn name(&self) -> &'static str { self.name }
        fn provides(&self, scheme: &str) -> bool { self.schemes.contains(&scheme) }
        async fn get(&self, locator: &Locator) -> Result<Vec<u8>, FetchError> {
            self.seen.lock().unwrap().push(format!("{}:{}", self.name, locator));
            Ok(self.name.as_bytes().to_vec())
        }
    }

    fn resolver(seen: &Arc<Mutex<Vec<String>>>) -> ArtifactResolver {
        let mk = |name: &'static str, schemes: &'static [&'static str]| -> Box<dyn Fetcher> { Box::new(Recording { name, schemes, seen: Arc::clone(seen) }) };
        ArtifactResolver::with_fetchers(mk("file", &["file"]), vec![mk("http", &["http", "https"]), mk("oci", &["oci"])])
    }

    #[tokio::test]
    async fn dispatches_by_scheme_and_defaults_to_file() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(&seen);
        assert_eq!(r.resolve("https://charts.example.com/a-1.0.0.tgz").await.unwrap(), b"http");
        assert_eq!(r.resolve("HTTP://charts.example.com/a.tgz").await.unwrap(), b"http");
        assert_eq!(r.resolve("oci://registry.example.com/charts/a:1.0.0").await.unwrap(), b"oci");
        assert_eq!(r.resolve("/charts/a-1.0.0.tgz").await.unwrap(), b"file");
        assert_eq!(r.resolve("relative/a.tgz").await.unwrap(), b"file");
        // unknown schemes fall back to the default fetcher
        assert_eq!(r.resolve("s3://bucket/a.tgz").await.unwrap(), b"file");
        assert_eq!(seen.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn malformed_locators_are_invalid() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let r = resolver(&seen);
        assert!(matches!(r.resolve("   ").await, Err(FetchError::InvalidLocator { .. })));
        assert!(matches!(r.resolve("http://[::1").await, Err(FetchError::InvalidLocator { .. })));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn name_version_locators_follow_registry_scheme() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let oci = resolver(&seen).with_registry("oci://hub.example.com/kse-extensions/").unwrap();
        assert_eq!(oci.locator_for("devops", "1.2.4").unwrap(), "oci://hub.example.com/kse-extensions/devops:1.2.4");
        let http = resolver(&seen).with_registry("https://charts.example.com/stable").unwrap();
        assert_eq!(http.locator_for("devops", "1.2.4").unwrap(), "https://charts.example.com/stable/devops-1.2.4.tgz");
        assert!(matches!(resolver(&seen).locator_for("devops", "1.2.4"), Err(FetchError::InvalidLocator { .. })));
    }
}
