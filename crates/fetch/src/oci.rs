//! OCI registry pulls of Helm charts (`oci://registry/repo/chart:tag`).
//!
//! Speaks the distribution API directly: fetch the manifest, pick the chart
//! layer, fetch and verify the blob. Anonymous access is tried first; a 401
//! with a `Bearer` challenge is answered with a token from the realm (using
//! the configured credentials, if any) and the request is retried once.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::{check_size, FetchError, Fetcher, Locator, OciOptions};

pub const HELM_CHART_LAYER: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    /// Tag, or `sha256:<hex>` digest.
    pub reference: String,
}

impl OciReference {
    pub fn parse(locator: &Locator) -> Result<Self, FetchError> {
        let url = locator.url().ok_or_else(|| FetchError::invalid(locator.as_str(), "not an oci:// URL"))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| FetchError::invalid(locator.as_str(), "missing registry host"))?;
        let registry = match url.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.to_string(),
        };
        let path = url.path().trim_matches('/');
        let (repository, reference) = match path.split_once('@') {
            Some((repo, digest)) => (repo.to_string(), digest.to_string()),
            None => {
                let (prefix, last) = match path.rsplit_once('/') {
                    Some((p, l)) => (Some(p), l),
                    None => (None, path),
                };
                match last.split_once(':') {
                    Some((name, tag)) => {
                        let repo = match prefix {
                            Some(p) => format!("{}/{}", p, name),
                            None => name.to_string(),
                        };
                        (repo, tag.to_string())
                    }
                    None => (path.to_string(), "latest".to_string()),
                }
            }
        };
        if repository.is_empty() || reference.is_empty() {
            return Err(FetchError::invalid(locator.as_str(), "expected oci://registry/repository[:tag|@digest]"));
        }
        Ok(Self { registry, repository, reference })
    }
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    layers: Vec<LayerDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayerDescriptor {
    media_type: String,
    digest: String,
    #[serde(default)]
    size: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Auth {
    Anonymous,
    Basic,
    Bearer(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer(BTreeMap<String, String>),
}

pub struct OciFetcher {
    client: reqwest::Client,
    plain_http: bool,
    username: Option<String>,
    password: Option<String>,
}

impl OciFetcher {
    pub fn new(opts: &OciOptions) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(opts.timeout.max(1)))
            .danger_accept_invalid_certs(opts.insecure)
            .build()
            .map_err(|e| FetchError::Transport { scheme: "oci", reason: e.to_string() })?;
        Ok(Self { client, plain_http: opts.plain_http, username: opts.username.clone(), password: opts.password.clone() })
    }

    fn base_url(&self, r: &OciReference) -> String {
        let scheme = if self.plain_http { "http" } else { "https" };
        format!("{}://{}/v2/{}", scheme, r.registry, r.repository)
    }

    async fn send(&self, url: &str, accept: &str, auth: &Auth) -> reqwest::Result<Response> {
        let req = self.client.get(url).header(ACCEPT, accept);
        let req = match auth {
            Auth::Bearer(token) => req.bearer_auth(token),
            Auth::Basic => match &self.username {
                Some(user) => req.basic_auth(user, self.password.as_ref()),
                None => req,
            },
            Auth::Anonymous => req,
        };
        req.send().await
    }

    async fn get_authorized(&self, url: &str, accept: &str, auth: &mut Auth, r: &OciReference, locator: &Locator) -> Result<Response, FetchError> {
        let resp = self.send(url, accept, auth).await.map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        if resp.status() != StatusCode::UNAUTHORIZED || *auth != Auth::Anonymous {
            return ensure_success(resp, locator);
        }
        let challenge = resp.headers().get(WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()).and_then(parse_challenge);
        *auth = match challenge {
            Some(Challenge::Bearer(params)) => Auth::Bearer(self.token(&params, r, locator).await?),
            Some(Challenge::Basic) if self.username.is_some() => Auth::Basic,
            _ => return Err(FetchError::unavailable(locator.as_str(), "registry requires authentication")),
        };
        debug!(registry = %r.registry, "retrying with credentials");
        let resp = self.send(url, accept, auth).await.map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        ensure_success(resp, locator)
    }

    async fn token(&self, params: &BTreeMap<String, String>, r: &OciReference, locator: &Locator) -> Result<String, FetchError> {
        let realm = params
            .get("realm")
            .ok_or_else(|| FetchError::unavailable(locator.as_str(), "bearer challenge without realm"))?;
        let mut url = Url::parse(realm).map_err(|e| FetchError::unavailable(locator.as_str(), format!("bad token realm: {}", e)))?;
        let scope = params.get("scope").cloned().unwrap_or_else(|| format!("repository:{}:pull", r.repository));
        {
            let mut q = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                q.append_pair("service", service);
            }
            q.append_pair("scope", &scope);
        }
        let mut req = self.client.get(url);
        if let Some(user) = &self.username {
            req = req.basic_auth(user, self.password.as_ref());
        }
        let resp = req.send().await.map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        let body: TokenResponse = ensure_success(resp, locator)?
            .json()
            .await
            .map_err(|e| FetchError::unavailable(locator.as_str(), format!("decoding token response: {}", e)))?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchError::unavailable(locator.as_str(), "token endpoint returned no token"))
    }
}

#[async_trait::async_trait]
impl Fetcher for OciFetcher {
    fn name(&self) -> &'static str { "oci" }

    fn provides(&self, scheme: &str) -> bool { scheme == "oci" }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, FetchError> {
        let r = OciReference::parse(locator)?;
        let base = self.base_url(&r);
        let mut auth = Auth::Anonymous;

        let manifest_url = format!("{}/manifests/{}", base, r.reference);
        let manifest: Manifest = self
            .get_authorized(&manifest_url, MANIFEST_ACCEPT, &mut auth, &r, locator)
            .await?
            .json()
            .await
            .map_err(|e| FetchError::unavailable(locator.as_str(), format!("decoding manifest: {}", e)))?;
        let layer = chart_layer(&manifest.layers)
            .ok_or_else(|| FetchError::unavailable(locator.as_str(), "manifest has no helm chart layer"))?
            .clone();
        check_size(locator.as_str(), layer.size)?;

        let blob_url = format!("{}/blobs/{}", base, layer.digest);
        let body = self
            .get_authorized(&blob_url, "application/octet-stream", &mut auth, &r, locator)
            .await?
            .bytes()
            .await
            .map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        check_size(locator.as_str(), body.len() as u64)?;
        verify_digest(&layer.digest, &body).map_err(|reason| FetchError::unavailable(locator.as_str(), reason))?;
        Ok(body.to_vec())
    }
}

fn ensure_success(resp: Response, locator: &Locator) -> Result<Response, FetchError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(FetchError::unavailable(locator.as_str(), format!("HTTP {} from {}", status, resp.url())))
    }
}

fn chart_layer(layers: &[LayerDescriptor]) -> Option<&LayerDescriptor> {
    layers
        .iter()
        .find(|l| l.media_type == HELM_CHART_LAYER)
        .or_else(|| if layers.len() == 1 { layers.first() } else { None })
}

fn verify_digest(expected: &str, body: &[u8]) -> Result<(), String> {
    match expected.split_once(':') {
        Some(("sha256", hex)) => {
            let got = format!("{:x}", Sha256::digest(body));
            if got.eq_ignore_ascii_case(hex) {
                Ok(())
            } else {
                Err(format!("digest mismatch: expected sha256:{}, got sha256:{}", hex, got))
            }
        }
        _ => {
            debug!(digest = %expected, "unsupported digest algorithm; skipping verification");
            Ok(())
        }
    }
}

fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
    if scheme.eq_ignore_ascii_case("basic") {
        Some(Challenge::Basic)
    } else if scheme.eq_ignore_ascii_case("bearer") {
        Some(Challenge::Bearer(parse_params(rest)))
    } else {
        None
    }
}

/// `key="value",key2=value2` with quoted values that may contain commas.
fn parse_params(s: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let mut chars = s.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.trim().is_empty() || chars.next() != Some('=') {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(n) = chars.next() {
                            value.push(n);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        out.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    fn oref(s: &str) -> OciReference { OciReference::parse(&Locator::parse(s).unwrap()).unwrap() }

    #[test]
    fn parses_tags_digests_and_ports() {
        let r = oref("oci://hub.kubesphere.com.cn/kse-extensions/whizard-monitoring:1.0.0-rc.4");
        assert_eq!(r.registry, "hub.kubesphere.com.cn");
        assert_eq!(r.repository, "kse-extensions/whizard-monitoring");
        assert_eq!(r.reference, "1.0.0-rc.4");

        let r = oref("oci://localhost:5000/charts/devops@sha256:abcd");
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "charts/devops");
        assert_eq!(r.reference, "sha256:abcd");

        assert_eq!(oref("oci://registry.example.com/devops").reference, "latest");
        assert!(OciReference::parse(&Locator::parse("oci://registry.example.com/").unwrap()).is_err());
    }

    #[test]
    fn parses_bearer_challenge_with_quoted_commas() {
        let c = parse_challenge(r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:charts/a:pull,push""#);
        let Some(Challenge::Bearer(p)) = c else { panic!("expected bearer challenge") };
        assert_eq!(p.get("realm").map(String::as_str), Some("https://auth.example.com/token"));
        assert_eq!(p.get("service").map(String::as_str), Some("registry.example.com"));
        assert_eq!(p.get("scope").map(String::as_str), Some("repository:charts/a:pull,push"));
        assert_eq!(parse_challenge("Basic realm=\"x\""), Some(Challenge::Basic));
        assert_eq!(parse_challenge("Negotiate"), None);
    }

    #[test]
    fn digest_verification_detects_mismatch() {
        let hex = format!("{:x}", Sha256::digest(b"abc"));
        assert!(verify_digest(&format!("sha256:{}", hex), b"abc").is_ok());
        assert!(verify_digest(&format!("sha256:{}", hex), b"abd").is_err());
        assert!(verify_digest("sha512:ffff", b"abc").is_ok());
    }

    async fn registry_with_chart(body: &'static [u8], advertised: &str) -> MockServer {
        let server = MockServer::start_async().await;
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": { "mediaType": "application/vnd.cncf.helm.config.v1+json", "digest": "sha256:00", "size": 2 },
            "layers": [ { "mediaType": HELM_CHART_LAYER, "digest": advertised, "size": body.len() } ]
        });
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/charts/demo/manifests/1.0.0");
                then.status(200).header("content-type", "application/vnd.oci.image.manifest.v1+json").json_body(manifest);
            })
            .await;
        let blob_path = format!("/v2/charts/demo/blobs/{}", advertised);
        server
            .mock_async(|when, then| {
                when.method(GET).path(blob_path);
                then.status(200).body(body);
            })
            .await;
        server
    }

    fn plain_fetcher() -> OciFetcher { OciFetcher::new(&OciOptions { plain_http: true, ..Default::default() }).unwrap() }

    #[tokio::test]
    async fn pulls_chart_layer_anonymously() {
        let digest = format!("sha256:{:x}", Sha256::digest(b"chart-bytes"));
        let server = registry_with_chart(b"chart-bytes", &digest).await;
        let loc = Locator::parse(&format!("oci://127.0.0.1:{}/charts/demo:1.0.0", server.address().port())).unwrap();
        assert_eq!(plain_fetcher().get(&loc).await.unwrap(), b"chart-bytes");
    }

    #[tokio::test]
    async fn rejects_blob_with_wrong_digest() {
        let digest = format!("sha256:{:x}", Sha256::digest(b"something-else"));
        let server = registry_with_chart(b"chart-bytes", &digest).await;
        let loc = Locator::parse(&format!("oci://127.0.0.1:{}/charts/demo:1.0.0", server.address().port())).unwrap();
        let err = plain_fetcher().get(&loc).await.unwrap_err();
        assert!(err.to_string().contains("digest mismatch"), "err={}", err);
    }

    /// Registry that answers unauthenticated pulls with a Bearer challenge
    /// and serves the chart only with `Bearer tok`.
    async fn token_protected_registry(body: &'static [u8]) -> MockServer {
        let server = MockServer::start_async().await;
        let digest = format!("sha256:{:x}", Sha256::digest(body));
        let challenge = format!("Bearer realm=\"{}\",service=\"registry\"", server.url("/token"));
        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "layers": [ { "mediaType": HELM_CHART_LAYER, "digest": digest, "size": body.len() } ]
        });
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/charts/demo/manifests/1.0.0").header_missing("authorization");
                then.status(401).header("www-authenticate", challenge);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/v2/charts/demo/manifests/1.0.0").header("authorization", "Bearer tok");
                then.status(200).header("content-type", "application/vnd.oci.image.manifest.v1+json").json_body(manifest);
            })
            .await;
        let blob_path = format!("/v2/charts/demo/blobs/{}", digest);
        server
            .mock_async(|when, then| {
                when.method(GET).path(blob_path).header("authorization", "Bearer tok");
                then.status(200).body(body);
            })
            .await;
        server
    }

    fn demo_locator(server: &MockServer) -> Locator {
        Locator::parse(&format!("oci://127.0.0.1:{}/charts/demo:1.0.0", server.address().port())).unwrap()
    }

    #[tokio::test]
    async fn bearer_challenge_fetches_anonymous_token_and_retries() {
        let server = token_protected_registry(b"chart-bytes").await;
        let token = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/token")
                    .query_param("service", "registry")
                    .query_param("scope", "repository:charts/demo:pull")
                    .header_missing("authorization");
                then.status(200).json_body(serde_json::json!({ "token": "tok" }));
            })
            .await;
        assert_eq!(plain_fetcher().get(&demo_locator(&server)).await.unwrap(), b"chart-bytes");
        // blob reuses the token from the manifest request
        token.assert_async().await;
    }

    #[tokio::test]
    async fn bearer_token_request_carries_basic_credentials() {
        let server = token_protected_registry(b"chart-bytes").await;
        let token = server
            .mock_async(|when, then| {
                when.method(GET).path("/token").header("authorization", "Basic dXNlcjpwdw==");
                then.status(200).json_body(serde_json::json!({ "access_token": "tok" }));
            })
            .await;
        let fetcher = OciFetcher::new(&OciOptions {
            plain_http: true,
            username: Some("user".into()),
            password: Some("pw".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(fetcher.get(&demo_locator(&server)).await.unwrap(), b"chart-bytes");
        token.assert_async().await;
    }

    #[tokio::test]
    async fn realm_without_token_is_unavailable() {
        let server = token_protected_registry(b"chart-bytes").await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/token");
                then.status(200).json_body(serde_json::json!({}));
            })
            .await;
        let err = plain_fetcher().get(&demo_locator(&server)).await.unwrap_err();
        assert!(matches!(&err, FetchError::SourceUnavailable { reason, .. } if reason.contains("no token")), "err={}", err);
    }
}
