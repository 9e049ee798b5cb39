use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{ArtifactError, ArtifactResolver, Credentials, OciReference};

pub const DIGEST_HEADER: &str = "Docker-Content-Digest";

const MANIFEST_TYPES: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.docker.distribution.manifest.v2+json";

static CHALLENGE_PARAM: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(\w+)="([^"]*)""#).expect("static regex"));

/// `Bearer realm=..,service=..,scope=..` parameters of a 401 challenge.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn parse(header: &str) -> Option<Self> {
        let (scheme, params) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let mut out = BearerChallenge::default();
        for cap in CHALLENGE_PARAM.captures_iter(params) {
            let value = cap[2].to_string();
            match &cap[1] {
                "realm" => out.realm = value,
                "service" => out.service = Some(value),
                "scope" => out.scope = Some(value),
                _ => {}
            }
        }
        if out.realm.is_empty() { None } else { Some(out) }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Resolves tags to manifest digests with `HEAD /v2/<repo>/manifests/<tag>`.
#[derive(Debug, Clone)]
pub struct RegistryResolver {
    client: reqwest::Client,
}

impl RegistryResolver {
    pub fn new(timeout: Duration) -> Result<Self, ArtifactError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ArtifactError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn with_basic(req: RequestBuilder, creds: &Credentials) -> RequestBuilder {
        match creds.basic() {
            Some((u, p)) => req.basic_auth(u, Some(p)),
            None => req,
        }
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, creds: &Credentials) -> Result<String, ArtifactError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(s) = challenge.service.as_deref() {
            query.push(("service", s));
        }
        if let Some(s) = challenge.scope.as_deref() {
            query.push(("scope", s));
        }
        let req = Self::with_basic(self.client.get(&challenge.realm).query(&query), creds);
        let resp = req.send().await.map_err(|e| ArtifactError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ArtifactError::Auth(format!("token endpoint returned {}", resp.status())));
        }
        let body: TokenResponse = resp.json().await.map_err(|e| ArtifactError::Auth(format!("token response: {}", e)))?;
        body.token.or(body.access_token).ok_or_else(|| ArtifactError::Auth("token response carries no token".into()))
    }

    async fn head_manifest(&self, url: &str, auth: Auth<'_>) -> Result<reqwest::Response, ArtifactError> {
        let req = self.client.head(url).header(ACCEPT, MANIFEST_TYPES);
        let req = match auth {
            Auth::Basic(creds) => Self::with_basic(req, creds),
            Auth::Bearer(token) => req.bearer_auth(token),
        };
        req.send().await.map_err(|e| ArtifactError::Transport(e.to_string()))
    }
}

enum Auth<'a> {
    Basic(&'a Credentials),
    Bearer(&'a str),
}

fn digest_of(reference: &OciReference, resp: &reqwest::Response) -> Result<String, ArtifactError> {
    match resp.status() {
        s if s.is_success() => resp
            .headers()
            .get(DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or_else(|| ArtifactError::Registry { reference: reference.to_string(), message: "no digest in response".into() }),
        StatusCode::NOT_FOUND => Err(ArtifactError::NotFound(reference.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ArtifactError::Auth(format!("{}: {}", reference, resp.status()))),
        s => Err(ArtifactError::Registry { reference: reference.to_string(), message: s.to_string() }),
    }
}

#[async_trait]
impl ArtifactResolver for RegistryResolver {
    async fn resolve_digest(&self, reference: &str, creds: &Credentials) -> Result<String, ArtifactError> {
        let r: OciReference = reference.parse()?;
        if r.is_digest() {
            return Ok(r.reference);
        }
        let t0 = Instant::now();
        counter!("artifact_resolve_total", 1u64);
        let scheme = if creds.insecure { "http" } else { "https" };
        let url = format!("{}://{}/v2/{}/manifests/{}", scheme, r.registry, r.repository, r.reference);

        let mut resp = self.head_manifest(&url, Auth::Basic(creds)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            let challenge = resp.headers().get(WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()).and_then(BearerChallenge::parse);
            if let Some(challenge) = challenge {
                debug!(registry = %r.registry, realm = %challenge.realm, "registry requested a bearer token");
                let token = self.fetch_token(&challenge, creds).await?;
                resp = self.head_manifest(&url, Auth::Bearer(&token)).await?;
            }
        }
        let res = digest_of(&r, &resp);
        histogram!("artifact_resolve_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if res.is_err() {
            counter!("artifact_resolve_err_total", 1u64);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge() {
        let h = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:acme/app:pull,push""#;
        let c = BearerChallenge::parse(h).unwrap();
        assert_eq!(c.realm, "https://auth.example.com/token");
        assert_eq!(c.service.as_deref(), Some("registry.example.com"));
        assert_eq!(c.scope.as_deref(), Some("repository:acme/app:pull,push"));
        assert!(BearerChallenge::parse(r#"Basic realm="x""#).is_none());
        assert!(BearerChallenge::parse("Bearer service=\"x\"").is_none());
    }
}
