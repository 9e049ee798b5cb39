use std::collections::BTreeMap;

use base64::Engine as _;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::ArtifactError;

/// Registry access settings for one resolution.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    /// Talk plain HTTP to the registry.
    pub insecure: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuth>,
}

#[derive(Debug, Deserialize)]
struct DockerAuth {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

fn host_of(key: &str) -> &str {
    let key = key.strip_prefix("https://").or_else(|| key.strip_prefix("http://")).unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}

impl Credentials {
    pub fn anonymous(insecure: bool) -> Self { Self { insecure, ..Default::default() } }

    pub fn basic(&self) -> Option<(&str, &str)> {
        Some((self.username.as_deref()?, self.password.as_deref().unwrap_or("")))
    }

    /// Credentials for `registry` out of a `.dockerconfigjson` document. Anonymous when absent.
    pub fn from_docker_config(raw: &[u8], registry: &str, insecure: bool) -> Result<Self, ArtifactError> {
        let cfg: DockerConfig = serde_json::from_slice(raw).map_err(|e| ArtifactError::Credentials(format!("dockerconfigjson: {}", e)))?;
        let Some(entry) = cfg.auths.iter().find(|(k, _)| host_of(k) == registry).map(|(_, v)| v) else {
            return Ok(Self::anonymous(insecure));
        };
        if let (Some(u), Some(p)) = (&entry.username, &entry.password) {
            return Ok(Self { username: Some(u.clone()), password: Some(p.clone()), insecure });
        }
        let auth = entry.auth.as_deref().ok_or_else(|| ArtifactError::Credentials(format!("no auth for {}", registry)))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(auth.trim())
            .map_err(|e| ArtifactError::Credentials(format!("auth for {}: {}", registry, e)))?;
        let decoded = String::from_utf8(decoded).map_err(|e| ArtifactError::Credentials(e.to_string()))?;
        let (u, p) = decoded.split_once(':').ok_or_else(|| ArtifactError::Credentials(format!("auth for {} is not user:password", registry)))?;
        Ok(Self { username: Some(u.to_string()), password: Some(p.to_string()), insecure })
    }

    /// Read a `kubernetes.io/dockerconfigjson` Secret document.
    pub fn from_secret(secret: &Json, registry: &str, insecure: bool) -> Result<Self, ArtifactError> {
        let data = secret
            .get("data")
            .and_then(|d| d.get(".dockerconfigjson"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ArtifactError::Credentials("secret has no .dockerconfigjson".into()))?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| ArtifactError::Credentials(format!(".dockerconfigjson: {}", e)))?;
        Self::from_docker_config(&raw, registry, insecure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b64(s: &str) -> String { base64::engine::general_purpose::STANDARD.encode(s) }

    #[test]
    fn decodes_auth_field_for_matching_registry() {
        let cfg = json!({ "auths": { "https://ghcr.io": { "auth": b64("bot:s3cret") } } }).to_string();
        let c = Credentials::from_docker_config(cfg.as_bytes(), "ghcr.io", false).unwrap();
        assert_eq!(c.basic(), Some(("bot", "s3cret")));
        let other = Credentials::from_docker_config(cfg.as_bytes(), "quay.io", true).unwrap();
        assert_eq!(other, Credentials::anonymous(true));
    }

    #[test]
    fn reads_secret_and_redacts_debug() {
        let cfg = json!({ "auths": { "ghcr.io": { "username": "u", "password": "p" } } }).to_string();
        let secret = json!({ "type": "kubernetes.io/dockerconfigjson", "data": { ".dockerconfigjson": b64(&cfg) } });
        let c = Credentials::from_secret(&secret, "ghcr.io", false).unwrap();
        assert_eq!(c.basic(), Some(("u", "p")));
        assert!(!format!("{:?}", c).contains("\"p\""));
        assert!(Credentials::from_secret(&json!({ "data": {} }), "ghcr.io", false).is_err());
    }
}
