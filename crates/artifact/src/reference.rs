use std::fmt;
use std::str::FromStr;

use crate::ArtifactError;

const DOCKER_HUB: &str = "registry-1.docker.io";

/// `[oci://]registry/repository[:tag|@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OciReference {
    pub registry: String,
    pub repository: String,
    /// Tag or `sha256:...` digest.
    pub reference: String,
}

impl OciReference {
    pub fn is_digest(&self) -> bool { self.reference.contains(':') }
}

impl FromStr for OciReference {
    type Err = ArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| ArtifactError::InvalidReference(format!("{}: {}", s, why));
        let rest = s.strip_prefix("oci://").unwrap_or(s);
        if rest.is_empty() {
            return Err(invalid("empty reference"));
        }
        let (registry, path) = match rest.split_once('/') {
            Some((first, path)) if first.contains('.') || first.contains(':') || first == "localhost" => (first.to_string(), path),
            _ => (DOCKER_HUB.to_string(), rest),
        };
        let (repository, reference) = if let Some((repo, digest)) = path.split_once('@') {
            (repo, digest.to_string())
        } else {
            match path.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo, tag.to_string()),
                _ => (path, "latest".to_string()),
            }
        };
        if repository.is_empty() || reference.is_empty() {
            return Err(invalid("missing repository or tag"));
        }
        let repository = if registry == DOCKER_HUB && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        };
        Ok(Self { registry, repository, reference })
    }
}

impl fmt::Display for OciReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = if self.is_digest() { '@' } else { ':' };
        write!(f, "{}/{}{}{}", self.registry, self.repository, sep, self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_registry_repository_and_tag() {
        let r: OciReference = "oci://ghcr.io/acme/platform:1.2.0".parse().unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "acme/platform");
        assert_eq!(r.reference, "1.2.0");
        assert!(!r.is_digest());
    }

    #[test]
    fn registry_with_port_and_default_tag() {
        let r: OciReference = "localhost:5000/team/app".parse().unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn digest_references_and_docker_hub() {
        let r: OciReference = "oci://ghcr.io/acme/app@sha256:abc".parse().unwrap();
        assert!(r.is_digest());
        assert_eq!(r.to_string(), "ghcr.io/acme/app@sha256:abc");

        let r: OciReference = "nginx:1.25".parse().unwrap();
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn rejects_empty() {
        assert!("oci://".parse::<OciReference>().is_err());
    }
}
