use std::fmt;

pub const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

/// A normalized image reference. Short names such as `centos:7` expand to
/// `docker.io/library/centos:7`; a reference carries a tag, a digest or both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    MissingRepository,
    InvalidDigest(String),
    InvalidFormat(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Empty => write!(f, "image reference is empty"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidDigest(digest) => write!(f, "invalid digest: {}", digest),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl ImageReference {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseError::Empty);
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_ascii_uppercase()) {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => {
                validate_digest(digest)?;
                (rest, Some(digest.to_string()))
            }
            None => (s, None),
        };

        // a colon after the last slash separates the tag
        let last_slash = rest.rfind('/');
        let (name, tag) = match rest.rfind(':') {
            Some(pos) if last_slash.is_none_or(|slash| pos > slash) => {
                (&rest[..pos], Some(rest[pos + 1..].to_string()))
            }
            _ => (rest, None),
        };
        if tag.as_deref() == Some("") {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        // the first component is a registry only if it looks like a host
        let (registry, repository) = match name.split_once('/') {
            Some((first, remainder))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), remainder.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        if repository.is_empty() || repository.split('/').any(str::is_empty) {
            return Err(ParseError::MissingRepository);
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The tag or digest used to address the manifest, digest first.
    pub fn reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// The same repository pinned to `digest`, dropping the tag.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }
}

fn validate_digest(digest: &str) -> Result<(), ParseError> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(ParseError::InvalidDigest(digest.to_string()));
    };
    if algorithm.is_empty() || hex.len() < 32 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:3b1ed4b9a0b5e0a2a4b2b7d3d0a6d5c1e7f2a3b4c5d6e7f8a9b0c1d2e3f4a5b6";

    #[test]
    fn test_parse_short_name() {
        let r = ImageReference::parse("centos:7").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/centos");
        assert_eq!(r.tag.as_deref(), Some("7"));
        assert_eq!(r.to_string(), "docker.io/library/centos:7");
    }

    #[test]
    fn test_parse_defaults_to_latest() {
        let r = ImageReference::parse("myrepo/app").unwrap();
        assert_eq!(r.repository, "myrepo/app");
        assert_eq!(r.tag.as_deref(), Some("latest"));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/ns/app:v1").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "ns/app");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("quay.io/org/app@{}", DIGEST)).unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
        assert_eq!(r.reference(), DIGEST);
    }

    #[test]
    fn test_with_digest_drops_tag() {
        let r = ImageReference::parse("quay.io/org/app:v2").unwrap();
        assert_eq!(
            r.with_digest(DIGEST).to_string(),
            format!("quay.io/org/app@{}", DIGEST)
        );
    }

    #[test]
    fn test_docker_hub_short_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.to_string(), "docker.io/library/nginx:latest");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(ImageReference::parse(""), Err(ParseError::Empty));
        assert!(matches!(
            ImageReference::parse("app@sha256:zz"),
            Err(ParseError::InvalidDigest(_))
        ));
        assert!(matches!(
            ImageReference::parse("app:"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            ImageReference::parse("Upper/Case"),
            Err(ParseError::InvalidFormat(_))
        ));
        assert_eq!(
            ImageReference::parse("quay.io/"),
            Err(ParseError::MissingRepository)
        );
    }
}
