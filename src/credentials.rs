use crate::error::Result;
use crate::registry::Mirror;
use crate::secret_string::SecretString;
use crate::store::SharedStore;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use tracing::warn;

static DOCKER_CONFIG_JSON_TYPE: &str = "kubernetes.io/dockerconfigjson";
static DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";

/// One credential set for a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum RegistryAuth {
    Anonymous,
    Basic {
        username: String,
        password: SecretString,
    },
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryAuth::Anonymous => write!(f, "anonymous"),
            RegistryAuth::Basic { username, .. } => write!(f, "basic({})", username),
        }
    }
}

impl RegistryAuth {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        RegistryAuth::Basic {
            username: username.into(),
            password: SecretString::new(password),
        }
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

impl DockerAuthEntry {
    fn credentials(&self) -> Option<RegistryAuth> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Some(RegistryAuth::basic(username, password));
        }
        let decoded = STANDARD.decode(self.auth.as_deref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(RegistryAuth::basic(username, password))
    }
}

/// Strips scheme and path so `https://index.docker.io/v1/` matches `index.docker.io`.
fn normalize_host(host: &str) -> &str {
    let host = host
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    host.split('/').next().unwrap_or(host)
}

fn host_matches(entry: &str, registry: &str) -> bool {
    let entry = normalize_host(entry);
    if entry == registry {
        return true;
    }
    let docker_hub = ["docker.io", "index.docker.io", "registry-1.docker.io"];
    docker_hub.contains(&entry) && docker_hub.contains(&registry)
}

/// Credentials for `registry` found in a docker config JSON document.
pub fn parse_docker_config(data: &[u8], registry: &str) -> serde_json::Result<Vec<RegistryAuth>> {
    let config: DockerConfig = serde_json::from_slice(data)?;
    let mut entries: Vec<_> = config
        .auths
        .iter()
        .filter(|(host, _)| host_matches(host, registry))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    Ok(entries
        .into_iter()
        .filter_map(|(_, entry)| entry.credentials())
        .collect())
}

/// Ordered credential sets for `registry`: every matching pull secret (by
/// secret name), then anonymous access.
pub fn credentials_for(secrets: &[Secret], registry: &str) -> Vec<RegistryAuth> {
    let mut secrets: Vec<&Secret> = secrets
        .iter()
        .filter(|s| s.type_.as_deref() == Some(DOCKER_CONFIG_JSON_TYPE))
        .collect();
    secrets.sort_by_key(|s| s.name_any());

    let mut credentials = Vec::new();
    for secret in secrets {
        let Some(data) = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DOCKER_CONFIG_JSON_KEY))
        else {
            continue;
        };
        match parse_docker_config(&data.0, registry) {
            Ok(found) => {
                for auth in found {
                    if !credentials.contains(&auth) {
                        credentials.push(auth);
                    }
                }
            }
            Err(e) => warn!(
                secret = %secret.name_any(),
                error = %e,
                "Ignoring malformed docker config secret"
            ),
        }
    }
    credentials.push(RegistryAuth::Anonymous);
    credentials
}

/// Credential sets available to a namespace: mirror credentials when the
/// registry is the mirror, then the namespace pull secrets, then anonymous.
#[derive(Clone)]
pub struct NamespaceCredentials {
    secrets: SharedStore<Secret>,
    mirror: Option<Mirror>,
}

impl NamespaceCredentials {
    pub fn new(secrets: SharedStore<Secret>, mirror: Option<Mirror>) -> Self {
        Self { secrets, mirror }
    }

    pub async fn for_registry(&self, namespace: &str, registry: &str) -> Result<Vec<RegistryAuth>> {
        let secrets = self.secrets.list(Some(namespace), None).await?;
        let mut credentials = credentials_for(&secrets, registry);
        if let Some(auth) = self
            .mirror
            .as_ref()
            .and_then(|m| m.credentials_for(registry))
        {
            credentials.retain(|c| *c != auth);
            credentials.insert(0, auth);
        }
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(name: &str, config: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some(DOCKER_CONFIG_JSON_TYPE.to_string()),
            data: Some(BTreeMap::from([(
                DOCKER_CONFIG_JSON_KEY.to_string(),
                ByteString(config.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_auth_field() {
        let auth = STANDARD.encode("user:pa:ss");
        let config = format!(r#"{{"auths":{{"quay.io":{{"auth":"{}"}}}}}}"#, auth);
        let found = parse_docker_config(config.as_bytes(), "quay.io").unwrap();
        assert_eq!(found, vec![RegistryAuth::basic("user", "pa:ss")]);
    }

    #[test]
    fn test_docker_hub_aliases() {
        let config = r#"{"auths":{"https://index.docker.io/v1/":{"username":"u","password":"p"}}}"#;
        let found = parse_docker_config(config.as_bytes(), "docker.io").unwrap();
        assert_eq!(found, vec![RegistryAuth::basic("u", "p")]);
    }

    #[test]
    fn test_credentials_order_ends_anonymous() {
        let secrets = vec![
            secret(
                "b-pull",
                r#"{"auths":{"quay.io":{"username":"second","password":"x"}}}"#,
            ),
            secret(
                "a-pull",
                r#"{"auths":{"quay.io":{"username":"first","password":"x"}}}"#,
            ),
            secret("other", r#"{"auths":{"ghcr.io":{"username":"nope","password":"x"}}}"#),
            secret("broken", "not json"),
        ];
        let credentials = credentials_for(&secrets, "quay.io");
        assert_eq!(
            credentials,
            vec![
                RegistryAuth::basic("first", "x"),
                RegistryAuth::basic("second", "x"),
                RegistryAuth::Anonymous,
            ]
        );
    }

    #[tokio::test]
    async fn test_namespace_credentials_prefer_mirror() {
        use crate::registry::testing::FakeRegistry;
        use crate::store::memory::MemoryStore;
        use std::sync::Arc;

        let mut pull = secret(
            "pull",
            r#"{"auths":{"mirror.local":{"username":"team","password":"x"}}}"#,
        );
        pull.metadata.namespace = Some("team".to_string());
        let secrets = Arc::new(MemoryStore::with([pull]));
        let mirror = Mirror::new(
            Arc::new(FakeRegistry::default()),
            "mirror.local",
            RegistryAuth::basic("tagger", "pw"),
            false,
        );
        let credentials = NamespaceCredentials::new(secrets, Some(mirror));

        assert_eq!(
            credentials.for_registry("team", "mirror.local").await.unwrap(),
            vec![
                RegistryAuth::basic("tagger", "pw"),
                RegistryAuth::basic("team", "x"),
                RegistryAuth::Anonymous,
            ]
        );
        assert_eq!(
            credentials.for_registry("other", "mirror.local").await.unwrap(),
            vec![RegistryAuth::basic("tagger", "pw"), RegistryAuth::Anonymous]
        );
    }

    #[test]
    fn test_debug_hides_password() {
        let auth = RegistryAuth::basic("user", "secret");
        assert_eq!(format!("{:?}", auth), "basic(user)");
    }
}
