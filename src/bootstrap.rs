//! Startup tasks that must succeed before the admission server can serve:
//! the TLS Secret and the CA bundle of the webhook configurations.

use anyhow::{Context, Result, anyhow};
use axum_server::tls_rustls::RustlsConfig;
use k8s_openapi::ByteString;
use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;
use rcgen::CertifiedKey;
use std::collections::BTreeMap;
use tracing::info;

static TLS_CERT_KEY: &str = "tls.crt";
static TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TlsMaterial {
    pub fn self_signed(dns_names: Vec<String>) -> Result<Self> {
        let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(dns_names)
            .context("Failed to generate self-signed certificate")?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let text = |key: &str| {
            data.get(key)
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
                .filter(|s| !s.is_empty())
        };
        Some(Self {
            cert_pem: text(TLS_CERT_KEY)?,
            key_pem: text(TLS_KEY_KEY)?,
        })
    }

    fn to_secret(&self, name: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::from([
                (TLS_CERT_KEY.to_string(), ByteString(self.cert_pem.clone().into_bytes())),
                (TLS_KEY_KEY.to_string(), ByteString(self.key_pem.clone().into_bytes())),
            ])),
            ..Default::default()
        }
    }

    pub async fn rustls_config(&self) -> Result<RustlsConfig> {
        RustlsConfig::from_pem(
            self.cert_pem.clone().into_bytes(),
            self.key_pem.clone().into_bytes(),
        )
        .await
        .context("Invalid admission TLS material")
    }
}

/// Service DNS names the admission certificate has to cover.
pub fn service_dns_names(service: &str, namespace: &str) -> Vec<String> {
    vec![
        service.to_string(),
        format!("{service}.{namespace}"),
        format!("{service}.{namespace}.svc"),
        format!("{service}.{namespace}.svc.cluster.local"),
    ]
}

/// Returns the TLS material stored in Secret `name`, creating the Secret with
/// a fresh self-signed certificate when it is missing or incomplete.
pub async fn ensure_tls_secret(
    client: Client,
    namespace: &str,
    name: &str,
    dns_names: Vec<String>,
) -> Result<TlsMaterial> {
    let secrets: Api<Secret> = Api::namespaced(client, namespace);
    let existing = secrets
        .get_opt(name)
        .await
        .with_context(|| format!("Failed to read secret {namespace}/{name}"))?;
    if let Some(material) = existing.as_ref().and_then(TlsMaterial::from_secret) {
        info!(secret = %name, "Using existing admission TLS secret");
        return Ok(material);
    }

    let material = TlsMaterial::self_signed(dns_names)?;
    let mut secret = material.to_secret(name);
    match existing {
        Some(existing) => {
            secret.metadata.resource_version = existing.metadata.resource_version;
            secrets
                .replace(name, &PostParams::default(), &secret)
                .await
                .with_context(|| format!("Failed to update secret {namespace}/{name}"))?;
        }
        None => {
            if let Err(e) = secrets.create(&PostParams::default(), &secret).await {
                // another replica may have created it first
                let raced = secrets.get_opt(name).await?;
                return raced
                    .as_ref()
                    .and_then(TlsMaterial::from_secret)
                    .ok_or_else(|| anyhow!("Failed to create secret {namespace}/{name}: {e}"));
            }
        }
    }
    info!(secret = %name, "Created admission TLS secret");
    Ok(material)
}

/// Points every webhook of the named configurations at `ca_pem`.
pub async fn inject_ca_bundle(client: Client, configuration: &str, ca_pem: &str) -> Result<()> {
    let bundle = ByteString(ca_pem.as_bytes().to_vec());

    let validating: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    if let Some(mut config) = validating.get_opt(configuration).await? {
        for webhook in config.webhooks.iter_mut().flatten() {
            webhook.client_config.ca_bundle = Some(bundle.clone());
        }
        validating
            .replace(configuration, &PostParams::default(), &config)
            .await
            .context("Failed to update validating webhook configuration")?;
        info!(configuration = %configuration, "Injected CA bundle into validating webhooks");
    }

    let mutating: Api<MutatingWebhookConfiguration> = Api::all(client);
    if let Some(mut config) = mutating.get_opt(configuration).await? {
        for webhook in config.webhooks.iter_mut().flatten() {
            webhook.client_config.ca_bundle = Some(bundle.clone());
        }
        mutating
            .replace(configuration, &PostParams::default(), &config)
            .await
            .context("Failed to update mutating webhook configuration")?;
        info!(configuration = %configuration, "Injected CA bundle into mutating webhooks");
    }
    Ok(())
}
