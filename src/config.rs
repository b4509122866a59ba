use crate::controller::ControllerOptions;
use crate::secret_string::SecretString;
use crate::transfer::Keepalive;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub webserver: Webserver,
    pub admission: Admission,
    #[serde(default)]
    pub transfer: Transfer,
    #[serde(default)]
    pub mirror: Option<MirrorRegistry>,
    #[serde(default)]
    pub controllers: Controllers,
    pub leader_election: LeaderElection,
    #[serde(default)]
    pub import_gc: ImportGc,
    /// Extra CA certificates trusted when talking to registries
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub port: u16,
    /// Service in front of the admission server, used for the certificate names
    pub service: String,
    pub namespace: String,
    pub tls_secret: String,
    /// Validating and mutating webhook configurations to inject the CA bundle into
    #[serde(default)]
    pub webhook_configuration: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    pub port: u16,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_max_connection_age")]
    pub max_connection_age_seconds: u64,
    #[serde(default = "default_max_connection_age_grace")]
    pub max_connection_age_grace_seconds: u64,
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_max_connection_age() -> u64 {
    20 * 60
}

fn default_max_connection_age_grace() -> u64 {
    60
}

impl Default for Transfer {
    fn default() -> Self {
        Self {
            port: 8090,
            idle_timeout_seconds: default_idle_timeout(),
            max_connection_age_seconds: default_max_connection_age(),
            max_connection_age_grace_seconds: default_max_connection_age_grace(),
        }
    }
}

impl Transfer {
    pub fn keepalive(&self) -> Keepalive {
        Keepalive {
            idle: Duration::from_secs(self.idle_timeout_seconds),
            max_age: Duration::from_secs(self.max_connection_age_seconds),
            grace: Duration::from_secs(self.max_connection_age_grace_seconds),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MirrorRegistry {
    pub address: String,
    pub username: Option<String>,
    #[serde(default)]
    pub password: SecretString,
    #[serde(default)]
    pub insecure: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerSettings {
    pub tokens: usize,
    pub timeout_seconds: u64,
}

impl ControllerSettings {
    const fn new(tokens: usize, timeout_seconds: u64) -> Self {
        Self {
            tokens,
            timeout_seconds,
        }
    }

    pub fn options(&self) -> ControllerOptions {
        ControllerOptions::new(self.tokens, Duration::from_secs(self.timeout_seconds))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Controllers {
    pub tag: ControllerSettings,
    pub image_import: ControllerSettings,
    pub deployment: ControllerSettings,
    pub pod: ControllerSettings,
    pub build_run: ControllerSettings,
    /// Watch Shipwright BuildRuns, requires the Shipwright CRDs
    pub watch_build_runs: bool,
}

impl Default for Controllers {
    fn default() -> Self {
        Self {
            tag: ControllerSettings::new(5, 60),
            image_import: ControllerSettings::new(10, 180),
            deployment: ControllerSettings::new(2, 60),
            pod: ControllerSettings::new(5, 5),
            build_run: ControllerSettings::new(2, 60),
            watch_build_runs: false,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub lease_name: String,
    pub namespace: String,
    /// Defaults to the pod hostname
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: u64,
    #[serde(default = "default_retry_period")]
    pub retry_period_seconds: u64,
}

fn default_true() -> bool {
    true
}

fn default_lease_duration() -> u64 {
    15
}

fn default_retry_period() -> u64 {
    5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImportGc {
    /// How long a consumed ImageImport is kept
    pub grace_seconds: u64,
    pub interval_seconds: u64,
}

impl Default for ImportGc {
    fn default() -> Self {
        Self {
            grace_seconds: 5 * 60,
            interval_seconds: 60,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing variable.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });
    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
