//! Leader election on a `coordination.k8s.io/v1` Lease. Leadership is
//! published on a watch channel that mutating controllers gate on.

use crate::error::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::coordination::v1::Lease;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The fields of a Lease spec the elector reads and writes. Times go through
/// RFC 3339 so the record does not depend on the API time types.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    holder_identity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_duration_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    acquire_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    renew_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    lease_transitions: Option<i32>,
}

impl LeaseRecord {
    fn expired(&self, now: DateTime<Utc>, default_duration: ChronoDuration) -> bool {
        let duration = self
            .lease_duration_seconds
            .map_or(default_duration, |s| ChronoDuration::seconds(s.into()));
        self.renew_time.is_none_or(|renewed| renewed + duration < now)
    }

    /// The record to write for `identity` to hold the lease at `now`, or
    /// `None` while another holder's lease is still valid.
    fn claim(&self, identity: &str, now: DateTime<Utc>, duration: ChronoDuration) -> Option<Self> {
        let seconds = i32::try_from(duration.num_seconds()).unwrap_or(i32::MAX);
        if self.holder_identity.as_deref() == Some(identity) {
            return Some(Self {
                renew_time: Some(now),
                lease_duration_seconds: Some(seconds),
                ..self.clone()
            });
        }
        let vacant = self.holder_identity.as_deref().is_none_or(str::is_empty);
        if !vacant && !self.expired(now, duration) {
            return None;
        }
        Some(Self {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(seconds),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: Some(self.lease_transitions.unwrap_or(0) + i32::from(!vacant)),
        })
    }
}

fn micros(now: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

#[derive(Debug, Clone)]
pub struct LeaderElectionSettings {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub retry_period: Duration,
}

pub struct LeaderElector {
    api: Api<Lease>,
    settings: LeaderElectionSettings,
}

impl LeaderElector {
    pub fn new(client: Client, settings: LeaderElectionSettings) -> Self {
        Self {
            api: Api::namespaced(client, &settings.namespace),
            settings,
        }
    }

    fn duration(&self) -> ChronoDuration {
        ChronoDuration::from_std(self.settings.lease_duration).unwrap_or(ChronoDuration::seconds(15))
    }

    fn lease(&self, resource_version: Option<String>, record: &LeaseRecord) -> Result<Lease> {
        Ok(serde_json::from_value(json!({
            "metadata": {
                "name": self.settings.lease_name,
                "namespace": self.settings.namespace,
                "resourceVersion": resource_version,
            },
            "spec": record,
        }))?)
    }

    /// One election round. Returns whether this replica holds the lease.
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = micros(Utc::now());
        let identity = &self.settings.identity;
        let Some(existing) = self.api.get_opt(&self.settings.lease_name).await? else {
            let record = LeaseRecord::default()
                .claim(identity, now, self.duration())
                .unwrap_or_default();
            self.api
                .create(&PostParams::default(), &self.lease(None, &record)?)
                .await?;
            return Ok(true);
        };

        let current: LeaseRecord = match &existing.spec {
            Some(spec) => serde_json::from_value(serde_json::to_value(spec)?)?,
            None => LeaseRecord::default(),
        };
        let Some(record) = current.claim(identity, now, self.duration()) else {
            debug!(holder = ?current.holder_identity, "Lease held by another replica");
            return Ok(false);
        };
        let lease = self.lease(existing.resource_version(), &record)?;
        match self
            .api
            .replace(&self.settings.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                // lost a race with another replica writing the same lease
                debug!(error = %e, "Unable to update lease");
                Ok(false)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(existing) = self.api.get_opt(&self.settings.lease_name).await? else {
            return Ok(());
        };
        let lease = self.lease(
            existing.resource_version(),
            &LeaseRecord {
                lease_duration_seconds: Some(1),
                renew_time: Some(micros(Utc::now())),
                ..Default::default()
            },
        )?;
        self.api
            .replace(&self.settings.lease_name, &PostParams::default(), &lease)
            .await?;
        Ok(())
    }

    /// Campaigns until `token` is cancelled, publishing leadership on `leader`.
    /// Releases the lease on shutdown if held.
    pub async fn run(self, leader: watch::Sender<bool>, token: CancellationToken) {
        let identity = self.settings.identity.clone();
        info!(identity = %identity, lease = %self.settings.lease_name, "Starting leader election");
        let mut last_renewed: Option<Instant> = None;
        loop {
            let leading = match self.try_acquire_or_renew().await {
                Ok(true) => {
                    last_renewed = Some(Instant::now());
                    true
                }
                Ok(false) => false,
                Err(e) => {
                    warn!(error = %e, "Leader election round failed");
                    // keep leading while the last renewal is still valid
                    last_renewed.is_some_and(|at| at.elapsed() < self.settings.lease_duration)
                }
            };
            if !leading {
                last_renewed = None;
            }
            leader.send_if_modified(|current| {
                let changed = *current != leading;
                if changed {
                    info!(identity = %identity, leading, "Leadership changed");
                }
                *current = leading;
                changed
            });

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.retry_period) => {}
            }
        }

        if *leader.borrow() {
            leader.send_replace(false);
            if let Err(e) = self.release().await {
                warn!(error = %e, "Unable to release lease");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).unwrap()
    }

    #[test]
    fn test_claim_vacant_lease() {
        let record = LeaseRecord::default()
            .claim("a", at(0), ChronoDuration::seconds(15))
            .unwrap();
        assert_eq!(record.holder_identity.as_deref(), Some("a"));
        assert_eq!(record.lease_transitions, Some(0));
        assert_eq!(record.lease_duration_seconds, Some(15));
    }

    #[test]
    fn test_valid_lease_of_other_holder_is_respected() {
        let held = LeaseRecord::default()
            .claim("a", at(0), ChronoDuration::seconds(15))
            .unwrap();
        assert!(held.claim("b", at(10), ChronoDuration::seconds(15)).is_none());

        let taken = held.claim("b", at(16), ChronoDuration::seconds(15)).unwrap();
        assert_eq!(taken.holder_identity.as_deref(), Some("b"));
        assert_eq!(taken.lease_transitions, Some(1));
        assert_eq!(taken.acquire_time, Some(at(16)));
    }

    #[test]
    fn test_holder_renews() {
        let held = LeaseRecord::default()
            .claim("a", at(0), ChronoDuration::seconds(15))
            .unwrap();
        let renewed = held.claim("a", at(10), ChronoDuration::seconds(15)).unwrap();
        assert_eq!(renewed.acquire_time, Some(at(0)));
        assert_eq!(renewed.renew_time, Some(at(10)));
        assert_eq!(renewed.lease_transitions, Some(0));
    }

    #[test]
    fn test_record_reads_api_timestamps() {
        let record: LeaseRecord = serde_json::from_value(json!({
            "holderIdentity": "a",
            "leaseDurationSeconds": 15,
            "renewTime": "2023-11-14T22:13:20.000000Z",
        }))
        .unwrap();
        assert_eq!(record.renew_time, Some(at(0)));
    }
}
