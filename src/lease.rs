//! Leadership over a coordination lease.
//!
//! One instance at a time may run the reconciler. The elector claims a
//! `Lease` object, renews it while the guarded task runs, and fails the task
//! if it cannot renew within the configured deadline so a standby can take
//! over.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

pub struct Elector {
    api: Api<Lease>,
    name: String,
    terms: Terms,
    renew_deadline: Duration,
    retry_period: Duration,
}

/// Who is claiming and for how long a grant holds.
#[derive(Clone, Debug)]
struct Terms {
    identity: String,
    lease_duration: Duration,
}

// === impl Elector ===

impl Elector {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        name: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
        renew_deadline: Duration,
        retry_period: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.into(),
            terms: Terms {
                identity: identity.into(),
                lease_duration,
            },
            renew_deadline,
            retry_period,
        }
    }

    /// Acquires the lease, then runs `task` while renewing in the
    /// background. Returns the task's result, or an error when leadership is
    /// lost first.
    pub async fn run<T>(&self, task: impl Future<Output = Result<T>>) -> Result<T> {
        self.acquire().await?;
        info!(lease = %self.name, identity = %self.terms.identity, "Acquired leadership");

        tokio::pin!(task);
        let mut last_renewed = time::Instant::now();
        let mut ticks = time::interval(self.retry_period);
        ticks.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = &mut task => return res,
                _ = ticks.tick() => match self.try_claim().await {
                    Ok(true) => last_renewed = time::Instant::now(),
                    Ok(false) => bail!("leadership lease {} was taken over", self.name),
                    Err(error) => {
                        if last_renewed.elapsed() > self.renew_deadline {
                            return Err(error).with_context(|| {
                                format!("failed to renew leadership lease {}", self.name)
                            });
                        }
                        warn!(lease = %self.name, ?error, "Could not renew leadership lease; retrying");
                    }
                },
            }
        }
    }

    async fn acquire(&self) -> Result<()> {
        loop {
            match self.try_claim().await {
                Ok(true) => return Ok(()),
                Ok(false) => debug!(lease = %self.name, "Lease is held elsewhere"),
                Err(error) => warn!(lease = %self.name, ?error, "Could not claim lease"),
            }
            time::sleep(self.retry_period).await;
        }
    }

    /// One claim attempt: creates the lease if absent, renews it if we hold
    /// it, and takes it over if the holder's grant has expired. `Ok(false)`
    /// means another live holder has it.
    async fn try_claim(&self) -> Result<bool> {
        let existing = match self.api.get(&self.name).await {
            Ok(lease) => Some(lease),
            Err(kube::Error::Api(response)) if response.code == 404 => None,
            Err(error) => {
                return Err(error).with_context(|| format!("failed to read lease {}", self.name))
            }
        };

        let now = MicroTime(Utc::now());
        match existing {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(self.terms.claim(&LeaseSpec::default(), now, true)),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Someone else created it first; they hold it for now.
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(error) => {
                        Err(error).with_context(|| format!("failed to create lease {}", self.name))
                    }
                }
            }
            Some(lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let held_by_us = self.terms.holds(&spec);
                if !held_by_us && !self.terms.expired(&spec, &now) {
                    return Ok(false);
                }

                let mut updated = lease;
                updated.spec = Some(self.terms.claim(&spec, now, !held_by_us));
                match self
                    .api
                    .replace(&self.name, &PostParams::default(), &updated)
                    .await
                {
                    Ok(_) => Ok(true),
                    // Lost the race to another claimant this round.
                    Err(kube::Error::Api(response)) if response.code == 409 => Ok(false),
                    Err(error) => {
                        Err(error).with_context(|| format!("failed to update lease {}", self.name))
                    }
                }
            }
        }
    }
}

// === impl Terms ===

impl Terms {
    fn holds(&self, spec: &LeaseSpec) -> bool {
        spec.holder_identity.as_deref() == Some(self.identity.as_str())
    }

    /// The spec recorded when this instance takes or renews the lease. A
    /// takeover restarts the acquire timestamp and bumps the transition
    /// counter.
    fn claim(&self, prior: &LeaseSpec, now: MicroTime, transition: bool) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: if transition {
                Some(now.clone())
            } else {
                prior.acquire_time.clone()
            },
            renew_time: Some(now),
            lease_transitions: Some(
                prior.lease_transitions.unwrap_or(0) + if transition { 1 } else { 0 },
            ),
        }
    }

    /// Whether the holder's grant has lapsed. Leases that were never stamped
    /// cannot be respected.
    fn expired(&self, spec: &LeaseSpec, now: &MicroTime) -> bool {
        let renewed = match spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) {
            Some(t) => t,
            None => return true,
        };
        let duration = spec
            .lease_duration_seconds
            .map(i64::from)
            .unwrap_or_else(|| self.lease_duration.as_secs() as i64);
        now.0.signed_duration_since(renewed.0).num_seconds() >= duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn terms() -> Terms {
        Terms {
            identity: "node-a".to_string(),
            lease_duration: Duration::from_secs(15),
        }
    }

    fn held_by(identity: &str, renewed_secs_ago: i64) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(Utc::now() - ChronoDuration::seconds(renewed_secs_ago))),
            lease_transitions: Some(3),
            ..LeaseSpec::default()
        }
    }

    #[test]
    fn a_live_grant_is_respected() {
        let now = MicroTime(Utc::now());
        assert!(!terms().expired(&held_by("node-b", 5), &now));
        assert!(terms().expired(&held_by("node-b", 20), &now));
    }

    #[test]
    fn an_unstamped_lease_is_up_for_grabs() {
        let now = MicroTime(Utc::now());
        assert!(terms().expired(&LeaseSpec::default(), &now));
    }

    #[test]
    fn a_takeover_restamps_and_counts_the_transition() {
        let now = MicroTime(Utc::now());
        let spec = terms().claim(&held_by("node-b", 20), now.clone(), true);
        assert_eq!(spec.holder_identity.as_deref(), Some("node-a"));
        assert_eq!(spec.acquire_time, Some(now.clone()));
        assert_eq!(spec.renew_time, Some(now));
        assert_eq!(spec.lease_transitions, Some(4));
    }

    #[test]
    fn a_renewal_keeps_the_acquire_stamp() {
        let acquired = MicroTime(Utc::now() - ChronoDuration::seconds(60));
        let prior = LeaseSpec {
            acquire_time: Some(acquired.clone()),
            ..held_by("node-a", 5)
        };
        let now = MicroTime(Utc::now());
        let spec = terms().claim(&prior, now.clone(), false);
        assert_eq!(spec.acquire_time, Some(acquired));
        assert_eq!(spec.renew_time, Some(now));
        assert_eq!(spec.lease_transitions, Some(3));
    }
}
