//! Opt-in leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only the lease holder drives the fabric. A replica waits in `acquire` until the
//! lease is free or expired, then renews it from `hold`, which returns once the
//! lease is lost.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

const DEFAULT_LEASE_NAME: &str = "weft-controller";
const DEFAULT_LEASE_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
}

impl LeaderConfig {
    /// From `WEFT_LEADER_ELECTION`, `WEFT_LEADER_LEASE`, `WEFT_LEASE_DURATION_SECS`
    /// and `WEFT_LEADER_IDENTITY` (falling back to `HOSTNAME`).
    pub fn from_env(namespace: &str) -> Self {
        Self::from_lookup(namespace, |k| std::env::var(k).ok())
    }

    fn from_lookup(namespace: &str, get: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = get("WEFT_LEADER_ELECTION")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let lease_duration = get("WEFT_LEASE_DURATION_SECS")
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_LEASE_SECS);
        let identity = get("WEFT_LEADER_IDENTITY")
            .or_else(|| get("HOSTNAME"))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("weftctl-{}", std::process::id()));
        Self {
            enabled,
            lease_name: get("WEFT_LEADER_LEASE").unwrap_or_else(|| DEFAULT_LEASE_NAME.to_string()),
            namespace: namespace.to_string(),
            identity,
            lease_duration: Duration::from_secs(lease_duration),
        }
    }
}

/// Whether `identity` may take or renew a lease described by `spec` at `now`.
pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else { return true };
    match spec.holder_identity.as_deref() {
        None | Some("") => return true,
        Some(holder) if holder == identity => return true,
        _ => {}
    }
    let duration = chrono::Duration::seconds(i64::from(spec.lease_duration_seconds.unwrap_or(0)));
    match &spec.renew_time {
        Some(MicroTime(renewed)) => *renewed + duration < now,
        None => true,
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

pub struct LeaderElector {
    api: Api<Lease>,
    cfg: LeaderConfig,
}

impl LeaderElector {
    pub fn new(client: Client, cfg: LeaderConfig) -> Self {
        Self { api: Api::namespaced(client, &cfg.namespace), cfg }
    }

    pub fn identity(&self) -> &str { &self.cfg.identity }

    fn renew_every(&self) -> Duration { (self.cfg.lease_duration / 3).max(Duration::from_secs(1)) }

    fn claim(&self, prev: Option<&LeaseSpec>, now: DateTime<Utc>) -> LeaseSpec {
        let held = prev.and_then(|s| s.holder_identity.as_deref()) == Some(self.cfg.identity.as_str());
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
        LeaseSpec {
            holder_identity: Some(self.cfg.identity.clone()),
            lease_duration_seconds: Some(i32::try_from(self.cfg.lease_duration.as_secs()).unwrap_or(i32::MAX)),
            acquire_time: if held { prev.and_then(|s| s.acquire_time.clone()) } else { Some(MicroTime(now)) },
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(if held { transitions } else { transitions.saturating_add(1) }),
            ..Default::default()
        }
    }

    /// One acquire-or-renew attempt. A write conflict means another replica won.
    pub async fn try_acquire(&self) -> Result<bool> {
        let now = Utc::now();
        let name = self.cfg.lease_name.as_str();
        let pp = PostParams::default();
        let res = match self.api.get_opt(name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some(self.cfg.namespace.clone()), ..Default::default() },
                    spec: Some(self.claim(None, now)),
                };
                self.api.create(&pp, &lease).await.map(|_| ())
            }
            Some(mut lease) => {
                if !can_acquire(lease.spec.as_ref(), &self.cfg.identity, now) {
                    return Ok(false);
                }
                lease.spec = Some(self.claim(lease.spec.as_ref(), now));
                self.api.replace(name, &pp, &lease).await.map(|_| ())
            }
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait until this replica holds the lease.
    pub async fn acquire(&self) {
        info!(lease = %self.cfg.lease_name, identity = %self.cfg.identity, "waiting for leadership");
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(lease = %self.cfg.lease_name, "elected leader");
                    return;
                }
                Ok(false) => debug!("lease held elsewhere"),
                Err(e) => warn!(error = %e, "leader election attempt failed"),
            }
            tokio::time::sleep(self.renew_every()).await;
        }
    }

    /// Keep renewing the lease. Returns when it is taken over, or when renewals
    /// have failed for longer than the lease duration.
    pub async fn hold(&self) {
        let mut last_renewed = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.renew_every()).await;
            match self.try_acquire().await {
                Ok(true) => last_renewed = tokio::time::Instant::now(),
                Ok(false) => {
                    warn!(lease = %self.cfg.lease_name, "lease taken by another replica");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "lease renewal failed");
                    if last_renewed.elapsed() >= self.cfg.lease_duration {
                        warn!(lease = %self.cfg.lease_name, "lease expired while renewals failed");
                        return;
                    }
                }
            }
        }
    }

    /// Give the lease up so another replica can take over without waiting for expiry.
    pub async fn release(&self) -> Result<()> {
        let name = self.cfg.lease_name.as_str();
        let Some(mut lease) = self.api.get_opt(name).await? else { return Ok(()) };
        let Some(spec) = lease.spec.as_mut() else { return Ok(()) };
        if spec.holder_identity.as_deref() != Some(self.cfg.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        self.api.replace(name, &PostParams::default(), &lease).await?;
        info!(lease = %name, "leadership released");
        Ok(())
    }
}
