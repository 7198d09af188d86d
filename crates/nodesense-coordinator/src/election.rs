// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Lease-based leader election.
//!
//! Only one coordinator replica reconciles at a time. Candidates poll
//! the cluster's lease primitive; the holder renews on a fixed
//! interval and treats a failed renewal (or a renewal gap longer than
//! the lease duration) as loss of leadership. Followers stay warm:
//! the submission server keeps running and caching while waiting.

use crate::nodeapi::NodeApi;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Why an election phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// Leadership was acquired.
    Leading,
    /// Leadership was lost to another replica or to renewal failure.
    Lost,
    /// Shutdown was requested.
    Shutdown,
}

/// Lease-based elector.
pub struct LeaseElector<N: NodeApi> {
    api: Arc<N>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
}

impl<N: NodeApi> LeaseElector<N> {
    /// Create an elector for this replica.
    pub fn new(
        api: Arc<N>,
        lease_name: impl Into<String>,
        identity: impl Into<String>,
        lease_duration: Duration,
        renew_interval: Duration,
    ) -> Self {
        Self {
            api,
            lease_name: lease_name.into(),
            identity: identity.into(),
            lease_duration,
            renew_interval,
        }
    }

    /// This replica's identity string.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Block until leadership is acquired or shutdown is requested.
    pub async fn campaign(&self, shutdown: &Notify) -> ElectionOutcome {
        // Pinned once so a notification arriving while an API call is
        // in flight is not lost.
        let stop = shutdown.notified();
        tokio::pin!(stop);

        loop {
            match self
                .api
                .acquire_lease(&self.lease_name, &self.identity, self.lease_duration)
                .await
            {
                Ok(true) => {
                    tracing::info!(
                        "acquired lease {:?} as {:?}",
                        self.lease_name,
                        self.identity
                    );
                    return ElectionOutcome::Leading;
                }
                Ok(false) => {
                    tracing::debug!("lease {:?} held elsewhere, waiting", self.lease_name);
                }
                Err(e) => {
                    tracing::warn!("lease acquisition failed: {}", e);
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                _ = &mut stop => return ElectionOutcome::Shutdown,
            }
        }
    }

    /// Hold leadership, renewing until it is lost or shutdown.
    pub async fn hold(&self, shutdown: &Notify) -> ElectionOutcome {
        let stop = shutdown.notified();
        tokio::pin!(stop);

        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.renew_interval) => {}
                _ = &mut stop => return ElectionOutcome::Shutdown,
            }

            match self
                .api
                .renew_lease(&self.lease_name, &self.identity, self.lease_duration)
                .await
            {
                Ok(true) => {
                    last_renewal = Instant::now();
                }
                Ok(false) => {
                    tracing::warn!("lease {:?} lost", self.lease_name);
                    return ElectionOutcome::Lost;
                }
                Err(e) => {
                    tracing::warn!("lease renewal failed: {}", e);
                    if last_renewal.elapsed() >= self.lease_duration {
                        tracing::warn!(
                            "no successful renewal for {:?}, stepping down",
                            self.lease_duration
                        );
                        return ElectionOutcome::Lost;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodeapi::FakeNodeApi;

    fn elector(api: &FakeNodeApi, identity: &str) -> LeaseElector<FakeNodeApi> {
        LeaseElector::new(
            Arc::new(api.clone()),
            "test-lease",
            identity,
            Duration::from_millis(200),
            Duration::from_millis(20),
        )
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let api = FakeNodeApi::new();
        let shutdown = Notify::new();
        let outcome = elector(&api, "a").campaign(&shutdown).await;
        assert_eq!(outcome, ElectionOutcome::Leading);
    }

    #[tokio::test]
    async fn test_second_candidate_waits_until_expiry() {
        let api = FakeNodeApi::new();
        let shutdown = Notify::new();

        elector(&api, "a").campaign(&shutdown).await;

        // Contender takes over once the lease expires.
        api.expire_lease("test-lease");
        let outcome = elector(&api, "b").campaign(&shutdown).await;
        assert_eq!(outcome, ElectionOutcome::Leading);
    }

    #[tokio::test]
    async fn test_hold_reports_loss_after_takeover() {
        let api = FakeNodeApi::new();
        let shutdown = Notify::new();

        let a = elector(&api, "a");
        a.campaign(&shutdown).await;

        // Another replica steals the expired lease.
        api.expire_lease("test-lease");
        assert_eq!(
            elector(&api, "b").campaign(&shutdown).await,
            ElectionOutcome::Leading
        );

        let outcome = a.hold(&shutdown).await;
        assert_eq!(outcome, ElectionOutcome::Lost);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_campaign() {
        let api = FakeNodeApi::new();
        // Lease taken by someone else, so the campaign would spin.
        elector(&api, "other")
            .campaign(&Notify::new())
            .await;

        let shutdown = Arc::new(Notify::new());
        let elector_b = elector(&api, "b");
        let shutdown_clone = Arc::clone(&shutdown);
        let handle = tokio::spawn(async move { elector_b.campaign(&shutdown_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();
        assert_eq!(handle.await.unwrap(), ElectionOutcome::Shutdown);
    }
}
