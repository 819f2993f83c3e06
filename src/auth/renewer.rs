//! Background renewal of the live credential

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::auth::providers::{IdentityProvider, RenewOutcome};
use crate::auth::store::CredentialStore;
use crate::auth::token::SessionState;
use crate::clock::Clock;
use crate::error::{DashboardError, DashboardResult};
use crate::events::{DashboardEvent, EventBus};

pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RENEW_THRESHOLD: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 6;

/// When and how hard to renew
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalPolicy {
    interval: Duration,
    threshold: Duration,
    max_consecutive_failures: u32,
}

impl RenewalPolicy {
    /// `max_consecutive_failures == 0` keeps retrying forever
    pub fn new(
        interval: Duration,
        threshold: Duration,
        max_consecutive_failures: u32,
    ) -> DashboardResult<Self> {
        if interval.is_zero() {
            return Err(DashboardError::config("renewal.interval", "must be positive"));
        }
        if threshold.is_zero() {
            return Err(DashboardError::config("renewal.threshold", "must be positive"));
        }
        chrono::Duration::from_std(threshold)
            .map_err(|e| DashboardError::config("renewal.threshold", e))?;
        Ok(Self {
            interval,
            threshold,
            max_consecutive_failures,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    fn min_validity(&self) -> chrono::Duration {
        // Range checked in `new`
        chrono::Duration::from_std(self.threshold).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RENEW_INTERVAL,
            threshold: DEFAULT_RENEW_THRESHOLD,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
        }
    }
}

/// Result of one renewal check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing to renew
    NotAuthenticated,
    /// Remaining lifetime is above the threshold
    StillValid { remaining: chrono::Duration },
    /// The store holds a new credential
    Renewed { generation: u64 },
    /// The provider kept the current credential
    Unchanged,
    Failed { consecutive_failures: u32 },
    /// Too many failures in a row; the session is now unauthenticated
    Escalated,
    /// Another renewal was still running
    InFlight,
}

impl TickOutcome {
    /// Whether the renewal loop should stop after this outcome
    pub fn is_terminal(&self) -> bool {
        matches!(self, TickOutcome::NotAuthenticated | TickOutcome::Escalated)
    }
}

/// Keeps the credential in the store valid
pub struct CredentialRenewer {
    provider: Arc<dyn IdentityProvider>,
    store: Arc<CredentialStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    policy: RenewalPolicy,
    in_flight: Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl CredentialRenewer {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<CredentialStore>,
        events: EventBus,
        clock: Arc<dyn Clock>,
        policy: RenewalPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            events,
            clock,
            policy,
            in_flight: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Check the credential once and renew it if it is close to expiry.
    ///
    /// A tick that overlaps a running renewal returns
    /// [`TickOutcome::InFlight`] without contacting the provider.
    pub async fn tick(&self) -> TickOutcome {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Renewal already in flight, skipping tick");
            return TickOutcome::InFlight;
        };

        let snapshot = self.store.snapshot();
        let credential = match snapshot.credential() {
            Some(credential) if snapshot.is_authenticated() => Arc::clone(credential),
            _ => return TickOutcome::NotAuthenticated,
        };

        let now = self.clock.now();
        let min_validity = self.policy.min_validity();
        if !credential.expires_within(min_validity, now) {
            let remaining = credential.remaining(now);
            debug!(remaining_secs = remaining.num_seconds(), "Credential still valid");
            return TickOutcome::StillValid { remaining };
        }

        debug!(
            remaining_secs = credential.remaining(now).num_seconds(),
            token = %credential.preview(),
            "Credential close to expiry, asking provider to renew"
        );

        match self.provider.renew(&credential, min_validity).await {
            Ok(RenewOutcome::Renewed(renewed)) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                let expires_at = renewed.expires_at();
                match self.store.set_credential(renewed) {
                    Ok(snapshot) => {
                        info!(
                            generation = snapshot.generation(),
                            expires_at = %expires_at,
                            "Credential renewed"
                        );
                        self.events.publish(DashboardEvent::CredentialRenewed {
                            generation: snapshot.generation(),
                            expires_at,
                        });
                        TickOutcome::Renewed {
                            generation: snapshot.generation(),
                        }
                    }
                    // Session torn down while the provider answered
                    Err(e) => {
                        debug!(error = %e, "Discarding renewed credential");
                        TickOutcome::NotAuthenticated
                    }
                }
            }
            Ok(RenewOutcome::Unchanged) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                debug!("Provider kept the current credential");
                TickOutcome::Unchanged
            }
            Err(e) => self.record_failure(&format!("{:#}", e)),
        }
    }

    fn record_failure(&self, reason: &str) -> TickOutcome {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.policy.max_consecutive_failures;
        warn!(consecutive_failures = failures, max_failures = max, error = %reason, "Credential renewal failed");
        self.events.publish(DashboardEvent::RenewalFailed {
            consecutive_failures: failures,
            error: reason.to_string(),
        });

        if max == 0 || failures < max {
            return TickOutcome::Failed {
                consecutive_failures: failures,
            };
        }

        error!(consecutive_failures = failures, "Giving up on renewal, ending session");
        match self.store.mark_unauthenticated() {
            Ok(_) => {
                self.events.publish(DashboardEvent::SessionStateChanged {
                    from: SessionState::Authenticated,
                    to: SessionState::Unauthenticated,
                });
                self.events.publish(DashboardEvent::SessionExpired {
                    reason: format!("renewal failed {} times in a row: {}", failures, reason),
                });
            }
            Err(e) => debug!(error = %e, "Session already ended"),
        }
        TickOutcome::Escalated
    }

    /// Run [`tick`](Self::tick) every `interval` until stopped, the session
    /// ends or renewal escalates.
    pub fn spawn(self: Arc<Self>) -> RenewalHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let interval = self.policy.interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "Credential renewal loop started");
            loop {
                let outcome = tokio::select! {
                    _ = &mut shutdown_rx => break,
                    outcome = async {
                        ticker.tick().await;
                        self.tick().await
                    } => outcome,
                };
                if outcome.is_terminal() {
                    debug!(outcome = ?outcome, "Renewal loop finished");
                    break;
                }
            }
            info!("Credential renewal loop stopped");
        });

        RenewalHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Owner of a running renewal loop; dropping it cancels the loop
pub struct RenewalHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl RenewalHandle {
    /// Stop the loop and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Renewal task panicked");
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
