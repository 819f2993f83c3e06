//! Cross-component tests and the fakes they share
//!
//! The fake identity provider here is also used by the renewer's unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::adapters::http_client::mock::MockHttpClient;
use crate::auth::providers::{IdentityProvider, LoginOutcome, LoginRequest, RenewOutcome};
use crate::auth::token::Credential;
use crate::clock::{Clock, ManualClock};


pub const API: &str = "http://localhost:8000";

/// What the fake provider answers to a login check
#[derive(Debug, Clone, Copy)]
pub enum FakeLogin {
    Approve(&'static str),
    Absent,
    Fail,
}

/// What the fake provider answers to the next renewal
#[derive(Debug, Clone, Copy)]
pub enum FakeRenewal {
    Renew(&'static str),
    Unchanged,
    Fail,
}

/// Scripted identity provider reading time from a [`ManualClock`]
pub struct FakeProvider {
    clock: Arc<ManualClock>,
    login: FakeLogin,
    login_lifetime_secs: i64,
    renewals: Mutex<VecDeque<FakeRenewal>>,
    renew_delay: Mutex<Option<Duration>>,
    login_calls: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self {
            clock,
            login: FakeLogin::Approve("token-a"),
            login_lifetime_secs: 300,
            renewals: Mutex::new(VecDeque::new()),
            renew_delay: Mutex::new(None),
            login_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_login(mut self, login: FakeLogin) -> Self {
        self.login = login;
        self
    }

    /// Lifetime of the credential handed out at login
    pub fn with_login_lifetime(mut self, secs: i64) -> Self {
        self.login_lifetime_secs = secs;
        self
    }

    /// A credential with `remaining_secs` left on the fake clock
    pub fn credential(&self, token: &str, remaining_secs: i64) -> Credential {
        Credential::with_lifetime(token, self.clock.now(), chrono::Duration::seconds(remaining_secs))
            .with_refresh_token(format!("refresh-{}", token))
    }

    pub fn script_renewal(&self, renewal: FakeRenewal) {
        self.renewals.lock().unwrap().push_back(renewal);
    }

    pub fn set_renew_delay(&self, delay: Duration) {
        *self.renew_delay.lock().unwrap() = Some(delay);
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn check_login(&self, _request: &LoginRequest) -> Result<LoginOutcome> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        match self.login {
            FakeLogin::Approve(token) => Ok(LoginOutcome::Authenticated(
                self.credential(token, self.login_lifetime_secs),
            )),
            FakeLogin::Absent => Ok(LoginOutcome::NotAuthenticated {
                login_url: Some("http://idp/login".to_string()),
            }),
            FakeLogin::Fail => Err(anyhow!("identity provider unreachable")),
        }
    }

    async fn renew(&self, _current: &Credential, _min_validity: chrono::Duration) -> Result<RenewOutcome> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.renew_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.renewals.lock().unwrap().pop_front();
        match next.unwrap_or(FakeRenewal::Unchanged) {
            FakeRenewal::Renew(token) => Ok(RenewOutcome::Renewed(self.credential(token, 300))),
            FakeRenewal::Unchanged => Ok(RenewOutcome::Unchanged),
            FakeRenewal::Fail => Err(anyhow!("refresh token rejected")),
        }
    }

    fn logout_url(&self, _credential: Option<&Credential>, redirect_uri: &str) -> Option<String> {
        Some(format!("http://idp/logout?post_logout_redirect_uri={}", redirect_uri))
    }
}

/// Serve one task and one event from the mock backend
pub fn mock_backend(http: &MockHttpClient) {
    http.mock_success_json(
        &format!("{}/tasks", API),
        &serde_json::json!([{
            "id": "t1",
            "name": "run 42",
            "filename": "run42.root",
            "size": 7,
            "timestamp": "2025-01-01T00:00:00Z",
            "object": "tier1/run42.root"
        }]),
    )
    .unwrap();
    http.mock_success_json(
        &format!("{}/events", API),
        &serde_json::json!([{"task_id": "t1", "event": "INGESTED", "timestamp": "2025-01-01T00:00:01Z"}]),
    )
    .unwrap();
    http.mock_response(format!("{}/data/t1", API), 200, "payload");
}

/// Poll `condition` until it holds, failing after a while
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
