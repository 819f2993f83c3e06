//! Loopback listener that captures the identity provider's redirect

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{RawQuery, State},
    http::StatusCode,
    response::Html,
    routing::get,
    Router,
};
use reqwest::Url;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::providers::LoginRedirect;

/// How long the user gets to finish logging in
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(300);

const LANDING_PAGE: &str =
    "<html><body><p>Login complete. You can close this window.</p></body></html>";

#[derive(Clone)]
struct ReceiverState {
    redirect_uri: Url,
    callback: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

/// Serves the redirect URI on the loopback interface for one login
pub struct RedirectReceiver {
    redirect_uri: Url,
    addr: SocketAddr,
    timeout: Duration,
}

impl RedirectReceiver {
    /// The redirect URI must point at this machine
    pub fn new(redirect_uri: &str) -> Result<Self> {
        let redirect_uri = Url::parse(redirect_uri)
            .with_context(|| format!("invalid redirect URI '{}'", redirect_uri))?;
        let ip = match redirect_uri.host_str() {
            Some("localhost") => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Some(host) => host
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<IpAddr>()
                .with_context(|| format!("redirect host '{}' is not an address", host))?,
            None => bail!("redirect URI has no host"),
        };
        if !ip.is_loopback() {
            bail!("redirect URI must point at the loopback interface, got {}", ip);
        }
        let port = redirect_uri
            .port_or_known_default()
            .ok_or_else(|| anyhow!("redirect URI has no port"))?;

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            redirect_uri,
            timeout: DEFAULT_LOGIN_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

async fn receive_redirect(
    State(state): State<ReceiverState>,
    RawQuery(query): RawQuery,
) -> (StatusCode, Html<&'static str>) {
    let mut callback = state.redirect_uri.clone();
    callback.set_query(query.as_deref());

    let sender = state
        .callback
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match sender {
        Some(sender) => {
            let _ = sender.send(callback.into());
            (StatusCode::OK, Html(LANDING_PAGE))
        }
        None => (StatusCode::GONE, Html("<html><body><p>Login already handled.</p></body></html>")),
    }
}

#[async_trait]
impl LoginRedirect for RedirectReceiver {
    async fn redirect(&self, login_url: &str) -> Result<Option<String>> {
        let listener = TcpListener::bind(self.addr)
            .await
            .with_context(|| format!("cannot listen on {}", self.addr))?;

        let (callback_tx, callback_rx) = oneshot::channel();
        let state = ReceiverState {
            redirect_uri: self.redirect_uri.clone(),
            callback: Arc::new(Mutex::new(Some(callback_tx))),
        };
        let app = Router::new()
            .route(self.redirect_uri.path(), get(receive_redirect))
            .with_state(state)
            .layer(TraceLayer::new_for_http());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        info!(addr = %self.addr, "Open this URL to log in: {}", login_url);

        let callback = match tokio::time::timeout(self.timeout, callback_rx).await {
            Ok(Ok(callback)) => {
                debug!("Redirect received");
                Some(callback)
            }
            Ok(Err(_)) => None,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Timed out waiting for login redirect");
                None
            }
        };

        let _ = shutdown_tx.send(());
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Redirect listener failed"),
            Err(e) => warn!(error = %e, "Redirect listener task failed"),
        }
        Ok(callback)
    }
}
