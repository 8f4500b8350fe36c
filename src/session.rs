//! Session state machine
//!
//! Drives the connect/login/relogin lifecycle against the external network
//! client. The remote side is authoritative about credential acceptance,
//! so every local failure is non-fatal: transport and auth errors schedule
//! a retry with tiered backoff, and malformed credential state only
//! produces a warning before the logon is attempted anyway.

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::{LogonRequest, NetworkClient, WebSession, WebSessionBridge};
use crate::config::Credentials;
use crate::types::{ClientEvent, LogonOutcome};

/// Base login retry interval
pub const LOGIN_RETRY_BASE: Duration = Duration::from_secs(15);

/// Connection lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    LoggingIn,
    LoggedIn,
}

/// Notices the runner reacts to after an event is handled
#[derive(Debug)]
pub enum SessionNotice {
    /// Logon plus web authentication completed; collaborators may start
    LoggedIn(WebSession),
}

/// Tiered backoff: attempts 0-1 wait the base interval, 2-3 wait twice it,
/// and from the fourth failed attempt on the wait grows linearly without a
/// cap.
pub fn retry_interval(base: Duration, attempts_since_last_success: u32) -> Duration {
    if attempts_since_last_success < 2 {
        base
    } else if attempts_since_last_success < 4 {
        base * 2
    } else {
        base * attempts_since_last_success
    }
}

/// Per-account session state machine
pub struct Session<C, W> {
    client: C,
    web: W,
    credentials: Credentials,
    phase: Phase,
    logging_in: bool,
    last_login_succeeded: bool,
    logout_wanted: bool,
    attempts_since_last_success: u32,
    retry_base: Duration,
    retry_at: Option<Instant>,
    once_logged_in: Vec<Box<dyn FnOnce() + Send>>,
}

impl<C: NetworkClient, W: WebSessionBridge> Session<C, W> {
    pub fn new(client: C, web: W, credentials: Credentials) -> Self {
        Self {
            client,
            web,
            credentials,
            phase: Phase::Disconnected,
            logging_in: false,
            last_login_succeeded: false,
            logout_wanted: false,
            attempts_since_last_success: 0,
            retry_base: LOGIN_RETRY_BASE,
            retry_at: None,
            once_logged_in: Vec::new(),
        }
    }

    pub fn with_retry_base(mut self, base: Duration) -> Self {
        self.retry_base = base;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_logged_in(&self) -> bool {
        self.phase == Phase::LoggedIn
    }

    pub fn account(&self) -> &str {
        &self.credentials.account
    }

    /// Subscribe to the next successful login. Subscribers fire exactly
    /// once, after the web-session step completes, and the list is cleared.
    pub fn once_logged_in<F: FnOnce() + Send + 'static>(&mut self, callback: F) {
        self.once_logged_in.push(Box::new(callback));
    }

    /// Begin a login attempt. A second call while one is in flight
    /// collapses into it; a call while already logged in is a warned no-op.
    pub async fn login(&mut self) {
        if self.is_logged_in() {
            warn!(account = %self.credentials.account, "already logged in, ignoring login request");
            return;
        }
        if self.logging_in {
            debug!(account = %self.credentials.account, "login already in flight");
            return;
        }
        self.logging_in = true;
        self.start_login().await;
    }

    /// Tear down the session on purpose; the resulting logoff event will
    /// not trigger a retry.
    pub async fn log_out(&mut self) {
        self.logout_wanted = true;
        if let Err(e) = self.client.disconnect().await {
            warn!("disconnect failed: {e}");
        }
    }

    /// Deadline of the pending login retry, if one is scheduled
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Resume the login attempt scheduled by the backoff timer
    pub async fn resume_login(&mut self) {
        if self.retry_at.take().is_none() {
            return;
        }
        debug!(account = %self.credentials.account, "retrying login");
        self.start_login().await;
    }

    /// Feed one client push event through the machine. Events that are not
    /// session lifecycle events are ignored.
    pub async fn handle_client_event(&mut self, event: ClientEvent) -> Option<SessionNotice> {
        match event {
            ClientEvent::Connected => {
                self.phase = Phase::Connected;
                self.fire_log_on().await;
                None
            }
            ClientEvent::LogOnResponse { outcome } => {
                self.logging_in = false;
                self.last_login_succeeded = false;
                self.handle_logon_outcome(outcome).await
            }
            ClientEvent::TransportError { message } => {
                error!(account = %self.credentials.account, "client transport error: {message}");
                self.phase = Phase::Disconnected;
                if self.logging_in {
                    // The in-flight attempt died with the transport
                    self.logging_in = false;
                }
                warn!(
                    last_login_succeeded = self.last_login_succeeded,
                    "disconnected, will try to relog"
                );
                self.retry_login();
                None
            }
            ClientEvent::LoggedOff => {
                self.phase = Phase::Disconnected;
                warn!(account = %self.credentials.account, "logged off from remote network");
                if !self.last_login_succeeded {
                    self.attempts_since_last_success += 1;
                    self.retry_login();
                } else if !self.logout_wanted {
                    warn!("unexpected logoff, treating as failure");
                    self.retry_login();
                }
                self.logout_wanted = false;
                None
            }
            ClientEvent::MachineAuth { payload } => {
                self.update_machine_auth(&payload).await;
                None
            }
            _ => None,
        }
    }

    async fn handle_logon_outcome(&mut self, outcome: LogonOutcome) -> Option<SessionNotice> {
        match outcome {
            LogonOutcome::Ok => {
                info!(account = %self.credentials.account, "logged in");
                self.phase = Phase::LoggedIn;
                self.last_login_succeeded = true;
                self.attempts_since_last_success = 0;
                match self.web.web_log_on().await {
                    Ok(session) => {
                        debug!("web session established");
                        for callback in self.once_logged_in.drain(..) {
                            callback();
                        }
                        Some(SessionNotice::LoggedIn(session))
                    }
                    Err(e) => {
                        // The poll catch-up depends on this; a later logoff
                        // or error event restarts the whole login.
                        error!("web session authentication failed: {e}");
                        None
                    }
                }
            }
            LogonOutcome::Denied => {
                warn!("login denied, probably a guard code is needed");
                None
            }
            LogonOutcome::InvalidAuthCode => {
                warn!("invalid guard code provided");
                None
            }
            LogonOutcome::TwoFactorMismatch => {
                warn!("invalid two-factor code, probably missed the timing window");
                None
            }
            LogonOutcome::Other(code) => {
                warn!("unhandled logon response code {code}");
                None
            }
        }
    }

    async fn start_login(&mut self) {
        if !self.client.is_connected() {
            debug!(account = %self.credentials.account, "connecting");
            self.phase = Phase::Connecting;
            if let Err(e) = self.client.connect().await {
                warn!("connect failed: {e}");
                self.logging_in = false;
                self.retry_login();
            }
        } else {
            self.fire_log_on().await;
        }
    }

    async fn fire_log_on(&mut self) {
        self.phase = Phase::LoggingIn;
        let mut request = LogonRequest {
            username: self.credentials.username.clone(),
            password: self.credentials.password.clone(),
            sentry_sha: None,
            guard_code: None,
            two_factor_code: None,
        };
        if let Some(sha) = self.credentials.sentry_sha() {
            request.sentry_sha = Some(sha.to_vec());
        } else if let Some(code) = self.credentials.guard_code() {
            request.guard_code = Some(code.to_string());
        } else {
            warn!("no sentry file or guard code available, login will probably be refused");
        }
        if let Some(code) = self.credentials.two_factor_code() {
            request.two_factor_code = Some(code.to_string());
        }
        debug!(
            sentry = request.sentry_sha.is_some(),
            guard_code = request.guard_code.is_some(),
            "firing logon"
        );
        if let Err(e) = self.client.log_on(request).await {
            warn!("logon dispatch failed: {e}");
            self.logging_in = false;
            self.retry_login();
        }
    }

    /// Schedule a relogin after the backoff interval. No-op while another
    /// attempt is in flight.
    fn retry_login(&mut self) {
        if self.logging_in {
            return;
        }
        self.logging_in = true;
        let interval = retry_interval(self.retry_base, self.attempts_since_last_success);
        debug!(
            attempts = self.attempts_since_last_success,
            ?interval,
            "login retry scheduled"
        );
        self.retry_at = Some(Instant::now() + interval);
    }

    async fn update_machine_auth(&mut self, payload: &[u8]) {
        match self.credentials.save_sentry(payload) {
            Ok(sha) => {
                if let Err(e) = self.client.ack_machine_auth(sha).await {
                    warn!("machine-auth ack failed: {e}");
                }
            }
            Err(e) => error!("failed to persist sentry file: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct MockClient {
        connected: Arc<AtomicBool>,
        logons: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NetworkClient for MockClient {
        async fn connect(&self) -> anyhow::Result<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.connected.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn log_on(&self, _request: LogonRequest) -> anyhow::Result<()> {
            self.logons.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn ack_machine_auth(&self, _sentry_sha: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone)]
    struct MockWeb;

    #[async_trait]
    impl WebSessionBridge for MockWeb {
        async fn web_log_on(&self) -> anyhow::Result<WebSession> {
            Ok(WebSession {
                session_id: "web-session".to_string(),
                cookies: vec!["auth=token".to_string()],
            })
        }
    }

    fn session(client: MockClient) -> Session<MockClient, MockWeb> {
        Session::new(client, MockWeb, Credentials::for_tests("bot-a"))
    }

    #[tokio::test]
    async fn test_double_login_fires_one_logon() {
        let client = MockClient::default();
        client.connected.store(true, Ordering::SeqCst);
        let mut session = session(client.clone());

        session.login().await;
        session.login().await;

        assert_eq!(client.logons.load(Ordering::SeqCst), 1);
        assert_eq!(session.phase(), Phase::LoggingIn);
    }

    #[tokio::test]
    async fn test_login_connects_then_fires_on_connected_event() {
        let client = MockClient::default();
        let mut session = session(client.clone());

        session.login().await;
        assert_eq!(session.phase(), Phase::Connecting);
        assert_eq!(client.logons.load(Ordering::SeqCst), 0);

        session.handle_client_event(ClientEvent::Connected).await;
        assert_eq!(client.logons.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_successful_logon_notifies_and_drains_subscribers() {
        let client = MockClient::default();
        client.connected.store(true, Ordering::SeqCst);
        let mut session = session(client.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        session.once_logged_in(move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        session.login().await;
        let notice = session
            .handle_client_event(ClientEvent::LogOnResponse {
                outcome: LogonOutcome::Ok,
            })
            .await;

        assert!(matches!(notice, Some(SessionNotice::LoggedIn(_))));
        assert!(session.is_logged_in());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Subscribers fire once; a later login must not replay them
        session.handle_client_event(ClientEvent::LoggedOff).await;
        session.resume_login().await;
        session
            .handle_client_event(ClientEvent::LogOnResponse {
                outcome: LogonOutcome::Ok,
            })
            .await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_logoff_schedules_retry() {
        let client = MockClient::default();
        client.connected.store(true, Ordering::SeqCst);
        let mut session = session(client.clone());

        session.login().await;
        session
            .handle_client_event(ClientEvent::LogOnResponse {
                outcome: LogonOutcome::Ok,
            })
            .await;
        assert!(session.is_logged_in());

        session.handle_client_event(ClientEvent::LoggedOff).await;
        assert!(session.retry_deadline().is_some());
        assert_eq!(session.phase(), Phase::Disconnected);
    }

    #[tokio::test]
    async fn test_wanted_logout_suppresses_retry() {
        let client = MockClient::default();
        client.connected.store(true, Ordering::SeqCst);
        let mut session = session(client.clone());

        session.login().await;
        session
            .handle_client_event(ClientEvent::LogOnResponse {
                outcome: LogonOutcome::Ok,
            })
            .await;

        session.log_out().await;
        session.handle_client_event(ClientEvent::LoggedOff).await;
        assert!(session.retry_deadline().is_none());
    }

    #[tokio::test]
    async fn test_failed_login_counts_attempts() {
        let client = MockClient::default();
        client.connected.store(true, Ordering::SeqCst);
        let mut session = session(client.clone());

        session.login().await;
        session
            .handle_client_event(ClientEvent::LogOnResponse {
                outcome: LogonOutcome::Denied,
            })
            .await;
        session.handle_client_event(ClientEvent::LoggedOff).await;

        assert_eq!(session.attempts_since_last_success, 1);
        assert!(session.retry_deadline().is_some());
    }

    #[test]
    fn test_backoff_schedule() {
        let base = Duration::from_secs(15);
        assert_eq!(retry_interval(base, 0), base);
        assert_eq!(retry_interval(base, 1), base);
        assert_eq!(retry_interval(base, 2), base * 2);
        assert_eq!(retry_interval(base, 3), base * 2);
        assert_eq!(retry_interval(base, 4), base * 4);
        assert_eq!(retry_interval(base, 7), base * 7);
        // No cap on the linear growth
        assert_eq!(retry_interval(base, 100), base * 100);
    }
}
