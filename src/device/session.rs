//! One guarded device connection.
//!
//! ```text
//!                connect()                 ok
//! Disconnected ───────────▶ Connecting ─────────▶ Connected
//!       ▲                       │  ▲                  │
//!       │ disconnect()     fail │  │ reconnect        │ probe fails /
//!       │                       ▼  │ (bounded)        │ channel closed
//!       └──────────────────── Failed ◀────────────────┘
//! ```
//!
//! Every operation that touches the connection takes the session's async
//! mutex, so commands never overlap and at most one reconnect is in
//! flight. A caller that arrives during a reconnect waits, then sees the
//! outcome: a restored connection, or `ConnectionLost` once the attempt
//! budget is spent. Only a successful command resets that budget.
//!
//! [`DeviceSession::status`] reads a separate snapshot and never waits on
//! the mutex.
//!
//! A caller may drop an operation mid-connect (a timeout or `select!`
//! around `execute`). The abandoned attempt is then reported as failed and
//! the session is left in `Failed`, so the next caller reconnects instead
//! of finding it stuck in `Connecting`.

use serde::Serialize;
use serde_json::{Value, json};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::error::ConnectionError;
use super::transport::{Connection, Target, Transport, TransportError};
use crate::config::ConnectionConfig;
use crate::security::{AuditEventType, AuditLogger, Severity};

/// Slack on top of the transport's own timeout before the session gives up.
const GRACE: Duration = Duration::from_secs(2);

const INTERRUPTED: &str = "connection attempt interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot returned by [`DeviceSession::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub connected: bool,
    /// Result of the most recent liveness probe.
    pub alive: bool,
    pub host: Option<String>,
    pub username: Option<String>,
    pub last_error: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Benign command sent before each real one; empty skips the probe.
    pub probe_command: String,
    pub probe_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_reconnect_attempts: config.max_reconnect_attempts,
            connect_timeout: Duration::from_secs(config.connection_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
            probe_command: config.liveness_probe.trim().to_string(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default())
    }
}

struct SessionInner {
    state: SessionState,
    target: Option<Target>,
    connection: Option<Box<dyn Connection>>,
    reconnect_attempts: u32,
    alive: bool,
    last_error: Option<String>,
}

pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    audit: Arc<AuditLogger>,
    inner: Mutex<SessionInner>,
    snapshot: RwLock<SessionStatus>,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("settings", &self.settings)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: SessionSettings,
        audit: Arc<AuditLogger>,
    ) -> Self {
        let snapshot = SessionStatus {
            state: SessionState::Disconnected,
            connected: false,
            alive: false,
            host: None,
            username: None,
            last_error: None,
            reconnect_attempts: 0,
            max_reconnect_attempts: settings.max_reconnect_attempts,
        };
        Self {
            transport,
            settings,
            audit,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                target: None,
                connection: None,
                reconnect_attempts: 0,
                alive: false,
                last_error: None,
            }),
            snapshot: RwLock::new(snapshot),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Open a connection to `target`.
    ///
    /// A no-op when already connected to the same host, port and user. A
    /// live connection to a different target is closed first.
    pub async fn connect(&self, target: Target) -> Result<(), ConnectionError> {
        let mut inner = self.inner.lock().await;
        self.recover_interrupted(&mut inner);

        if inner.state == SessionState::Connected
            && inner
                .target
                .as_ref()
                .is_some_and(|t| t.same_endpoint(&target))
        {
            debug!("Already connected to {}", target);
            return Ok(());
        }

        self.close_connection(&mut inner).await;
        inner.target = Some(target.clone());
        inner.reconnect_attempts = 0;
        inner.last_error = None;
        inner.state = SessionState::Connecting;
        self.publish(&inner);

        self.establish(&mut inner, &target).await
    }

    /// Run one command, reconnecting first if the liveness probe fails.
    pub async fn execute(&self, command: &str) -> Result<String, ConnectionError> {
        let mut inner = self.inner.lock().await;
        self.recover_interrupted(&mut inner);

        let target = match (&inner.target, inner.state) {
            (Some(t), SessionState::Connected | SessionState::Failed) => t.clone(),
            _ => return Err(ConnectionError::NotConnected),
        };

        if inner.state == SessionState::Connected && !self.probe(&mut inner).await {
            self.mark_lost(&mut inner, &target, "liveness probe failed")
                .await;
        }

        if inner.state == SessionState::Failed {
            self.reconnect(&mut inner, &target).await?;
        }

        self.send(&mut inner, &target, command).await
    }

    /// Probe without reconnecting. `None` when a command holds the session.
    pub async fn check_liveness(&self) -> Option<bool> {
        let Ok(mut inner) = self.inner.try_lock() else {
            debug!("Session busy, skipping liveness check");
            return None;
        };
        self.recover_interrupted(&mut inner);

        let target = match (&inner.target, inner.state) {
            (Some(t), SessionState::Connected) => t.clone(),
            _ => return Some(false),
        };

        if self.probe(&mut inner).await {
            inner.alive = true;
            self.publish(&inner);
            Some(true)
        } else {
            self.mark_lost(&mut inner, &target, "liveness probe failed")
                .await;
            Some(false)
        }
    }

    /// Close the connection. Safe to call any number of times.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.recover_interrupted(&mut inner);
        self.close_connection(&mut inner).await;
        inner.target = None;
        inner.reconnect_attempts = 0;
        inner.last_error = None;
        self.publish(&inner);
    }

    async fn establish(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        target: &Target,
    ) -> Result<(), ConnectionError> {
        let timeout = self.settings.connect_timeout;
        let guard = AttemptGuard::arm(self, target);
        let result = tokio::time::timeout(timeout + GRACE, self.transport.open(target, timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        guard.disarm();

        match result {
            Ok(connection) => {
                inner.connection = Some(connection);
                inner.last_error = None;
                info!("Connected to {}", target);
                self.transition(
                    inner,
                    SessionState::Connected,
                    AuditEventType::ConnectionEstablished,
                    Severity::Info,
                    &format!("Connected to {}", target.host),
                    endpoint_fields(target),
                );
                Ok(())
            }
            Err(e) => {
                let err = self.connect_error(target, e);
                warn!("Connection to {} failed: {}", target, err.category());
                inner.last_error = Some(err.to_string());
                let mut fields = endpoint_fields(target);
                fields["error_category"] = json!(err.category());
                fields["error"] = json!(err.to_string());
                self.transition(
                    inner,
                    SessionState::Failed,
                    AuditEventType::ConnectionFailed,
                    Severity::Error,
                    &format!("Connection to {} failed", target.host),
                    fields,
                );
                Err(err)
            }
        }
    }

    async fn reconnect(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        target: &Target,
    ) -> Result<(), ConnectionError> {
        let max = self.settings.max_reconnect_attempts;

        while inner.reconnect_attempts < max {
            inner.reconnect_attempts += 1;
            let attempt = inner.reconnect_attempts;
            self.transition(
                inner,
                SessionState::Connecting,
                AuditEventType::ReconnectAttempt,
                Severity::Warning,
                &format!("Reconnect attempt {}/{} to {}", attempt, max, target.host),
                json!({ "host": target.host, "attempt": attempt, "max_attempts": max }),
            );
            if self.establish(inner, target).await.is_ok() {
                return Ok(());
            }
        }

        Err(ConnectionError::ConnectionLost {
            host: target.host.clone(),
            attempts: max,
        })
    }

    async fn send(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        target: &Target,
        command: &str,
    ) -> Result<String, ConnectionError> {
        let timeout = self.settings.command_timeout;
        let Some(connection) = inner.connection.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        let result = tokio::time::timeout(timeout + GRACE, connection.send(command, timeout))
            .await
            .unwrap_or(Err(TransportError::Timeout));

        let err = match result {
            Ok(output) => {
                inner.reconnect_attempts = 0;
                inner.last_error = None;
                inner.alive = true;
                self.publish(inner);
                return Ok(output);
            }
            Err(TransportError::Timeout) => ConnectionError::CommandTimeout {
                command: command.to_string(),
                secs: timeout.as_secs(),
            },
            Err(TransportError::PatternMismatch) => ConnectionError::PatternMismatch {
                command: command.to_string(),
            },
            Err(TransportError::Authentication) => ConnectionError::AuthenticationFailed {
                host: target.host.clone(),
                username: target.username().to_string(),
            },
            Err(TransportError::Closed(detail)) => {
                self.mark_lost(inner, target, &detail).await;
                ConnectionError::Generic {
                    host: target.host.clone(),
                    detail,
                }
            }
            Err(TransportError::Other(detail)) => ConnectionError::Generic {
                host: target.host.clone(),
                detail,
            },
        };

        inner.last_error = Some(err.to_string());
        self.publish(inner);
        Err(err)
    }

    async fn probe(&self, inner: &mut MutexGuard<'_, SessionInner>) -> bool {
        let Some(connection) = inner.connection.as_mut() else {
            return false;
        };
        if self.settings.probe_command.is_empty() {
            return true;
        }

        let timeout = self.settings.probe_timeout;
        let result = tokio::time::timeout(
            timeout + GRACE,
            connection.send(&self.settings.probe_command, timeout),
        )
        .await;
        let alive = matches!(result, Ok(Ok(_)));
        inner.alive = alive;
        alive
    }

    /// Only a dropped `establish` can leave `Connecting` behind once the
    /// lock is free. Its guard already logged the failure.
    fn recover_interrupted(&self, inner: &mut SessionInner) {
        if inner.state != SessionState::Connecting {
            return;
        }
        debug!("Recovering from an interrupted connection attempt");
        inner.state = SessionState::Failed;
        inner.connection = None;
        inner.alive = false;
        inner.last_error = Some(INTERRUPTED.to_string());
        self.publish(inner);
    }

    /// Connected → Failed.
    async fn mark_lost(
        &self,
        inner: &mut MutexGuard<'_, SessionInner>,
        target: &Target,
        reason: &str,
    ) {
        warn!("Connection to {} lost: {}", target, reason);
        self.drop_connection(inner).await;
        inner.last_error = Some(format!("connection lost: {}", reason));
        let mut fields = endpoint_fields(target);
        fields["reason"] = json!(reason);
        self.transition(
            inner,
            SessionState::Failed,
            AuditEventType::ConnectionLost,
            Severity::Warning,
            &format!("Connection to {} lost", target.host),
            fields,
        );
    }

    /// Close whatever is open and move to Disconnected, logging once.
    async fn close_connection(&self, inner: &mut MutexGuard<'_, SessionInner>) {
        self.drop_connection(inner).await;
        if inner.state != SessionState::Disconnected {
            let host = inner
                .target
                .as_ref()
                .map(|t| t.host.clone())
                .unwrap_or_default();
            self.transition(
                inner,
                SessionState::Disconnected,
                AuditEventType::Disconnected,
                Severity::Info,
                &format!("Disconnected from {}", host),
                json!({ "host": host }),
            );
        }
    }

    async fn drop_connection(&self, inner: &mut MutexGuard<'_, SessionInner>) {
        if let Some(mut connection) = inner.connection.take() {
            match tokio::time::timeout(self.settings.probe_timeout, connection.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Ignoring error while closing connection: {}", e),
                Err(_) => debug!("Timed out closing connection"),
            }
        }
    }

    fn transition(
        &self,
        inner: &mut SessionInner,
        to: SessionState,
        event: AuditEventType,
        severity: Severity,
        message: &str,
        fields: Value,
    ) {
        debug!("Session state {} -> {}", inner.state, to);
        inner.state = to;
        inner.alive = to == SessionState::Connected;
        self.publish(inner);
        self.audit.log_event(event, message, severity, fields);
    }

    fn publish(&self, inner: &SessionInner) {
        let status = SessionStatus {
            state: inner.state,
            connected: inner.state == SessionState::Connected,
            alive: inner.alive,
            host: inner.target.as_ref().map(|t| t.host.clone()),
            username: inner.target.as_ref().map(|t| t.username().to_string()),
            last_error: inner.last_error.clone(),
            reconnect_attempts: inner.reconnect_attempts,
            max_reconnect_attempts: self.settings.max_reconnect_attempts,
        };
        *self.snapshot.write().unwrap_or_else(|p| p.into_inner()) = status;
    }

    fn connect_error(&self, target: &Target, err: TransportError) -> ConnectionError {
        match err {
            TransportError::Authentication => ConnectionError::AuthenticationFailed {
                host: target.host.clone(),
                username: target.username().to_string(),
            },
            TransportError::Timeout => ConnectionError::Timeout {
                host: target.host.clone(),
                port: target.port,
                secs: self.settings.connect_timeout.as_secs(),
            },
            TransportError::PatternMismatch => ConnectionError::Generic {
                host: target.host.clone(),
                detail: "login did not complete".to_string(),
            },
            TransportError::Closed(detail) | TransportError::Other(detail) => {
                ConnectionError::Generic {
                    host: target.host.clone(),
                    detail,
                }
            }
        }
    }
}

/// Armed across the `open` await. If the future is dropped there, the
/// snapshot flips to `Failed` and a `connection_failed` event is written;
/// the locked state is repaired by the next caller.
struct AttemptGuard<'a> {
    session: &'a DeviceSession,
    target: &'a Target,
    armed: bool,
}

impl<'a> AttemptGuard<'a> {
    fn arm(session: &'a DeviceSession, target: &'a Target) -> Self {
        Self {
            session,
            target,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Connection attempt to {} interrupted", self.target);
        {
            let mut status = self
                .session
                .snapshot
                .write()
                .unwrap_or_else(|p| p.into_inner());
            status.state = SessionState::Failed;
            status.connected = false;
            status.alive = false;
            status.last_error = Some(INTERRUPTED.to_string());
        }
        let mut fields = endpoint_fields(self.target);
        fields["error_category"] = json!("interrupted");
        self.session.audit.log_event(
            AuditEventType::ConnectionFailed,
            &format!("Connection attempt to {} interrupted", self.target.host),
            Severity::Error,
            fields,
        );
    }
}

fn endpoint_fields(target: &Target) -> Value {
    json!({
        "host": target.host,
        "port": target.port,
        "username": target.username(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::transport::{MockConnection, MockTransport};
    use crate::security::AuditSettings;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Transport whose health and open outcomes are scripted by the test.
    pub(crate) struct FakeTransport {
        pub opens: AtomicU32,
        pub open_results: StdMutex<VecDeque<Result<(), TransportError>>>,
        pub open_delay: Duration,
        pub command_delay: Duration,
        pub healthy: Arc<AtomicBool>,
    }

    impl FakeTransport {
        pub(crate) fn new() -> Self {
            Self {
                opens: AtomicU32::new(0),
                open_results: StdMutex::new(VecDeque::new()),
                open_delay: Duration::ZERO,
                command_delay: Duration::from_millis(150),
                healthy: Arc::new(AtomicBool::new(true)),
            }
        }

        pub(crate) fn fail_next_opens(&self, err: TransportError, n: usize) {
            let mut results = self.open_results.lock().unwrap();
            for _ in 0..n {
                results.push_back(Err(err.clone()));
            }
        }

        pub(crate) fn break_link(&self) {
            self.healthy.store(false, Ordering::SeqCst);
        }

        pub(crate) fn opens(&self) -> u32 {
            self.opens.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn open(
            &self,
            _target: &Target,
            _timeout: Duration,
        ) -> Result<Box<dyn Connection>, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.open_delay).await;
            let next = self.open_results.lock().unwrap().pop_front();
            next.unwrap_or(Ok(()))?;
            self.healthy.store(true, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                healthy: Arc::clone(&self.healthy),
                delay: self.command_delay,
            }))
        }
    }

    struct FakeConnection {
        healthy: Arc<AtomicBool>,
        delay: Duration,
    }

    #[async_trait]
    impl Connection for FakeConnection {
        async fn send(
            &mut self,
            command: &str,
            _timeout: Duration,
        ) -> Result<String, TransportError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(TransportError::Closed("connection reset by peer".to_string()));
            }
            match command {
                "show clock" => Ok("*12:00:00.000 UTC Mon Oct 19 2026".to_string()),
                "slow" => {
                    tokio::time::sleep(self.delay).await;
                    Ok("slow output".to_string())
                }
                "hang" => Err(TransportError::Timeout),
                "partial" => Err(TransportError::PatternMismatch),
                other => Ok(format!("output of {}", other)),
            }
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            Err(TransportError::Other("close failed".to_string()))
        }
    }

    pub(crate) fn test_settings() -> SessionSettings {
        SessionSettings {
            max_reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(1),
            command_timeout: Duration::from_secs(1),
            probe_command: "show clock".to_string(),
            probe_timeout: Duration::from_secs(1),
        }
    }

    fn audit() -> Arc<AuditLogger> {
        Arc::new(AuditLogger::new(AuditSettings::memory_only()).unwrap())
    }

    fn target() -> Target {
        Target::new("10.0.0.1", "netops", "pw")
    }

    fn session(transport: Arc<FakeTransport>) -> (Arc<DeviceSession>, Arc<AuditLogger>) {
        let audit = audit();
        let session = DeviceSession::new(transport, test_settings(), Arc::clone(&audit));
        (Arc::new(session), audit)
    }

    #[tokio::test]
    async fn connect_then_execute() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));

        session.connect(target()).await.unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Connected);
        assert!(status.connected && status.alive);
        assert_eq!(status.host.as_deref(), Some("10.0.0.1"));
        assert_eq!(status.username.as_deref(), Some("netops"));

        let out = session.execute("show version").await.unwrap();
        assert_eq!(out, "output of show version");
        assert_eq!(audit.count(AuditEventType::ConnectionEstablished), 1);
    }

    #[tokio::test]
    async fn reconnecting_to_same_target_is_noop() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));

        session.connect(target()).await.unwrap();
        session
            .connect(Target::new("10.0.0.1", "netops", "other"))
            .await
            .unwrap();
        assert_eq!(transport.opens(), 1);
        assert_eq!(audit.count(AuditEventType::ConnectionEstablished), 1);

        session
            .connect(Target::new("10.0.0.2", "netops", "pw"))
            .await
            .unwrap();
        assert_eq!(transport.opens(), 2);
        assert_eq!(audit.count(AuditEventType::Disconnected), 1);
        assert_eq!(session.status().host.as_deref(), Some("10.0.0.2"));
    }

    #[tokio::test]
    async fn authentication_failure_is_classified() {
        let transport = Arc::new(FakeTransport::new());
        transport.fail_next_opens(TransportError::Authentication, 1);
        let (session, audit) = session(Arc::clone(&transport));

        let err = session.connect(target()).await.unwrap_err();
        assert_eq!(err.category(), "authentication_failed");
        assert!(err.to_string().contains("ssh netops@10.0.0.1"));

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert!(status.last_error.unwrap().contains("authentication failed"));
        assert_eq!(audit.count(AuditEventType::ConnectionFailed), 1);
    }

    #[tokio::test]
    async fn execute_requires_a_session() {
        let (session, _audit) = session(Arc::new(FakeTransport::new()));
        assert_eq!(
            session.execute("show version").await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn failed_probe_triggers_reconnect() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();

        transport.break_link();
        let out = session.execute("show version").await.unwrap();
        assert_eq!(out, "output of show version");

        assert_eq!(transport.opens(), 2);
        assert_eq!(audit.count(AuditEventType::ConnectionLost), 1);
        assert_eq!(audit.count(AuditEventType::ReconnectAttempt), 1);
        assert_eq!(audit.count(AuditEventType::ConnectionEstablished), 2);
        assert_eq!(session.status().reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn exhausted_reconnects_are_fatal_and_final() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();

        transport.break_link();
        transport.fail_next_opens(TransportError::Timeout, 3);

        let err = session.execute("show version").await.unwrap_err();
        assert_eq!(
            err,
            ConnectionError::ConnectionLost {
                host: "10.0.0.1".into(),
                attempts: 3
            }
        );
        assert_eq!(transport.opens(), 4);
        assert_eq!(audit.count(AuditEventType::ReconnectAttempt), 3);
        assert_eq!(audit.count(AuditEventType::ConnectionFailed), 3);

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(status.reconnect_attempts, 3);

        // budget spent: no further attempts
        let err = session.execute("show version").await.unwrap_err();
        assert_eq!(err.category(), "connection_lost");
        assert_eq!(transport.opens(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_reconnect() {
        let mut fake = FakeTransport::new();
        fake.open_delay = Duration::from_millis(100);
        let transport = Arc::new(fake);
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();
        transport.break_link();

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.execute(&format!("show int {}", i)).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(transport.opens(), 2);
        assert_eq!(audit.count(AuditEventType::ReconnectAttempt), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_see_exhaustion_once() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();
        transport.break_link();
        transport.fail_next_opens(TransportError::Other("unreachable".into()), 10);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.execute("show version").await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert_eq!(err.category(), "connection_lost");
        }

        assert_eq!(transport.opens(), 1 + 3);
        assert_eq!(audit.count(AuditEventType::ReconnectAttempt), 3);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));

        // never connected: nothing to log
        session.disconnect().await;
        assert_eq!(audit.count(AuditEventType::Disconnected), 0);

        session.connect(target()).await.unwrap();
        session.disconnect().await;
        session.disconnect().await;

        assert_eq!(audit.count(AuditEventType::Disconnected), 1);
        let status = session.status();
        assert_eq!(status.state, SessionState::Disconnected);
        assert!(status.host.is_none());
        assert_eq!(
            session.execute("show version").await,
            Err(ConnectionError::NotConnected)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_is_readable_during_execute() {
        let transport = Arc::new(FakeTransport::new());
        let (session, _audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();

        let running = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.execute("slow").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let status = session.status();
        assert_eq!(status.state, SessionState::Connected);
        // the command still holds the session
        assert_eq!(session.check_liveness().await, None);

        assert_eq!(running.await.unwrap().unwrap(), "slow output");
    }

    #[tokio::test]
    async fn command_timeouts_are_distinguished() {
        let transport = Arc::new(FakeTransport::new());
        let (session, _audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();

        let err = session.execute("hang").await.unwrap_err();
        assert!(matches!(err, ConnectionError::CommandTimeout { secs: 1, .. }));

        let err = session.execute("partial").await.unwrap_err();
        assert_eq!(err.category(), "pattern_mismatch");
        assert!(err.to_string().contains("piped"));

        // neither failure drops the connection
        let status = session.status();
        assert_eq!(status.state, SessionState::Connected);
        assert!(status.last_error.is_some());
        assert!(session.execute("show clock").await.is_ok());
        assert!(session.status().last_error.is_none());
    }

    #[tokio::test]
    async fn liveness_check_never_reconnects() {
        let transport = Arc::new(FakeTransport::new());
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();

        assert_eq!(session.check_liveness().await, Some(true));
        transport.break_link();
        assert_eq!(session.check_liveness().await, Some(false));

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert!(!status.alive);
        assert_eq!(transport.opens(), 1);
        assert_eq!(audit.count(AuditEventType::ConnectionLost), 1);

        // already failed: no second transition
        assert_eq!(session.check_liveness().await, Some(false));
        assert_eq!(audit.count(AuditEventType::ConnectionLost), 1);
    }

    #[tokio::test]
    async fn connect_timeout_via_mock_transport() {
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .times(1)
            .returning(|_, _| Err(TransportError::Timeout));
        let session = DeviceSession::new(Arc::new(transport), test_settings(), audit());

        let err = session.connect(target()).await.unwrap_err();
        assert_eq!(
            err,
            ConnectionError::Timeout {
                host: "10.0.0.1".into(),
                port: 22,
                secs: 1
            }
        );
        assert!(err.to_string().contains("ping 10.0.0.1"));
    }

    #[tokio::test]
    async fn probe_runs_before_every_command() {
        let mut connection = MockConnection::new();
        let mut seq = mockall::Sequence::new();
        connection
            .expect_send()
            .withf(|cmd, _| cmd == "show clock")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("12:00".to_string()));
        connection
            .expect_send()
            .withf(|cmd, _| cmd == "show ip route")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("routes".to_string()));
        connection.expect_close().returning(|| Ok(()));

        let connection: Box<dyn Connection> = Box::new(connection);
        let mut transport = MockTransport::new();
        transport
            .expect_open()
            .times(1)
            .return_once(move |_, _| Ok(connection));

        let session = DeviceSession::new(Arc::new(transport), test_settings(), audit());
        session.connect(target()).await.unwrap();
        assert_eq!(session.execute("show ip route").await.unwrap(), "routes");
        session.disconnect().await;
    }

    fn slow_transport() -> Arc<FakeTransport> {
        Arc::new(FakeTransport {
            open_delay: Duration::from_millis(300),
            ..FakeTransport::new()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_reconnect_leaves_session_failed() {
        let transport = slow_transport();
        let (session, audit) = session(Arc::clone(&transport));
        session.connect(target()).await.unwrap();
        transport.break_link();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), session.execute("show version")).await;
        assert!(cancelled.is_err());

        let status = session.status();
        assert_eq!(status.state, SessionState::Failed);
        assert!(!status.connected);
        assert!(status.last_error.unwrap().contains("interrupted"));
        assert_eq!(audit.count(AuditEventType::ConnectionFailed), 1);

        let out = session.execute("show version").await.unwrap();
        assert_eq!(out, "output of show version");
        assert_eq!(transport.opens(), 3);
        assert_eq!(session.status().state, SessionState::Connected);
        assert_eq!(session.status().reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_connect_can_be_retried() {
        let transport = slow_transport();
        let (session, _audit) = session(Arc::clone(&transport));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), session.connect(target())).await;
        assert!(cancelled.is_err());
        assert_eq!(session.status().state, SessionState::Failed);

        assert_eq!(session.execute("show version").await.unwrap(), "output of show version");
        assert_eq!(transport.opens(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_attempt_counts_against_the_budget() {
        let transport = slow_transport();
        let audit = audit();
        let settings = SessionSettings {
            max_reconnect_attempts: 1,
            ..test_settings()
        };
        let session = DeviceSession::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            settings,
            Arc::clone(&audit),
        );
        session.connect(target()).await.unwrap();
        transport.break_link();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(50), session.execute("show version")).await;
        assert!(cancelled.is_err());

        let err = session.execute("show version").await.unwrap_err();
        assert_eq!(
            err,
            ConnectionError::ConnectionLost {
                host: "10.0.0.1".to_string(),
                attempts: 1,
            }
        );
        assert_eq!(session.status().state, SessionState::Failed);
    }
}
