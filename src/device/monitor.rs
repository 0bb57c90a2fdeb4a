//! Background liveness monitor

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::session::DeviceSession;
use crate::config::{ConnectionConfig, parse_duration};

/// Probes the session on a fixed interval. Never reconnects; a dead link
/// moves the session to `Failed` and the next command takes the
/// reconnect path.
#[derive(Debug)]
pub struct LivenessMonitor {
    session: Arc<DeviceSession>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(session: Arc<DeviceSession>, interval: Duration) -> Self {
        Self { session, interval }
    }

    /// `None` when `connection.liveness_interval` is unset.
    pub fn from_config(
        session: Arc<DeviceSession>,
        config: &ConnectionConfig,
    ) -> Result<Option<Self>> {
        let interval = config.liveness_interval.trim();
        if interval.is_empty() {
            return Ok(None);
        }
        let interval = parse_duration(interval)
            .map_err(|e| anyhow::anyhow!("Invalid liveness interval: {}", e))?;
        if interval.is_zero() {
            return Ok(None);
        }
        Ok(Some(Self::new(session, interval)))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run the probe loop until the task is aborted.
    pub async fn run(&self) {
        info!("Starting liveness monitor with interval: {:?}", self.interval);

        loop {
            sleep(self.interval).await;
            self.run_once().await;
        }
    }

    /// One probe. `None` when the session was busy or not connected.
    pub async fn run_once(&self) -> Option<bool> {
        if !self.session.status().connected {
            debug!("Liveness check skipped: not connected");
            return None;
        }

        match self.session.check_liveness().await {
            Some(true) => {
                debug!("Liveness: OK");
                Some(true)
            }
            Some(false) => {
                warn!("Liveness probe failed; next command will reconnect");
                Some(false)
            }
            None => None,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{FakeTransport, SessionState, Target, test_settings};
    use crate::security::{AuditLogger, AuditSettings};

    fn session(transport: Arc<FakeTransport>) -> Arc<DeviceSession> {
        let audit = Arc::new(AuditLogger::new(AuditSettings::memory_only()).unwrap());
        Arc::new(DeviceSession::new(transport, test_settings(), audit))
    }

    #[test]
    fn interval_from_config() {
        let s = session(Arc::new(FakeTransport::new()));
        let mut config = ConnectionConfig::default();
        assert!(LivenessMonitor::from_config(Arc::clone(&s), &config).unwrap().is_none());

        config.liveness_interval = "90s".to_string();
        let monitor = LivenessMonitor::from_config(Arc::clone(&s), &config)
            .unwrap()
            .unwrap();
        assert_eq!(monitor.interval(), Duration::from_secs(90));

        config.liveness_interval = "99999999999999999h".to_string();
        let err = LivenessMonitor::from_config(Arc::clone(&s), &config).unwrap_err();
        assert!(err.to_string().contains("Invalid liveness interval"));

        config.liveness_interval = "soon".to_string();
        assert!(LivenessMonitor::from_config(s, &config).is_err());
    }

    #[tokio::test]
    async fn run_once_marks_dead_link() {
        let transport = Arc::new(FakeTransport::new());
        let s = session(Arc::clone(&transport));
        let monitor = LivenessMonitor::new(Arc::clone(&s), Duration::from_secs(60));

        assert_eq!(monitor.run_once().await, None);

        s.connect(Target::new("10.0.0.1", "netops", "pw")).await.unwrap();
        assert_eq!(monitor.run_once().await, Some(true));

        transport.break_link();
        assert_eq!(monitor.run_once().await, Some(false));
        assert_eq!(s.status().state, SessionState::Failed);
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test]
    async fn spawned_monitor_probes_in_background() {
        let transport = Arc::new(FakeTransport::new());
        let s = session(Arc::clone(&transport));
        s.connect(Target::new("10.0.0.1", "netops", "pw")).await.unwrap();
        transport.break_link();

        let handle = LivenessMonitor::new(Arc::clone(&s), Duration::from_millis(20)).spawn();
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.abort();

        assert_eq!(s.status().state, SessionState::Failed);
    }
}
