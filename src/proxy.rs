//! Embedded Proxy Lifecycle
//!
//! State machine for the anonymizing proxy every overlay byte must pass
//! through, and the fail-closed gate derived from it:
//!
//! ```text
//! Off ── start_if_needed ──▶ Starting
//! Starting ── socks probe ok ──▶ SocksUp
//! SocksUp ── bootstrap 100% ──▶ Bootstrapped
//! Bootstrapped ── path change / restart ──▶ Starting
//! Any ── go_dormant ──▶ Dormant ── ensure_running ──▶ Starting
//! Starting ── timeout ──▶ Failed ── start_if_needed ──▶ Starting
//! ```
//!
//! `network_permitted` is true only in `Bootstrapped` (or under the
//! development clearnet override). Every overlay send and outbound
//! connection checks this gate and fails with `ProxyNotReady` otherwise;
//! nothing leaves the device while the proxy is still building circuits.

pub mod control;

use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::{OverlayConfig, PolicyConfig};
use control::{read_cookie_hex, ControlClient, ControlError};

/// Errors from the proxy lifecycle.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy data directory not configured")]
    NotConfigured,

    #[error("SOCKS endpoint did not come up within the probe deadline")]
    SocksProbeTimeout,

    #[error("bootstrap did not reach 100% within the deadline")]
    BootstrapTimeout,

    #[error("control channel error: {0}")]
    Control(#[from] ControlError),
}

/// Proxy lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
    /// Not started.
    Off,
    /// Waiting for the SOCKS endpoint to accept connections.
    Starting,
    /// SOCKS is accepting; circuits still building.
    SocksUp,
    /// Bootstrap reported 100%; network egress permitted.
    Bootstrapped,
    /// Deliberately idle (background / low power).
    Dormant,
    /// Startup or bootstrap timed out; waiting for a retry.
    Failed,
}

impl ProxyState {
    /// Whether the bootstrap sequence is already in flight or finished.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProxyState::Starting | ProxyState::SocksUp | ProxyState::Bootstrapped
        )
    }
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyState::Off => "off",
            ProxyState::Starting => "starting",
            ProxyState::SocksUp => "socks-up",
            ProxyState::Bootstrapped => "bootstrapped",
            ProxyState::Dormant => "dormant",
            ProxyState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Probe and poll timings. Defaults match the production schedule; tests
/// shrink them.
#[derive(Clone, Debug)]
pub struct ProxyTimings {
    /// Per-attempt SOCKS connect timeout.
    pub socks_attempt_timeout: Duration,
    /// Interval between SOCKS probe attempts.
    pub socks_probe_interval: Duration,
    /// Overall SOCKS probe deadline.
    pub socks_probe_deadline: Duration,
    /// Interval between bootstrap polls.
    pub bootstrap_poll_interval: Duration,
    /// Per-iteration bootstrap poll timeout.
    pub bootstrap_poll_timeout: Duration,
    /// Overall bootstrap deadline.
    pub bootstrap_deadline: Duration,
    /// How long to wait for SOCKS to fall after a SHUTDOWN signal.
    pub shutdown_fall_deadline: Duration,
}

impl Default for ProxyTimings {
    fn default() -> Self {
        Self {
            socks_attempt_timeout: Duration::from_secs(1),
            socks_probe_interval: Duration::from_millis(250),
            socks_probe_deadline: Duration::from_secs(60),
            bootstrap_poll_interval: Duration::from_secs(1),
            bootstrap_poll_timeout: Duration::from_secs(2),
            bootstrap_deadline: Duration::from_secs(75),
            shutdown_fall_deadline: Duration::from_secs(5),
        }
    }
}

/// Owner of the proxy lifecycle and the readiness gate.
pub struct ProxyManager {
    socks_host: String,
    socks_port: u16,
    control_port: u16,
    data_dir: Option<PathBuf>,
    fail_closed: bool,
    timings: ProxyTimings,
    state: Mutex<ProxyState>,
    readiness_tx: watch::Sender<bool>,
}

impl ProxyManager {
    /// Create a manager from configuration.
    pub fn new(overlay: &OverlayConfig, policy: &PolicyConfig) -> Self {
        Self::with_timings(overlay, policy, ProxyTimings::default())
    }

    /// Create a manager with explicit timings.
    pub fn with_timings(
        overlay: &OverlayConfig,
        policy: &PolicyConfig,
        timings: ProxyTimings,
    ) -> Self {
        let (readiness_tx, _) = watch::channel(!policy.fail_closed);
        Self {
            socks_host: overlay.socks_host().to_string(),
            socks_port: overlay.socks_port(),
            control_port: overlay.control_port(),
            data_dir: overlay.data_dir().cloned(),
            fail_closed: policy.fail_closed,
            timings,
            state: Mutex::new(ProxyState::Off),
            readiness_tx,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProxyState {
        *self.state.lock().unwrap()
    }

    /// The fail-closed gate: true only when fully bootstrapped, unless
    /// the development clearnet override disabled fail-closed policy.
    pub fn network_permitted(&self) -> bool {
        !self.fail_closed || self.state() == ProxyState::Bootstrapped
    }

    /// Subscribe to readiness transitions.
    pub fn readiness(&self) -> watch::Receiver<bool> {
        self.readiness_tx.subscribe()
    }

    fn set_state(&self, next: ProxyState) {
        let mut state = self.state.lock().unwrap();
        if *state == next {
            return;
        }
        info!(from = %state, to = %next, "Proxy state transition");
        *state = next;
        drop(state);
        let _ = self.readiness_tx.send(self.network_permitted());
    }

    /// Write the proxy's configuration file into its data directory,
    /// atomically (temp file + rename), and return its path. Called
    /// before the proxy process launches so a crash mid-write never
    /// leaves a torn config behind.
    pub fn write_proxy_config(&self) -> Result<PathBuf, ProxyError> {
        let data_dir = self.data_dir.as_ref().ok_or(ProxyError::NotConfigured)?;
        std::fs::create_dir_all(data_dir).map_err(ControlError::Io)?;

        let config = format!(
            "SocksPort {}:{}\nControlPort 127.0.0.1:{}\nCookieAuthentication 1\nDataDirectory {}\n",
            self.socks_host,
            self.socks_port,
            self.control_port,
            data_dir.display(),
        );

        let path = data_dir.join("proxyrc");
        let tmp = data_dir.join("proxyrc.tmp");
        std::fs::write(&tmp, config).map_err(ControlError::Io)?;
        std::fs::rename(&tmp, &path).map_err(ControlError::Io)?;
        Ok(path)
    }

    /// Start the proxy bootstrap sequence if it is not already running.
    ///
    /// Probes SOCKS, then polls the control channel until bootstrap
    /// reports 100%. On success the readiness gate opens.
    pub async fn start_if_needed(&self) -> Result<(), ProxyError> {
        if self.state().is_running() {
            return Ok(());
        }
        self.set_state(ProxyState::Starting);
        self.run_bootstrap_sequence().await
    }

    /// Wake from dormancy (or any stopped state) and rerun the sequence.
    pub async fn ensure_running(&self) -> Result<(), ProxyError> {
        if self.state().is_running() {
            return Ok(());
        }
        self.set_state(ProxyState::Starting);
        self.run_bootstrap_sequence().await
    }

    /// Park the proxy. The readiness gate closes.
    pub fn go_dormant(&self) {
        self.set_state(ProxyState::Dormant);
    }

    /// Foreground / path-change recovery.
    ///
    /// Nudges the proxy with an `ACTIVE` signal. If the control channel is
    /// unresponsive and SOCKS is down too, the proxy process is presumed
    /// wedged: signal `SHUTDOWN`, wait for SOCKS to fall, and rerun the
    /// bootstrap sequence.
    pub async fn on_path_change(&self) -> Result<(), ProxyError> {
        match self.signal_active().await {
            Ok(()) => {
                debug!("Proxy acknowledged ACTIVE after path change");
                Ok(())
            }
            Err(error) => {
                warn!(%error, "Control channel unresponsive after path change");
                if self.socks_alive().await {
                    // SOCKS still up: the control hiccup is not fatal
                    return Ok(());
                }
                self.restart().await
            }
        }
    }

    /// Full restart: best-effort SHUTDOWN, wait for SOCKS to fall, rerun
    /// the bootstrap sequence.
    pub async fn restart(&self) -> Result<(), ProxyError> {
        if let Ok(mut client) = self.control_client().await {
            let _ = client.signal_shutdown().await;
        }

        let deadline = Instant::now() + self.timings.shutdown_fall_deadline;
        while Instant::now() < deadline {
            if !self.socks_alive().await {
                break;
            }
            sleep(self.timings.socks_probe_interval).await;
        }

        self.set_state(ProxyState::Starting);
        self.run_bootstrap_sequence().await
    }

    async fn run_bootstrap_sequence(&self) -> Result<(), ProxyError> {
        if let Err(error) = self.probe_socks().await {
            self.set_state(ProxyState::Failed);
            return Err(error);
        }
        self.set_state(ProxyState::SocksUp);

        if let Err(error) = self.poll_bootstrap().await {
            self.set_state(ProxyState::Failed);
            return Err(error);
        }
        self.set_state(ProxyState::Bootstrapped);
        Ok(())
    }

    /// Probe the loopback SOCKS endpoint until it accepts or the overall
    /// deadline passes.
    async fn probe_socks(&self) -> Result<(), ProxyError> {
        let deadline = Instant::now() + self.timings.socks_probe_deadline;
        loop {
            if self.socks_alive().await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProxyError::SocksProbeTimeout);
            }
            sleep(self.timings.socks_probe_interval).await;
        }
    }

    /// One SOCKS connect attempt under the per-attempt timeout.
    async fn socks_alive(&self) -> bool {
        timeout(
            self.timings.socks_attempt_timeout,
            TcpStream::connect((self.socks_host.as_str(), self.socks_port)),
        )
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false)
    }

    /// Poll `GETINFO status/bootstrap-phase` until 100% or deadline.
    async fn poll_bootstrap(&self) -> Result<(), ProxyError> {
        let data_dir = self.data_dir.as_ref().ok_or(ProxyError::NotConfigured)?;
        let cookie_hex = read_cookie_hex(data_dir)?;

        let deadline = Instant::now() + self.timings.bootstrap_deadline;
        let mut client: Option<ControlClient> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(ProxyError::BootstrapTimeout);
            }

            let poll = timeout(self.timings.bootstrap_poll_timeout, async {
                if client.is_none() {
                    let mut fresh = ControlClient::connect(self.control_port).await?;
                    fresh.authenticate(&cookie_hex).await?;
                    client = Some(fresh);
                }
                client
                    .as_mut()
                    .expect("client populated above")
                    .bootstrap_phase()
                    .await
            })
            .await;

            match poll {
                Ok(Ok(phase)) => {
                    debug!(progress = phase.progress, summary = %phase.summary, "Bootstrap phase");
                    if phase.is_complete() {
                        return Ok(());
                    }
                }
                Ok(Err(error)) => {
                    debug!(%error, "Bootstrap poll failed, reconnecting");
                    client = None;
                }
                Err(_) => {
                    debug!("Bootstrap poll iteration timed out");
                    client = None;
                }
            }

            sleep(self.timings.bootstrap_poll_interval).await;
        }
    }

    /// Open and authenticate a fresh control session.
    async fn control_client(&self) -> Result<ControlClient, ProxyError> {
        let data_dir = self.data_dir.as_ref().ok_or(ProxyError::NotConfigured)?;
        let cookie_hex = read_cookie_hex(data_dir)?;
        let mut client = ControlClient::connect(self.control_port).await?;
        client.authenticate(&cookie_hex).await?;
        Ok(client)
    }

    async fn signal_active(&self) -> Result<(), ProxyError> {
        let mut client = self.control_client().await?;
        client.signal_active().await?;
        Ok(())
    }
}

impl fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyManager")
            .field("state", &self.state())
            .field("socks", &format!("{}:{}", self.socks_host, self.socks_port))
            .field("control_port", &self.control_port)
            .field("fail_closed", &self.fail_closed)
            .finish()
    }
}
