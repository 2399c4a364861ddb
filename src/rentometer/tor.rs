use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::SessionError;

/// Line tor prints once a usable circuit exists.
const BOOTSTRAP_MARKER: &str = "Bootstrapped 100%";

const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 90;

/// Launcher for a local tor client process.
///
/// Rentometer throttles free searches per apparent origin, so the browser is
/// routed through tor and the circuit is rebuilt whenever the quota runs out.
pub struct TorClient {
    binary: String,
    socks_port: u16,
    startup_timeout: Duration,
}

impl TorClient {
    pub fn new(binary: impl Into<String>, socks_port: u16) -> Self {
        Self {
            binary: binary.into(),
            socks_port,
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
        }
    }

    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Start tor and block until it reports full circuit establishment.
    ///
    /// The wait is bounded by the startup timeout; tor exiting, closing its
    /// output stream, or running out the clock before the bootstrap marker
    /// appears all surface as `StartupFailed`.
    pub async fn start(&self) -> Result<TorProcess, SessionError> {
        info!("Starting tor on SOCKS port {}...", self.socks_port);

        let mut child = Command::new(&self.binary)
            .arg("--SocksPort")
            .arg(self.socks_port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SessionError::StartupFailed(format!("failed to spawn {}: {}", self.binary, e))
            })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SessionError::StartupFailed("tor stdout was not captured".to_string())
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let wait_for_marker = async {
            loop {
                let line = lines.next_line().await.map_err(|e| {
                    SessionError::StartupFailed(format!("failed reading tor output: {}", e))
                })?;
                match line {
                    Some(line) => {
                        debug!("tor: {}", line);
                        if line.contains(BOOTSTRAP_MARKER) {
                            return Ok(());
                        }
                    }
                    None => {
                        return Err(SessionError::StartupFailed(
                            "tor output ended before circuit establishment".to_string(),
                        ));
                    }
                }
            }
        };

        match timeout(self.startup_timeout, wait_for_marker).await {
            Ok(Ok(())) => {
                info!("✅ Tor circuit established");
                Ok(TorProcess {
                    child: Some(child),
                    socks_port: self.socks_port,
                })
            }
            Ok(Err(err)) => {
                if let Err(kill_err) = child.start_kill() {
                    warn!("Failed to kill tor after startup failure: {}", kill_err);
                }
                Err(err)
            }
            Err(_) => {
                if let Err(kill_err) = child.start_kill() {
                    warn!("Failed to kill tor after startup timeout: {}", kill_err);
                }
                Err(SessionError::StartupFailed(format!(
                    "no circuit within {:?}",
                    self.startup_timeout
                )))
            }
        }
    }
}

/// Handle to a running tor client process.
pub struct TorProcess {
    child: Option<Child>,
    socks_port: u16,
}

impl TorProcess {
    pub fn socks_port(&self) -> u16 {
        self.socks_port
    }

    /// Kill the tor process. Safe to call more than once; the process is
    /// also killed on drop if `stop` was never reached.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            info!("Stopping tor");
            if let Err(err) = child.start_kill() {
                warn!("Failed to kill tor process: {}", err);
            }
            if let Err(err) = child.wait().await {
                warn!("Failed to reap tor process: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tor_client_settings() {
        let client = TorClient::new("tor", 9050).with_startup_timeout(Duration::from_secs(5));
        assert_eq!(client.socks_port(), 9050);
        assert_eq!(client.startup_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_start_fails_for_missing_binary() {
        let client = TorClient::new("definitely-not-a-tor-binary", 19050);
        let err = client.start().await.err().expect("spawn should fail");
        assert!(matches!(err, SessionError::StartupFailed(_)));
    }
}
