//! Start the VM and wait until it accepts SSH connections.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::{ProvisionError, Result};
use crate::hypervisor::Hypervisor;

/// Port probed for readiness.
pub const SSH_PORT: u16 = 22;

/// Upper bound for a single connect attempt.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Readiness polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub port: u16,
    pub timeout: Duration,
    pub interval: Duration,
}

impl Readiness {
    /// SSH readiness with the given limits.
    #[must_use]
    pub fn ssh(timeout_secs: u64, poll_secs: u64) -> Self {
        Self {
            port: SSH_PORT,
            timeout: Duration::from_secs(timeout_secs),
            interval: Duration::from_secs(poll_secs.max(1)),
        }
    }
}

/// Start VM `vm_id`.
///
/// # Errors
/// Fails if `qm start` fails.
pub async fn start(hypervisor: &dyn Hypervisor, vm_id: u32) -> Result<()> {
    hypervisor.start_vm(vm_id).await
}

/// Stop and purge VM `vm_id`.
///
/// Stopping is best effort since the VM may already be stopped.
///
/// # Errors
/// Fails if `qm destroy` fails.
pub async fn destroy(hypervisor: &dyn Hypervisor, vm_id: u32) -> Result<()> {
    if let Err(e) = hypervisor.stop_vm(vm_id).await {
        warn!(vm_id, error = %e, "Stop failed, destroying anyway");
    }
    hypervisor.destroy_vm(vm_id).await?;
    info!(vm_id, "VM destroyed");
    Ok(())
}

/// Poll `ip:port` until a TCP connection succeeds.
///
/// # Errors
/// Returns [`ProvisionError::ReadinessTimeout`] if nothing accepts a
/// connection within the timeout.
pub async fn wait_until_ready(ip: Ipv4Addr, readiness: Readiness) -> Result<Duration> {
    let addr = SocketAddr::from((ip, readiness.port));
    let started = Instant::now();
    info!(
        %addr,
        timeout_secs = readiness.timeout.as_secs(),
        "Waiting for VM to accept connections"
    );

    loop {
        let attempt = CONNECT_ATTEMPT_TIMEOUT.min(readiness.timeout.saturating_sub(started.elapsed()));
        match tokio::time::timeout(attempt, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => {
                let waited = started.elapsed();
                info!(%addr, waited_secs = waited.as_secs(), "VM is reachable");
                return Ok(waited);
            }
            Ok(Err(e)) => debug!(%addr, error = %e, "Connection attempt failed"),
            Err(_) => debug!(%addr, "Connection attempt timed out"),
        }

        if started.elapsed() + readiness.interval > readiness.timeout {
            return Err(ProvisionError::ReadinessTimeout {
                host: ip.to_string(),
                port: readiness.port,
                timeout_secs: readiness.timeout.as_secs(),
            });
        }
        tokio::time::sleep(readiness.interval).await;
    }
}

/// How to reach a provisioned VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub vm_id: u32,
    pub vm_name: String,
    pub user: String,
    pub ip: Ipv4Addr,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  VM:     {} ({})", self.vm_name, self.vm_id)?;
        writeln!(f, "  SSH:    ssh {}@{}", self.user, self.ip)?;
        writeln!(f, "  HTTP:   http://{}", self.ip)?;
        write!(f, "  HTTPS:  https://{}", self.ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ready_when_port_open() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let readiness = Readiness {
            port,
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(50),
        };
        assert!(wait_until_ready(Ipv4Addr::LOCALHOST, readiness).await.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_when_port_closed() {
        // Bind then drop to get a port nothing listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let readiness = Readiness {
            port,
            timeout: Duration::from_millis(300),
            interval: Duration::from_millis(100),
        };
        let err = wait_until_ready(Ipv4Addr::LOCALHOST, readiness)
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::ReadinessTimeout { port: p, .. } if p == port));
    }

    #[test]
    fn test_connection_info() {
        let info = ConnectionInfo {
            vm_id: 105,
            vm_name: "test-app".into(),
            user: "admin".into(),
            ip: Ipv4Addr::new(192, 168, 3, 50),
        };
        let text = info.to_string();
        assert!(text.contains("ssh admin@192.168.3.50"));
        assert!(text.contains("http://192.168.3.50"));
        assert!(text.contains("https://192.168.3.50"));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        assert_eq!(Readiness::ssh(300, 0).interval, Duration::from_secs(1));
    }
}
