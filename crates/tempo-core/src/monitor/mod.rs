use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ProbeError;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "linux")]
pub mod linux;

pub mod unavailable;

/// Foreground window as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowInfo {
    pub app_name: String,
    pub window_title: Option<String>,
}

/// Foreground window query
#[async_trait]
pub trait WindowProbe: Send + Sync {
    async fn poll(&self) -> Result<WindowInfo, ProbeError>;
}

/// Time since the last keyboard or pointer input
#[async_trait]
pub trait IdleProbe: Send + Sync {
    async fn idle_seconds(&self) -> Result<u64, ProbeError>;
}

/// The pair of probes the sampler polls
#[derive(Clone)]
pub struct Probes {
    pub window: Arc<dyn WindowProbe>,
    pub idle: Arc<dyn IdleProbe>,
}

/// Create platform-specific probes. Chosen once at startup.
#[must_use]
pub fn create_probes() -> Probes {
    #[cfg(target_os = "macos")]
    {
        Probes {
            window: Arc::new(macos::MacOSWindowProbe),
            idle: Arc::new(macos::MacOSIdleProbe),
        }
    }

    #[cfg(target_os = "linux")]
    {
        Probes {
            window: Arc::new(linux::LinuxWindowProbe),
            idle: Arc::new(linux::LinuxIdleProbe),
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let probe = Arc::new(unavailable::UnavailableProbe::new(std::env::consts::OS));
        Probes {
            window: probe.clone(),
            idle: probe,
        }
    }
}

/// Run a helper binary and return its trimmed stdout.
/// A missing binary means the probe is unavailable on this machine.
#[cfg(any(target_os = "macos", target_os = "linux"))]
pub(crate) async fn run_command(program: &str, args: &[&str]) -> Result<String, ProbeError> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                ProbeError::Unavailable(format!("{program} is not installed"))
            }
            _ => ProbeError::Failed(format!("{program}: {e}")),
        })?;

    if !output.status.success() {
        return Err(ProbeError::Failed(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
