use async_trait::async_trait;

use super::{run_command, IdleProbe, WindowInfo, WindowProbe};
use crate::error::ProbeError;

/// X11 foreground window via `xdotool`; the process name comes from procfs
pub struct LinuxWindowProbe;

/// X11 idle time via `xprintidle` (milliseconds)
pub struct LinuxIdleProbe;

#[async_trait]
impl WindowProbe for LinuxWindowProbe {
    async fn poll(&self) -> Result<WindowInfo, ProbeError> {
        let pid = run_command("xdotool", &["getactivewindow", "getwindowpid"]).await?;
        let pid: u32 = pid
            .parse()
            .map_err(|_| ProbeError::Failed(format!("unexpected pid {pid:?}")))?;

        let comm = tokio::fs::read_to_string(format!("/proc/{pid}/comm"))
            .await
            .map_err(|e| ProbeError::Failed(format!("process {pid} vanished: {e}")))?;

        let title = run_command("xdotool", &["getactivewindow", "getwindowname"])
            .await
            .ok()
            .filter(|t| !t.is_empty());

        Ok(WindowInfo {
            app_name: comm.trim().to_string(),
            window_title: title,
        })
    }
}

#[async_trait]
impl IdleProbe for LinuxIdleProbe {
    async fn idle_seconds(&self) -> Result<u64, ProbeError> {
        let millis = run_command("xprintidle", &[]).await?;
        parse_idle_millis(&millis)
    }
}

fn parse_idle_millis(output: &str) -> Result<u64, ProbeError> {
    output
        .trim()
        .parse::<u64>()
        .map(|ms| ms / 1000)
        .map_err(|_| ProbeError::Failed(format!("unexpected xprintidle output {output:?}")))
}
