use async_trait::async_trait;

use super::{run_command, IdleProbe, WindowInfo, WindowProbe};
use crate::error::ProbeError;

// Process name and window title of the same frontmost process
const FRONTMOST_SCRIPT: &str = r#"
    tell application "System Events"
        set frontProc to first application process whose frontmost is true
        set appName to name of frontProc
        try
            set winTitle to name of first window of frontProc
        on error
            set winTitle to ""
        end try
        return appName & "|" & winTitle
    end tell
"#;

pub struct MacOSWindowProbe;

/// `HIDIdleTime` from the `IOHIDSystem` registry entry
pub struct MacOSIdleProbe;

#[async_trait]
impl WindowProbe for MacOSWindowProbe {
    async fn poll(&self) -> Result<WindowInfo, ProbeError> {
        let output = run_command("osascript", &["-e", FRONTMOST_SCRIPT]).await?;
        let (app_name, title) = output.split_once('|').unwrap_or((output.as_str(), ""));
        if app_name.trim().is_empty() {
            return Err(ProbeError::Failed(String::from("no frontmost process")));
        }

        Ok(WindowInfo {
            app_name: app_name.trim().to_string(),
            window_title: Some(title.trim().to_string()).filter(|t| !t.is_empty()),
        })
    }
}

#[async_trait]
impl IdleProbe for MacOSIdleProbe {
    async fn idle_seconds(&self) -> Result<u64, ProbeError> {
        let output = run_command("ioreg", &["-c", "IOHIDSystem", "-d", "4"]).await?;
        parse_hid_idle(&output)
    }
}

/// Extract `"HIDIdleTime" = <nanoseconds>` as whole seconds
fn parse_hid_idle(output: &str) -> Result<u64, ProbeError> {
    output
        .lines()
        .find_map(|line| {
            let (_, value) = line.split_once("\"HIDIdleTime\" = ")?;
            value.trim().parse::<u64>().ok()
        })
        .map(|nanos| nanos / 1_000_000_000)
        .ok_or_else(|| ProbeError::Failed(String::from("HIDIdleTime missing from ioreg output")))
}
