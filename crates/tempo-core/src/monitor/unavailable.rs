use async_trait::async_trait;

use super::{IdleProbe, WindowInfo, WindowProbe};
use crate::error::ProbeError;

/// Probe for platforms without a window/idle backend
#[derive(Debug, Clone)]
pub struct UnavailableProbe {
    platform: String,
}

impl UnavailableProbe {
    #[must_use]
    pub fn new(platform: &str) -> Self {
        Self {
            platform: platform.to_string(),
        }
    }

    fn error(&self) -> ProbeError {
        ProbeError::Unavailable(format!("no activity probe for {}", self.platform))
    }
}

#[async_trait]
impl WindowProbe for UnavailableProbe {
    async fn poll(&self) -> Result<WindowInfo, ProbeError> {
        Err(self.error())
    }
}

#[async_trait]
impl IdleProbe for UnavailableProbe {
    async fn idle_seconds(&self) -> Result<u64, ProbeError> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_always_unavailable() {
        let probe = UnavailableProbe::new("plan9");
        assert!(matches!(probe.poll().await, Err(ProbeError::Unavailable(_))));
        assert!(matches!(
            probe.idle_seconds().await,
            Err(ProbeError::Unavailable(msg)) if msg.contains("plan9")
        ));
    }
}
