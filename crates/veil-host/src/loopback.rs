//! Loopback relay engine
//!
//! Stands in for a real cipher engine: completes a simulated handshake after
//! a fixed delay and echoes every packet back unchanged.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use veil_tunnel::{RelayEngine, RelaySink, StartRequest, TunnelError};

pub struct LoopbackRelay {
    handshake: Duration,
    state: Mutex<Option<Running>>,
}

struct Running {
    sink: RelaySink,
    handshake: JoinHandle<()>,
}

impl LoopbackRelay {
    pub fn new(handshake: Duration) -> Self {
        Self {
            handshake,
            state: Mutex::new(None),
        }
    }
}

impl RelayEngine for LoopbackRelay {
    fn start(&self, request: StartRequest) -> Result<(), TunnelError> {
        if request.configuration.obfuscation != "plain"
            && request.configuration.obfuscation_param.is_none()
        {
            return Err(TunnelError::Obfuscation(format!(
                "'{}' needs a parameter",
                request.configuration.obfuscation
            )));
        }

        info!(
            "Loopback relay starting for {} ({})",
            request.configuration.endpoint(),
            request.configuration.cipher
        );
        let sink = request.sink.clone();
        let delay = self.handshake;
        let handshake = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.connected();
        });

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = state.replace(Running {
            sink: request.sink,
            handshake,
        }) {
            previous.handshake.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        let running = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            running.handshake.abort();
            debug!("Loopback relay stopped (epoch {})", running.sink.epoch());
            running.sink.stopped();
        }
    }

    fn process_packet(&self, data: &[u8], _protocol: u32) -> Result<Option<Vec<u8>>, TunnelError> {
        Ok(Some(data.to_vec()))
    }

    fn average_latency(&self) -> Option<Duration> {
        Some(self.handshake)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use veil_tunnel::{
        LinkType, ManualPathSource, MemoryInterface, NetworkPath, TunnelConfiguration,
        TunnelController, TunnelStatus,
    };

    #[tokio::test(start_paused = true)]
    async fn test_loopback_connects_after_handshake() {
        let (interface, _packets) = MemoryInterface::new();
        let controller = TunnelController::builder(
            Arc::new(LoopbackRelay::new(Duration::from_millis(250))),
            Arc::new(interface),
        )
        .with_path_source(Arc::new(ManualPathSource::new(NetworkPath::satisfied(
            vec![LinkType::Wired],
        ))))
        .with_configuration(TunnelConfiguration::new("demo", "127.0.0.1", 8388))
        .spawn();

        controller.connect().await.unwrap();
        assert_eq!(controller.status().await, TunnelStatus::Connecting);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(controller.status().await, TunnelStatus::Connected);

        controller.disconnect().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(controller.status().await, TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_obfuscation_needs_parameter() {
        let (interface, _packets) = MemoryInterface::new();
        let configuration = TunnelConfiguration::new("demo", "127.0.0.1", 8388)
            .with_obfuscation("http_simple", None);
        let controller = TunnelController::builder(
            Arc::new(LoopbackRelay::new(Duration::ZERO)),
            Arc::new(interface),
        )
        .with_path_source(Arc::new(ManualPathSource::new(NetworkPath::satisfied(
            vec![LinkType::Wifi],
        ))))
        .with_configuration(configuration)
        .spawn();

        let result = controller.connect().await;
        assert!(matches!(result, Err(TunnelError::Obfuscation(_))));
    }
}
