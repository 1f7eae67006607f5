//! Host-app message protocol
//!
//! JSON requests tagged by `"command"`:
//!
//! ```json
//! {"command":"getStatus"}
//! {"command":"getStatistics"}
//! {"command":"updateConfiguration","configuration":{...}}
//! ```

use crate::config::TunnelConfiguration;
use crate::controller::{StatisticsReport, TunnelController};
use crate::error::TunnelError;
use crate::status::TunnelStatus;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Request from the host app
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum HostRequest {
    GetStatus,
    GetStatistics,
    UpdateConfiguration {
        configuration: Box<TunnelConfiguration>,
    },
}

/// Reply to a [`HostRequest`]
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum HostResponse {
    Status {
        status: TunnelStatus,
    },
    Statistics(StatisticsReport),
    Outcome {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl HostResponse {
    pub fn success() -> Self {
        HostResponse::Outcome {
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        HostResponse::Outcome {
            success: false,
            error: Some(error.into()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_else(|e| {
            warn!("Failed to encode host response: {}", e);
            br#"{"success":false,"error":"response encoding failed"}"#.to_vec()
        })
    }
}

impl From<Result<(), TunnelError>> for HostResponse {
    fn from(result: Result<(), TunnelError>) -> Self {
        match result {
            Ok(()) => HostResponse::success(),
            Err(e) => HostResponse::failure(e.to_string()),
        }
    }
}

impl TunnelController {
    /// Decode a JSON request, run it and encode the reply
    pub async fn handle_message(&self, message: &[u8]) -> Vec<u8> {
        let response = match serde_json::from_slice::<HostRequest>(message) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => {
                warn!("Malformed host message: {}", e);
                HostResponse::failure(format!("malformed request: {}", e))
            }
        };
        response.to_bytes()
    }

    pub async fn handle_request(&self, request: HostRequest) -> HostResponse {
        debug!("Host request: {:?}", request);
        match request {
            HostRequest::GetStatus => HostResponse::Status {
                status: self.status().await,
            },
            HostRequest::GetStatistics => match self.statistics().await {
                Ok(report) => HostResponse::Statistics(report),
                Err(e) => HostResponse::failure(e.to_string()),
            },
            HostRequest::UpdateConfiguration { configuration } => {
                self.update_configuration(*configuration).await.into()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::MemoryInterface;
    use crate::monitor::{LinkType, ManualPathSource, NetworkPath};
    use crate::relay::{RelayEngine, StartRequest};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct InstantRelay;

    impl RelayEngine for InstantRelay {
        fn start(&self, request: StartRequest) -> Result<(), TunnelError> {
            request.sink.connected();
            Ok(())
        }

        fn stop(&self) {}

        fn process_packet(
            &self,
            data: &[u8],
            _protocol: u32,
        ) -> Result<Option<Vec<u8>>, TunnelError> {
            Ok(Some(data.to_vec()))
        }
    }

    fn controller() -> TunnelController {
        let (interface, _handle) = MemoryInterface::new();
        TunnelController::builder(Arc::new(InstantRelay), Arc::new(interface))
            .with_path_source(Arc::new(ManualPathSource::new(NetworkPath::satisfied(
                vec![LinkType::Wired],
            ))))
            .spawn()
    }

    async fn call(controller: &TunnelController, request: Value) -> Value {
        let bytes = controller
            .handle_message(request.to_string().as_bytes())
            .await;
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_get_status() {
        let controller = controller();
        let response = call(&controller, json!({"command": "getStatus"})).await;
        assert_eq!(response, json!({"status": "disconnected"}));
    }

    #[tokio::test]
    async fn test_get_statistics() {
        let controller = controller();
        let response = call(&controller, json!({"command": "getStatistics"})).await;

        assert_eq!(response["status"], "disconnected");
        assert_eq!(response["currentSession"], Value::Null);
        assert_eq!(response["counters"]["bytesReceived"], 0);
        assert_eq!(response["history"]["totalSessions"], 0);
    }

    #[tokio::test]
    async fn test_update_configuration() {
        let controller = controller();
        let request = json!({
            "command": "updateConfiguration",
            "configuration": {
                "name": "home",
                "serverAddress": "203.0.113.7",
                "port": 8388,
                "cipher": "aes-256-gcm",
                "protocol": "origin"
            }
        });
        assert_eq!(call(&controller, request).await, json!({"success": true}));

        controller.connect().await.unwrap();
        tokio::task::yield_now().await;
        let response = call(&controller, json!({"command": "getStatus"})).await;
        assert_eq!(response, json!({"status": "connected"}));
    }

    #[tokio::test]
    async fn test_invalid_configuration_reports_error() {
        let controller = controller();
        let request = json!({
            "command": "updateConfiguration",
            "configuration": {
                "name": "home",
                "serverAddress": "203.0.113.7",
                "port": 0,
                "cipher": "aes-256-gcm",
                "protocol": "origin"
            }
        });
        let response = call(&controller, request).await;
        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("port"));
    }

    #[tokio::test]
    async fn test_malformed_request() {
        let controller = controller();

        let bytes = controller.handle_message(b"{not json").await;
        let response: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response["success"], false);

        let response = call(&controller, json!({"command": "reboot"})).await;
        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().starts_with("malformed request"));
    }
}
