use std::sync::Arc;

use kite_core::{RpcRequest, RpcResponse};
use tracing::{debug, warn};

use crate::provider::ServiceProvider;

/// Dispatches a decoded request to the local service it addresses
pub struct RequestHandler {
    provider: Arc<ServiceProvider>,
}

impl RequestHandler {
    pub fn new(provider: Arc<ServiceProvider>) -> Self {
        Self { provider }
    }

    /// Always produces exactly one response; failures become `fail` responses
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let key = request.service_key();
        let result = match self.provider.get_service(&key) {
            Ok(service) => service.call(&request.method_name, request.parameters).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(data) => {
                debug!(service = %key, method = %request.method_name, "Handled request");
                RpcResponse::success(data, request.request_id)
            }
            Err(e) => {
                warn!(service = %key, method = %request.method_name, error = %e, "Request failed");
                RpcResponse::fail(request.request_id, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{RpcService, ServiceConfig};
    use crate::registry::MockServiceRegistry;
    use async_trait::async_trait;
    use kite_core::{Error, Result};
    use serde_json::{json, Value};

    struct Calculator;

    #[async_trait]
    impl RpcService for Calculator {
        fn interface_name(&self) -> &str {
            "demo.Calculator"
        }

        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
            match method {
                "add" => {
                    let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
                    Ok(json!(sum))
                }
                other => Err(Error::InvocationFailed {
                    interface: "demo.Calculator".to_string(),
                    message: format!("unknown method {other}"),
                }),
            }
        }
    }

    fn handler() -> RequestHandler {
        let provider = ServiceProvider::new(Arc::new(MockServiceRegistry::new()), 9000);
        provider.add_service(&ServiceConfig::new(Arc::new(Calculator)));
        RequestHandler::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn test_success_echoes_request_id() {
        let request = RpcRequest::new("demo.Calculator", "add").with_parameters(vec![json!(2), json!(3)]);
        let id = request.request_id.clone();

        let response = handler().handle(request).await;

        assert!(response.is_success());
        assert_eq!(response.request_id, id);
        assert_eq!(response.data, Some(json!(5)));
    }

    #[tokio::test]
    async fn test_failures_become_fail_responses() {
        let unknown_method = RpcRequest::new("demo.Calculator", "divide");
        let response = handler().handle(unknown_method).await;
        assert!(!response.is_success());
        assert!(response.message.contains("divide"));

        let unknown_service = RpcRequest::new("demo.Calculator", "add").with_version("v9");
        let response = handler().handle(unknown_service).await;
        assert!(!response.is_success());
        assert!(response.message.contains("demo.Calculatorv9"));
    }
}
