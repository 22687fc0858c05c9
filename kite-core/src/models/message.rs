use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::RequestId;
use super::service::ServiceKey;

/// Response code for a successful invocation
pub const SUCCESS_CODE: u16 = 200;
/// Response code for a failed invocation
pub const FAIL_CODE: u16 = 500;

/// One invocation sent from a client proxy to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub request_id: RequestId,
    pub interface_name: String,
    pub method_name: String,
    /// Positional arguments
    #[serde(default)]
    pub parameters: Vec<Value>,
    /// Declared parameter type names, informational only
    #[serde(default)]
    pub param_types: Vec<String>,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
}

impl RpcRequest {
    /// New request with a freshly generated id and empty group/version
    #[must_use]
    pub fn new(interface_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            interface_name: interface_name.into(),
            method_name: method_name.into(),
            parameters: Vec::new(),
            param_types: Vec::new(),
            group: String::new(),
            version: String::new(),
        }
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    #[must_use]
    pub fn with_param_types<I, S>(mut self, param_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.param_types = param_types.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Service key this request is routed by
    #[must_use]
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(&self.interface_name, &self.group, &self.version)
    }
}

/// Outcome of one invocation, correlated to its request by id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: RequestId,
    pub code: u16,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcResponse {
    #[must_use]
    pub fn success(data: Value, request_id: RequestId) -> Self {
        Self {
            request_id,
            code: SUCCESS_CODE,
            message: "The remote call is successful".to_string(),
            data: Some(data),
        }
    }

    #[must_use]
    pub fn fail(request_id: RequestId, message: impl Into<String>) -> Self {
        Self {
            request_id,
            code: FAIL_CODE,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}
