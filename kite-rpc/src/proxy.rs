//! Client-side invocation proxy
//!
//! [`RpcClientProxy`] turns a method call into an [`RpcRequest`], hands it to
//! the configured transport and validates the correlated response. Typed stubs
//! are generated with [`rpc_client!`](crate::rpc_client).

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use kite_core::config::ClientConfig;
use kite_core::resilience::CallPolicy;
use kite_core::{Error, RequestId, Result, RpcRequest, RpcResponse};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::transport::RpcRequestTransport;

/// Group, version and call policy a client addresses a service with
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub group: String,
    pub version: String,
    pub policy: CallPolicy,
}

impl ServiceOptions {
    /// Options with the call policy from the global `client` section
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&kite_core::config::global().client)
    }

    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            group: String::new(),
            version: String::new(),
            policy: CallPolicy::from(config),
        }
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

    #[must_use]
    pub const fn with_policy(mut self, policy: CallPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Static description of one remote method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub interface_name: &'static str,
    pub method_name: &'static str,
    pub param_types: &'static [&'static str],
}

pub struct RpcClientProxy {
    transport: Arc<dyn RpcRequestTransport>,
    options: ServiceOptions,
}

impl RpcClientProxy {
    pub fn new(transport: Arc<dyn RpcRequestTransport>, options: ServiceOptions) -> Self {
        Self { transport, options }
    }

    /// Proxy using the transport named by the global configuration
    pub fn from_extensions(options: ServiceOptions) -> Result<Self> {
        let name = &kite_core::config::global().extension.transport;
        let transport = crate::extension::global().get::<dyn RpcRequestTransport>(name)?;
        Ok(Self::new(transport, options))
    }

    #[must_use]
    pub const fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Invoke `method` remotely and return the response payload.
    ///
    /// Each attempt carries a fresh request id. Only retryable failures are
    /// attempted again, as many times as the call policy allows.
    pub async fn invoke(&self, method: &MethodDescriptor, params: Vec<Value>) -> Result<Value> {
        let policy = &self.options.policy;
        let backoff = policy.backoff().build();

        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(backoff) {
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }

            match self.attempt(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!(
                        interface = method.interface_name,
                        method = method.method_name,
                        error = %e,
                        "Remote call failed, retrying"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::Transport(format!("No attempt made for {}", method.interface_name))
        }))
    }

    /// Invoke `method` and deserialize the payload into `T`
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &MethodDescriptor,
        params: Vec<Value>,
    ) -> Result<T> {
        let value = self.invoke(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn attempt(&self, method: &MethodDescriptor, params: Vec<Value>) -> Result<Value> {
        let request = self.build_request(method, params);
        let request_id = request.request_id.clone();
        debug!(
            request_id = %request_id,
            interface = method.interface_name,
            method = method.method_name,
            "Invoking remote method"
        );

        let exchange = async {
            let dispatch = self.transport.send(request).await?;
            dispatch.resolve().await
        };
        let response = match self.options.policy.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange).await.map_err(|_| {
                Error::Timeout(format!(
                    "{}.{} did not answer within {limit:?}",
                    method.interface_name, method.method_name
                ))
            })??,
            None => exchange.await?,
        };

        check(method.interface_name, &request_id, response)
    }

    fn build_request(&self, method: &MethodDescriptor, params: Vec<Value>) -> RpcRequest {
        RpcRequest::new(method.interface_name, method.method_name)
            .with_parameters(params)
            .with_param_types(method.param_types.iter().copied())
            .with_group(self.options.group.clone())
            .with_version(self.options.version.clone())
    }
}

/// Validate a response against the request it should answer
fn check(interface: &str, request_id: &RequestId, response: Option<RpcResponse>) -> Result<Value> {
    let Some(response) = response else {
        return Err(Error::ResponseMissing {
            interface: interface.to_string(),
        });
    };
    if response.request_id != *request_id {
        return Err(Error::RequestMismatch {
            interface: interface.to_string(),
            expected: request_id.to_string(),
            actual: response.request_id.to_string(),
        });
    }
    if !response.is_success() {
        return Err(Error::InvocationFailed {
            interface: interface.to_string(),
            message: response.message,
        });
    }
    Ok(response.data.unwrap_or(Value::Null))
}

/// Generate a typed client stub over [`RpcClientProxy`].
///
/// ```ignore
/// rpc_client! {
///     pub struct GreeterClient for "demo.Greeter" {
///         fn hello(name: String) -> String;
///     }
/// }
///
/// let greeter = GreeterClient::new(proxy);
/// let reply = greeter.hello("alice".to_string()).await?;
/// ```
#[macro_export]
macro_rules! rpc_client {
    (
        $vis:vis struct $name:ident for $interface:literal {
            $( fn $method:ident ( $( $arg:ident : $ty:ty ),* $(,)? ) -> $ret:ty ; )*
        }
    ) => {
        $vis struct $name {
            proxy: $crate::proxy::RpcClientProxy,
        }

        impl $name {
            pub const INTERFACE: &'static str = $interface;

            pub fn new(proxy: $crate::proxy::RpcClientProxy) -> Self {
                Self { proxy }
            }

            $(
                pub async fn $method(&self, $( $arg: $ty ),*) -> $crate::__private::Result<$ret> {
                    const METHOD: $crate::proxy::MethodDescriptor = $crate::proxy::MethodDescriptor {
                        interface_name: $interface,
                        method_name: stringify!($method),
                        param_types: &[$( stringify!($ty) ),*],
                    };
                    let params = vec![$( $crate::__private::serde_json::to_value(&$arg)? ),*];
                    self.proxy.call(&METHOD, params).await
                }
            )*
        }
    };
}
