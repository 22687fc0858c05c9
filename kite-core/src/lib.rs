pub mod config;
pub mod error;
pub mod extension;
pub mod logging;
pub mod models;
pub mod resilience;

pub use config::KiteConfig;
pub use error::{Error, Result};
pub use extension::{ExtensionLoader, ExtensionPoint};
pub use models::{Endpoint, RequestId, RpcRequest, RpcResponse, ServiceKey};
