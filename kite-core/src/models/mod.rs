pub mod id;
pub mod message;
pub mod service;

pub use id::{generate_request_id, RequestId};
pub use message::{RpcRequest, RpcResponse, FAIL_CODE, SUCCESS_CODE};
pub use service::{Endpoint, ServiceKey};
