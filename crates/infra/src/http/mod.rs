//! Remote HTTP plumbing shared by every connector.

pub mod client;
pub mod error;
pub mod retry;
pub mod stub;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use retry::RetryPolicy;
pub use stub::{StubReply, StubTransport};
pub use transport::{ApiRequest, ApiResponse, Auth, Body, ReqwestTransport, Transport};
