// foundry-client: Async Rust client for the Foundry bare-metal service API.
//
// The interesting machinery is the HTTP transport: two contract-equivalent
// backends (raw socket vs. pre-built session) behind one request contract,
// with API version negotiation, bounded retries, method-preserving
// redirects, and streaming response bodies. Resource managers (port groups)
// are thin glue over `Client::json_request`.

pub mod client;
pub mod endpoint;
pub mod error;
pub mod portgroup;
pub mod response;
pub mod retry;
pub mod tls;
pub mod version;

mod direct;
mod negotiate;
mod session;
mod wire;

pub use client::{Client, ClientBuilder};
pub use direct::DirectOptions;
pub use endpoint::{Endpoint, Scheme};
pub use error::Error;
pub use portgroup::{Portgroup, PortgroupListParams, PortgroupManager};
pub use response::{Body, Response};
pub use retry::RetryPolicy;
pub use tls::{ClientCert, TlsPolicy};
pub use version::{ApiVersion, ApiVersionSelectState, DEFAULT_API_VERSION, VersionCache};
