//! Proxy-aware client agents (C3): thin HTTP/HTTPS clients that drive an
//! upstream the same way a browser configured with a forward proxy would,
//! used by the test fixtures and available to embedders that want a
//! client symmetrical with the proxy side.

pub mod http_agent;
pub mod https_agent;

pub use http_agent::{HttpProxyAgent, HttpResponse};
pub use https_agent::HttpsProxyAgent;
