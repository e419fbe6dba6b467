pub mod context;
pub mod file_proxy;
pub mod filter;
pub mod http_proxy;
pub mod tcp_proxy;
pub mod tls;

pub use context::BoxBody;
pub use http_proxy::handle_request;
