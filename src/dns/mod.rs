pub mod control_zone;
pub mod framing;
pub mod proxy_handler;
pub mod upstream;

pub use proxy_handler::ProxyContext;
