pub mod http;
pub mod socks;

pub use http::{FetchOptions, HttpClient};
pub use socks::{grab_banner, ProxyConnector, BANNER_CAP};
