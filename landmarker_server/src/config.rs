use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use axum::http::{header, HeaderValue, Method};
use landmarker_content::Mode;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::BasicAuth;

/// Origin of the hosted landmarker.io client.
pub const LANDMARKER_ORIGIN: &str = "https://www.landmarker.io";
pub const DEFAULT_PORT: u16 = 5000;
/// Largest image body that is accepted by the upload endpoint.
pub const MAX_UPLOAD_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub mode: Mode,
    pub address: SocketAddr,
    /// Accept requests from every origin. Used when the client is served locally.
    pub dev: bool,
    pub auth: Option<Arc<BasicAuth>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Image,
            address: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            dev: false,
            auth: None,
        }
    }
}

impl ServerConfig {
    pub fn cors_layer(&self) -> CorsLayer {
        if self.dev {
            CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)
        } else {
            CorsLayer::new()
                .allow_origin(HeaderValue::from_static(LANDMARKER_ORIGIN))
                .allow_methods([Method::GET, Method::PUT, Method::POST, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_credentials(true)
        }
    }
}
