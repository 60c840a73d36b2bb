//! Infrastructure layer: configuration, logging and the HTTP transport

pub mod config;
pub mod http_transport;
pub mod logging;

pub use config::{ConfigError, CrawlerConfig, HttpConfig, LoggingConfig};
pub use http_transport::HttpTransport;
pub use logging::init_logging_with_config;
