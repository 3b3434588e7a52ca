mod config;

pub use config::{
    AppConfig, CatalogConfig, MetricsConfig, ReconnectConfig, RequestConfig, RetryConfig,
    ServerConfig, UeConfig,
};
