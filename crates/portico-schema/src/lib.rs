//! Value types shared by the Portico container core and its supervisor.
//!
//! This crate defines the leaf layer: canonical context naming (`ContextName`),
//! error page indexing with exception-hierarchy lookup (`ErrorPageSupport`),
//! the process-scoped locale charset table (`CharsetMapper`), and TOML server
//! configuration parsing (`ServerConfig`).

pub mod charset;
pub mod config;
pub mod context_name;
pub mod error_page;

pub use charset::CharsetMapper;
pub use config::{
    parse_config_file, parse_config_str, ContextSection, EngineSection, ErrorPageSection,
    HostSection, ServerConfig,
};
pub use context_name::{ContextName, ROOT_NAME, VERSION_MARKER};
pub use error_page::{ErrorPage, ErrorPageSupport, ExceptionType, DEFAULT_PAGE_CODE};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse configuration: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid error page: {0}")]
    InvalidErrorPage(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_display_invalid_error_page() {
        let e = SchemaError::InvalidErrorPage("bad location".to_owned());
        assert!(e.to_string().contains("bad location"));
    }

    #[test]
    fn schema_error_display_invalid_config() {
        let e = SchemaError::InvalidConfig("no hosts".to_owned());
        assert!(e.to_string().starts_with("invalid configuration"));
    }

    #[test]
    fn error_page_serializes() {
        let page = ErrorPage::for_status(404, "/missing").unwrap();
        let json = serde_json::to_string(&page).unwrap();
        assert!(json.contains("\"location\":\"/missing\""));
    }
}
