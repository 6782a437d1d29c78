use crate::charset::CharsetMapper;
use crate::context_name::ContextName;
use crate::error_page::ErrorPage;
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub charsets: BTreeMap<String, String>,
    #[serde(default, rename = "host")]
    pub hosts: Vec<HostSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_engine_name")]
    pub name: String,
    #[serde(default = "default_host_name")]
    pub default_host: String,
    /// Seconds between background runs; zero or negative disables the thread.
    #[serde(default = "default_background_delay")]
    pub background_processor_delay_secs: i64,
    #[serde(default = "default_start_stop_threads")]
    pub start_stop_threads: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            name: default_engine_name(),
            default_host: default_host_name(),
            background_processor_delay_secs: default_background_delay(),
            start_stop_threads: default_start_stop_threads(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostSection {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default, rename = "context")]
    pub contexts: Vec<ContextSection>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContextSection {
    /// Raw identifier such as `/shop##2` or `shop##2.war`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub version: String,
    /// Servlet mapping pattern to built-in handler kind.
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
    #[serde(default, rename = "error_page")]
    pub error_pages: Vec<ErrorPageSection>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ErrorPageSection {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub exception: Option<String>,
    pub location: String,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.hosts.is_empty() {
            return Err(SchemaError::InvalidConfig(
                "at least one [[host]] is required".to_owned(),
            ));
        }
        if self.engine.start_stop_threads == 0 {
            return Err(SchemaError::InvalidConfig(
                "engine.start_stop_threads must be at least 1".to_owned(),
            ));
        }

        let mut seen = HashSet::new();
        for host in &self.hosts {
            if host.name.is_empty() {
                return Err(SchemaError::InvalidConfig(
                    "host name must not be empty".to_owned(),
                ));
            }
            if !seen.insert(host.name.to_ascii_lowercase()) {
                return Err(SchemaError::InvalidConfig(format!(
                    "duplicate host '{}'",
                    host.name
                )));
            }
            for context in &host.contexts {
                context.context_name()?;
                for page in &context.error_pages {
                    page.to_error_page()?;
                }
            }
        }

        if !self
            .hosts
            .iter()
            .any(|h| h.name.eq_ignore_ascii_case(&self.engine.default_host))
        {
            return Err(SchemaError::InvalidConfig(format!(
                "default host '{}' is not a configured host",
                self.engine.default_host
            )));
        }
        Ok(())
    }

    /// Default charset table with the `[charsets]` overrides applied.
    pub fn charset_mapper(&self) -> CharsetMapper {
        self.charsets
            .iter()
            .fold(CharsetMapper::new(), |mapper, (locale, charset)| {
                mapper.with_mapping(locale, charset)
            })
    }
}

impl ContextSection {
    pub fn context_name(&self) -> Result<ContextName, SchemaError> {
        match (&self.name, &self.path) {
            (Some(raw), None) if self.version.is_empty() => Ok(ContextName::new(raw, true)),
            (None, Some(path)) => Ok(ContextName::from_parts(path, &self.version)),
            (Some(_), Some(_)) => Err(SchemaError::InvalidConfig(
                "context must set either name or path, not both".to_owned(),
            )),
            (Some(raw), None) => Err(SchemaError::InvalidConfig(format!(
                "context '{raw}': version requires path"
            ))),
            (None, None) => Err(SchemaError::InvalidConfig(
                "context must set name or path".to_owned(),
            )),
        }
    }
}

impl ErrorPageSection {
    pub fn to_error_page(&self) -> Result<ErrorPage, SchemaError> {
        match (self.code, &self.exception) {
            (Some(code), None) => ErrorPage::for_status(code, &self.location),
            (None, Some(exception)) => ErrorPage::for_exception(exception, &self.location),
            _ => Err(SchemaError::InvalidErrorPage(format!(
                "page for '{}' must set exactly one of code or exception",
                self.location
            ))),
        }
    }
}

fn default_engine_name() -> String {
    "portico".to_owned()
}

fn default_host_name() -> String {
    "localhost".to_owned()
}

fn default_background_delay() -> i64 {
    10
}

fn default_start_stop_threads() -> usize {
    2
}

pub fn parse_config_str(input: &str) -> Result<ServerConfig, SchemaError> {
    let config: ServerConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<ServerConfig, SchemaError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let input = r#"
[engine]
name = "edge"
default_host = "example.com"
background_processor_delay_secs = 0
start_stop_threads = 4

[charsets]
de = "UTF-8"

[[host]]
name = "example.com"
aliases = ["www.example.com"]

[[host.context]]
name = "/shop##2"
responses = { "/" = "welcome", "/api/*" = "echo" }

[[host.context.error_page]]
code = 404
location = "/not-found"

[[host.context.error_page]]
exception = "shop.OutOfStock"
location = "/sold-out"

[[host.context]]
path = "/"
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.engine.name, "edge");
        assert_eq!(config.engine.background_processor_delay_secs, 0);
        assert_eq!(config.engine.start_stop_threads, 4);
        assert_eq!(config.hosts.len(), 1);

        let host = &config.hosts[0];
        assert_eq!(host.aliases, vec!["www.example.com"]);
        assert_eq!(host.contexts.len(), 2);

        let shop = host.contexts[0].context_name().unwrap();
        assert_eq!(shop.path(), "/shop");
        assert_eq!(shop.version(), "2");
        assert_eq!(host.contexts[0].responses.len(), 2);
        assert_eq!(host.contexts[0].error_pages.len(), 2);
        assert!(host.contexts[1].context_name().unwrap().is_root());

        assert_eq!(config.charset_mapper().charset("de"), Some("UTF-8"));
        assert_eq!(config.charset_mapper().charset("en"), Some("ISO-8859-1"));
    }

    #[test]
    fn parses_minimal_config() {
        let input = r#"
[[host]]
name = "localhost"
"#;
        let config = parse_config_str(input).expect("should parse");
        assert_eq!(config.engine.name, "portico");
        assert_eq!(config.engine.default_host, "localhost");
        assert_eq!(config.engine.background_processor_delay_secs, 10);
        assert_eq!(config.engine.start_stop_threads, 2);
    }

    #[test]
    fn rejects_unknown_fields() {
        let input = r#"
[[host]]
name = "localhost"
unknown_field = true
"#;
        assert!(parse_config_str(input).is_err());
    }

    #[test]
    fn rejects_missing_default_host() {
        let input = r#"
[engine]
default_host = "nowhere"

[[host]]
name = "localhost"
"#;
        let err = parse_config_str(input).unwrap_err();
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn rejects_duplicate_hosts() {
        let input = r#"
[[host]]
name = "localhost"

[[host]]
name = "LOCALHOST"
"#;
        assert!(parse_config_str(input).is_err());
    }

    #[test]
    fn rejects_no_hosts() {
        assert!(parse_config_str("").is_err());
    }

    #[test]
    fn rejects_ambiguous_error_page() {
        let input = r#"
[[host]]
name = "localhost"

[[host.context]]
path = "/a"

[[host.context.error_page]]
code = 500
exception = "x.Y"
location = "/err"
"#;
        assert!(parse_config_str(input).is_err());
    }

    #[test]
    fn rejects_context_without_identity() {
        let input = r#"
[[host]]
name = "localhost"

[[host.context]]
version = "3"
"#;
        assert!(parse_config_str(input).is_err());
    }

    #[test]
    fn parses_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portico.toml");
        fs::write(&path, "[[host]]\nname = \"localhost\"\n").unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.hosts[0].name, "localhost");
    }

    #[test]
    fn missing_config_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = parse_config_file(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, SchemaError::Io(_)));
    }
}
