//! Request and response carriers passed through valve chains.
//!
//! The connector builds these; the core only reads the request target and
//! records what it mapped along the way.

use crate::container::Container;
use portico_schema::ExceptionType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag a caller sets when it abandons a request.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A typed failure raised by a valve or servlet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exception {
    exception_type: ExceptionType,
    message: String,
}

impl Exception {
    pub fn new(exception_type: ExceptionType, message: impl Into<String>) -> Self {
        Self {
            exception_type,
            message: message.into(),
        }
    }

    pub fn exception_type(&self) -> &ExceptionType {
        &self.exception_type
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.exception_type.name(), self.message)
    }
}

impl std::error::Error for Exception {}

/// Containers selected for a request, filled in by the terminal valves.
#[derive(Clone, Default)]
pub struct MappingData {
    pub host: Option<Arc<Container>>,
    pub context: Option<Arc<Container>>,
    pub wrapper: Option<Arc<Container>>,
    pub context_path: String,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

impl fmt::Debug for MappingData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappingData")
            .field("host", &self.host.as_ref().map(|c| c.name().to_owned()))
            .field("context", &self.context.as_ref().map(|c| c.name().to_owned()))
            .field("wrapper", &self.wrapper.as_ref().map(|c| c.name().to_owned()))
            .field("context_path", &self.context_path)
            .field("servlet_path", &self.servlet_path)
            .field("path_info", &self.path_info)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    host: String,
    path: String,
    query: Option<String>,
    headers: Vec<(String, String)>,
    locale: Option<String>,
    cancellation: Option<CancellationToken>,
    attributes: BTreeMap<String, String>,
    pub mapping: MappingData,
}

impl Request {
    pub fn new(method: &str, host: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_owned())),
            None => (target, None),
        };
        let path = if path.is_empty() { "/" } else { path };
        Self {
            method: method.to_owned(),
            host: host.to_owned(),
            path: path.to_owned(),
            query,
            headers: Vec::new(),
            locale: None,
            cancellation: None,
            attributes: BTreeMap::new(),
            mapping: MappingData::default(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    #[must_use]
    pub fn with_locale(mut self, locale: &str) -> Self {
        self.locale = Some(locale.to_owned());
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Host name without any `:port` suffix.
    pub fn host(&self) -> &str {
        strip_port(&self.host)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: &str, value: impl Into<String>) {
        self.attributes.insert(name.to_owned(), value.into());
    }

    /// Point the request at another path inside the same host, dropping any
    /// mapping already done. Used for error page re-dispatch.
    pub fn forward_to(&mut self, path: &str) {
        self.path = path.to_owned();
        self.query = None;
        self.mapping = MappingData::default();
    }
}

fn strip_port(host: &str) -> &str {
    // `[::1]:8080` keeps its brackets; a bare IPv6 literal has no port.
    let (name, port) = if host.starts_with('[') {
        match host.rfind("]:") {
            Some(end) => (&host[..=end], &host[end + 2..]),
            None => return host,
        }
    } else {
        match host.split_once(':') {
            Some((name, port)) if !port.contains(':') => (name, port),
            _ => return host,
        }
    };
    if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
        name
    } else {
        host
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    charset: Option<String>,
    error: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            charset: None,
            error: false,
        }
    }
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Mark the response as an error with no body yet; the connector may
    /// replace it with an error page.
    pub fn send_error(&mut self, status: u16) {
        self.status = status;
        self.body.clear();
        self.error = true;
    }

    pub fn is_error(&self) -> bool {
        self.error
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.headers.push((name.to_owned(), value.to_owned()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn set_charset(&mut self, charset: &str) {
        self.charset = Some(charset.to_owned());
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn write_str(&mut self, text: &str) {
        self.write(text.as_bytes());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Clear body and headers while keeping the status, ahead of an error page.
    pub fn reset_body(&mut self) {
        self.body.clear();
        self.headers.clear();
        self.error = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_split_into_path_and_query() {
        let req = Request::new("GET", "example.com:8080", "/shop/cart?id=3");
        assert_eq!(req.path(), "/shop/cart");
        assert_eq!(req.query(), Some("id=3"));
        assert_eq!(req.host(), "example.com");
    }

    #[test]
    fn empty_target_is_root() {
        assert_eq!(Request::new("GET", "h", "").path(), "/");
    }

    #[test]
    fn ipv6_host_keeps_brackets() {
        assert_eq!(Request::new("GET", "[::1]:80", "/").host(), "[::1]");
        assert_eq!(Request::new("GET", "[::1]", "/").host(), "[::1]");
        assert_eq!(Request::new("GET", "::1", "/").host(), "::1");
        assert_eq!(Request::new("GET", "fe80::1:8080", "/").host(), "fe80::1:8080");
        assert_eq!(Request::new("GET", "example.com:8080", "/").host(), "example.com");
        assert_eq!(Request::new("GET", "example.com:http", "/").host(), "example.com:http");
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let req = Request::new("GET", "h", "/").with_cancellation(token.clone());
        assert!(!req.is_cancelled());
        token.cancel();
        assert!(req.is_cancelled());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let req = Request::new("GET", "h", "/").with_header("Accept-Language", "fr");
        assert_eq!(req.header("accept-language"), Some("fr"));

        let mut resp = Response::new();
        resp.set_header("Content-Type", "text/plain");
        resp.set_header("content-type", "application/json");
        assert_eq!(resp.headers().len(), 1);
        assert_eq!(resp.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn send_error_clears_body() {
        let mut resp = Response::new();
        resp.write_str("partial");
        resp.send_error(404);
        assert_eq!(resp.status(), 404);
        assert!(resp.body().is_empty());
        assert!(resp.is_error());
    }

    #[test]
    fn forward_resets_mapping() {
        let mut req = Request::new("GET", "h", "/a?x=1");
        req.mapping.context_path = "/a".to_owned();
        req.forward_to("/err");
        assert_eq!(req.path(), "/err");
        assert!(req.query().is_none());
        assert!(req.mapping.context_path.is_empty());
    }

    #[test]
    fn exception_display() {
        let e = Exception::new(ExceptionType::new("shop.OutOfStock"), "gone");
        assert_eq!(e.to_string(), "shop.OutOfStock: gone");
    }
}
