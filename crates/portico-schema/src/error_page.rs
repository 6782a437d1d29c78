use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Status code under which a context's default error page is registered.
pub const DEFAULT_PAGE_CODE: u16 = 0;

/// A declared exception type together with its ancestors, nearest first.
///
/// Error-producing code supplies the hierarchy explicitly; the universal root
/// type is never part of it, so it can never match an error page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionType {
    name: String,
    ancestors: Vec<String>,
}

impl ExceptionType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ancestors: Vec::new(),
        }
    }

    /// Append the next (more general) ancestor.
    #[must_use]
    pub fn extends(mut self, ancestor: impl Into<String>) -> Self {
        self.ancestors.push(ancestor.into());
        self
    }

    /// Declare `self` as a direct subtype of `parent`, inheriting its chain.
    #[must_use]
    pub fn subtype_of(name: impl Into<String>, parent: &ExceptionType) -> Self {
        let mut ancestors = Vec::with_capacity(parent.ancestors.len() + 1);
        ancestors.push(parent.name.clone());
        ancestors.extend(parent.ancestors.iter().cloned());
        Self {
            name: name.into(),
            ancestors,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// The concrete type followed by each ancestor, most specific first.
    pub fn hierarchy(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.ancestors.iter().map(String::as_str))
    }

    pub fn is_a(&self, type_name: &str) -> bool {
        self.hierarchy().any(|t| t == type_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorPage {
    error_code: u16,
    exception_type: Option<String>,
    location: String,
}

impl ErrorPage {
    pub fn for_status(error_code: u16, location: &str) -> Result<Self, SchemaError> {
        Ok(Self {
            error_code,
            exception_type: None,
            location: validate_location(location)?,
        })
    }

    pub fn for_exception(exception_type: &str, location: &str) -> Result<Self, SchemaError> {
        if exception_type.is_empty() {
            return Err(SchemaError::InvalidErrorPage(
                "exception type must not be empty".to_owned(),
            ));
        }
        Ok(Self {
            error_code: DEFAULT_PAGE_CODE,
            exception_type: Some(exception_type.to_owned()),
            location: validate_location(location)?,
        })
    }

    /// Page used when no status-specific page matches.
    pub fn default_page(location: &str) -> Result<Self, SchemaError> {
        Self::for_status(DEFAULT_PAGE_CODE, location)
    }

    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn exception_type(&self) -> Option<&str> {
        self.exception_type.as_deref()
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Key the page is indexed under.
    pub fn name(&self) -> String {
        match &self.exception_type {
            Some(t) => t.clone(),
            None => self.error_code.to_string(),
        }
    }
}

fn validate_location(location: &str) -> Result<String, SchemaError> {
    if location.starts_with('/') {
        Ok(location.to_owned())
    } else {
        Err(SchemaError::InvalidErrorPage(format!(
            "location '{location}' must start with '/'"
        )))
    }
}

/// Index of a context's error pages by status code and exception type.
///
/// Pages are owned by the deploying context; the index only holds shared
/// references. Registering a page under an existing key replaces the old one.
#[derive(Debug, Default)]
pub struct ErrorPageSupport {
    exception_pages: RwLock<HashMap<String, Arc<ErrorPage>>>,
    status_pages: RwLock<HashMap<u16, Arc<ErrorPage>>>,
}

impl ErrorPageSupport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, page: Arc<ErrorPage>) {
        match page.exception_type() {
            Some(t) => {
                let key = t.to_owned();
                self.exception_pages
                    .write()
                    .expect("exception page lock poisoned")
                    .insert(key, page);
            }
            None => {
                let code = page.error_code();
                self.status_pages
                    .write()
                    .expect("status page lock poisoned")
                    .insert(code, page);
            }
        }
    }

    pub fn remove(&self, page: &ErrorPage) {
        match page.exception_type() {
            Some(t) => {
                self.exception_pages
                    .write()
                    .expect("exception page lock poisoned")
                    .remove(t);
            }
            None => {
                self.status_pages
                    .write()
                    .expect("status page lock poisoned")
                    .remove(&page.error_code());
            }
        }
    }

    pub fn find_status(&self, status: u16) -> Option<Arc<ErrorPage>> {
        self.status_pages
            .read()
            .expect("status page lock poisoned")
            .get(&status)
            .cloned()
    }

    /// Status page, falling back to the default page.
    pub fn find_status_or_default(&self, status: u16) -> Option<Arc<ErrorPage>> {
        self.find_status(status)
            .or_else(|| self.find_status(DEFAULT_PAGE_CODE))
    }

    /// Exact lookup by exception type name.
    pub fn find_type(&self, type_name: &str) -> Option<Arc<ErrorPage>> {
        self.exception_pages
            .read()
            .expect("exception page lock poisoned")
            .get(type_name)
            .cloned()
    }

    /// Most specific registered page for a thrown exception: walks the
    /// concrete type and then its ancestors, first hit wins.
    pub fn find_exception(&self, thrown: &ExceptionType) -> Option<Arc<ErrorPage>> {
        let pages = self
            .exception_pages
            .read()
            .expect("exception page lock poisoned");
        let found = thrown.hierarchy().find_map(|t| pages.get(t).cloned());
        found
    }

    pub fn find_all(&self) -> Vec<Arc<ErrorPage>> {
        let mut seen = HashSet::new();
        let exceptions = self
            .exception_pages
            .read()
            .expect("exception page lock poisoned");
        let statuses = self.status_pages.read().expect("status page lock poisoned");
        let all = exceptions
            .values()
            .chain(statuses.values())
            .filter(|page| seen.insert(ErrorPage::clone(page)))
            .cloned()
            .collect();
        all
    }

    pub fn is_empty(&self) -> bool {
        self.exception_pages
            .read()
            .expect("exception page lock poisoned")
            .is_empty()
            && self
                .status_pages
                .read()
                .expect("status page lock poisoned")
                .is_empty()
    }
}
