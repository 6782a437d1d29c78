use std::collections::BTreeMap;
use std::sync::RwLock;

/// Result of mapping a context-relative path to a wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedServlet {
    pub wrapper_name: String,
    pub servlet_path: String,
    pub path_info: Option<String>,
}

#[derive(Debug, Default)]
struct Patterns {
    exact: BTreeMap<String, String>,
    // Keyed by the prefix without the trailing `/*`.
    prefix: BTreeMap<String, String>,
    extension: BTreeMap<String, String>,
    default: Option<String>,
}

/// Servlet URL patterns of one context.
///
/// Matching follows the usual precedence: exact path, longest `/prefix/*`,
/// `*.ext` on the last segment, then the `/` default.
#[derive(Debug, Default)]
pub struct ServletMappings {
    patterns: RwLock<Patterns>,
}

impl ServletMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` for `wrapper_name`, replacing any previous owner.
    pub fn add(&self, pattern: &str, wrapper_name: &str) {
        let wrapper = wrapper_name.to_owned();
        let mut patterns = self.patterns.write().expect("mapping lock poisoned");
        if pattern == "/" {
            patterns.default = Some(wrapper);
        } else if pattern == "/*" {
            patterns.prefix.insert(String::new(), wrapper);
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            patterns.prefix.insert(prefix.to_owned(), wrapper);
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            patterns.extension.insert(ext.to_owned(), wrapper);
        } else {
            patterns.exact.insert(pattern.to_owned(), wrapper);
        }
    }

    /// Drop every pattern owned by `wrapper_name`.
    pub fn remove_wrapper(&self, wrapper_name: &str) {
        let mut patterns = self.patterns.write().expect("mapping lock poisoned");
        patterns.exact.retain(|_, w| w != wrapper_name);
        patterns.prefix.retain(|_, w| w != wrapper_name);
        patterns.extension.retain(|_, w| w != wrapper_name);
        if patterns.default.as_deref() == Some(wrapper_name) {
            patterns.default = None;
        }
    }

    pub fn patterns_for(&self, wrapper_name: &str) -> Vec<String> {
        let patterns = self.patterns.read().expect("mapping lock poisoned");
        let mut found: Vec<String> = patterns
            .exact
            .iter()
            .filter(|(_, w)| *w == wrapper_name)
            .map(|(p, _)| p.clone())
            .collect();
        found.extend(
            patterns
                .prefix
                .iter()
                .filter(|(_, w)| *w == wrapper_name)
                .map(|(p, _)| format!("{p}/*")),
        );
        found.extend(
            patterns
                .extension
                .iter()
                .filter(|(_, w)| *w == wrapper_name)
                .map(|(e, _)| format!("*.{e}")),
        );
        if patterns.default.as_deref() == Some(wrapper_name) {
            found.push("/".to_owned());
        }
        found
    }

    /// Map a path relative to the context root (always starting with `/`).
    pub fn map(&self, relative: &str) -> Option<MappedServlet> {
        let patterns = self.patterns.read().expect("mapping lock poisoned");

        if let Some(wrapper) = patterns.exact.get(relative) {
            return Some(MappedServlet {
                wrapper_name: wrapper.clone(),
                servlet_path: relative.to_owned(),
                path_info: None,
            });
        }

        // Longest prefix wins; a prefix matches itself or itself plus `/...`.
        let prefix_hit = patterns
            .prefix
            .iter()
            .filter(|(prefix, _)| {
                relative == prefix.as_str()
                    || relative
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len());
        if let Some((prefix, wrapper)) = prefix_hit {
            let info = &relative[prefix.len()..];
            return Some(MappedServlet {
                wrapper_name: wrapper.clone(),
                servlet_path: prefix.clone(),
                path_info: (!info.is_empty()).then(|| info.to_owned()),
            });
        }

        let last_segment = relative.rsplit('/').next().unwrap_or_default();
        if let Some((_, ext)) = last_segment.rsplit_once('.') {
            if let Some(wrapper) = patterns.extension.get(ext) {
                return Some(MappedServlet {
                    wrapper_name: wrapper.clone(),
                    servlet_path: relative.to_owned(),
                    path_info: None,
                });
            }
        }

        patterns.default.as_ref().map(|wrapper| MappedServlet {
            wrapper_name: wrapper.clone(),
            servlet_path: relative.to_owned(),
            path_info: None,
        })
    }
}
