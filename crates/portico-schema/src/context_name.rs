//! Canonical, versioned naming of deployable application contexts.
//!
//! The same identity has four spellings:
//!
//! | form           | root       | `/shop` v2     |
//! |----------------|------------|----------------|
//! | `name`         | `""`       | `/shop##2`     |
//! | `path`         | `""`       | `/shop`        |
//! | `base_name`    | `ROOT`     | `shop##2`      |
//! | `display_name` | `/`        | `/shop##2`     |
//!
//! `base_name` is what deployment scanners see on disk (`shop##2.war`), so any
//! scanner must go through [`ContextName::new`] to stay consistent with the
//! names containers are registered under.

use serde::Serialize;
use std::fmt;

/// Separates the path part of a context name from its version.
pub const VERSION_MARKER: &str = "##";

/// Base name used on disk for the root context.
pub const ROOT_NAME: &str = "ROOT";

const STRIPPED_EXTENSIONS: [&str; 2] = [".war", ".xml"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContextName {
    base_name: String,
    path: String,
    version: String,
    name: String,
}

impl ContextName {
    /// Parse a raw identifier: a context path, a display name, or an artifact
    /// file name such as `shop##2.war`.
    pub fn new(raw: &str, strip_file_extension: bool) -> Self {
        let trimmed = raw.strip_prefix('/').unwrap_or(raw);
        let mut base = trimmed.replace('/', "#");

        if strip_file_extension && has_stripped_extension(&base) {
            base.truncate(base.len() - 4);
        }

        if base.is_empty() || base.starts_with(VERSION_MARKER) {
            base.insert_str(0, ROOT_NAME);
        }

        let (path_part, version) = match base.find(VERSION_MARKER) {
            Some(idx) => (
                &base[..idx],
                base[idx + VERSION_MARKER.len()..].to_owned(),
            ),
            None => (base.as_str(), String::new()),
        };

        let path = if path_part == ROOT_NAME {
            String::new()
        } else {
            format!("/{}", path_part.replace('#', "/"))
        };

        let name = join_version(&path, &version);

        Self {
            base_name: base,
            path,
            version,
            name,
        }
    }

    /// Build from an explicit path and version. `"/"` and `"/ROOT"` both mean
    /// the root context; an empty version means unversioned.
    pub fn from_parts(path: &str, version: &str) -> Self {
        let path = if path.is_empty() || path == "/" || path == "/ROOT" {
            String::new()
        } else {
            path.to_owned()
        };
        let version = version.to_owned();
        let name = join_version(&path, &version);

        let mut base_name = if path.is_empty() {
            ROOT_NAME.to_owned()
        } else {
            path.strip_prefix('/').unwrap_or(&path).replace('/', "#")
        };
        if !version.is_empty() {
            base_name.push_str(VERSION_MARKER);
            base_name.push_str(&version);
        }

        Self {
            base_name,
            path,
            version,
            name,
        }
    }

    /// Derive the context name from the location of a deployment artifact,
    /// e.g. `/srv/webapps/shop##2.war` or `C:\webapps\shop\`.
    pub fn from_artifact_path(location: &str) -> Self {
        let normalized = location.replace('\\', "/");
        let trimmed = normalized.strip_suffix('/').unwrap_or(&normalized);
        let last = match trimmed.rfind('/') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        };
        Self::new(last, true)
    }

    /// Canonical `path[##version]` form.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context path; empty for the root context.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Version; empty when unversioned.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Filesystem-safe encoding used for deployment artifacts.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn display_name(&self) -> String {
        let mut out = if self.path.is_empty() {
            "/".to_owned()
        } else {
            self.path.clone()
        };
        if !self.version.is_empty() {
            out.push_str(VERSION_MARKER);
            out.push_str(&self.version);
        }
        out
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }
}

impl fmt::Display for ContextName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

fn has_stripped_extension(base: &str) -> bool {
    base.len() >= 4
        && base
            .get(base.len() - 4..)
            .is_some_and(|ext| STRIPPED_EXTENSIONS.iter().any(|s| ext.eq_ignore_ascii_case(s)))
}

fn join_version(path: &str, version: &str) -> String {
    if version.is_empty() {
        path.to_owned()
    } else {
        format!("{path}{VERSION_MARKER}{version}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versioned_path() {
        let cn = ContextName::new("/test##3", true);
        assert_eq!(cn.path(), "/test");
        assert_eq!(cn.version(), "3");
        assert_eq!(cn.name(), "/test##3");
        assert_eq!(cn.base_name(), "test##3");
        assert_eq!(cn.display_name(), "/test##3");
    }

    #[test]
    fn empty_is_root() {
        let cn = ContextName::new("", true);
        assert_eq!(cn.base_name(), "ROOT");
        assert_eq!(cn.path(), "");
        assert_eq!(cn.version(), "");
        assert_eq!(cn.name(), "");
        assert_eq!(cn.display_name(), "/");
        assert!(cn.is_root());
    }

    #[test]
    fn slash_is_root() {
        let cn = ContextName::new("/", false);
        assert!(cn.is_root());
        assert_eq!(cn.base_name(), "ROOT");
    }

    #[test]
    fn versioned_root() {
        let cn = ContextName::new("##7", false);
        assert_eq!(cn.base_name(), "ROOT##7");
        assert_eq!(cn.path(), "");
        assert_eq!(cn.version(), "7");
        assert_eq!(cn.name(), "##7");
        assert_eq!(cn.display_name(), "/##7");
    }

    #[test]
    fn nested_war_path() {
        let cn = ContextName::new("/a/b.war", true);
        assert_eq!(cn.base_name(), "a#b");
        assert_eq!(cn.path(), "/a/b");
    }

    #[test]
    fn extension_strip_is_case_insensitive() {
        assert_eq!(ContextName::new("shop.WAR", true).path(), "/shop");
        assert_eq!(ContextName::new("shop.Xml", true).path(), "/shop");
    }

    #[test]
    fn extension_kept_without_flag() {
        let cn = ContextName::new("shop.war", false);
        assert_eq!(cn.base_name(), "shop.war");
        assert_eq!(cn.path(), "/shop.war");
    }

    #[test]
    fn unknown_extension_untouched() {
        let cn = ContextName::new("shop.jar", true);
        assert_eq!(cn.base_name(), "shop.jar");
    }

    #[test]
    fn strip_removes_only_four_chars() {
        let cn = ContextName::new("app##1.0.war", true);
        assert_eq!(cn.base_name(), "app##1.0");
        assert_eq!(cn.version(), "1.0");
    }

    #[test]
    fn root_war() {
        let cn = ContextName::new("ROOT.war", true);
        assert!(cn.is_root());
        assert_eq!(cn.name(), "");
    }

    #[test]
    fn bare_extension_is_root() {
        for raw in [".war", "/.xml", "##2.war"] {
            let cn = ContextName::new(raw, true);
            assert!(cn.is_root(), "{raw}");
            assert!(cn.base_name().starts_with("ROOT"));
            assert_eq!(ContextName::new(cn.base_name(), false), cn);
            assert_eq!(ContextName::from_parts(cn.path(), cn.version()), cn);
        }
    }

    #[test]
    fn root_lookalike_is_not_root() {
        let cn = ContextName::new("/ROOT/x", false);
        assert_eq!(cn.path(), "/ROOT/x");
        assert_eq!(cn.base_name(), "ROOT#x");
    }

    #[test]
    fn from_parts_matches_parse() {
        let a = ContextName::from_parts("/foo/bar", "2");
        let b = ContextName::new("foo#bar##2.war", true);
        assert_eq!(a, b);
    }

    #[test]
    fn from_parts_normalizes_root() {
        for path in ["", "/", "/ROOT"] {
            let cn = ContextName::from_parts(path, "");
            assert!(cn.is_root(), "{path} should be root");
            assert_eq!(cn.base_name(), "ROOT");
            assert_eq!(cn.display_name(), "/");
        }
    }

    #[test]
    fn from_artifact_path_takes_last_segment() {
        let cn = ContextName::from_artifact_path("/srv/webapps/shop##2.war");
        assert_eq!(cn.path(), "/shop");
        assert_eq!(cn.version(), "2");

        let dir = ContextName::from_artifact_path(r"C:\webapps\ROOT\");
        assert!(dir.is_root());
    }

    #[test]
    fn canonical_name_round_trips() {
        let raws = [
            "",
            "/",
            "ROOT",
            "/shop",
            "/shop##2",
            "##9",
            "a/b/c",
            "/a#b.xml",
            "foo##1.2##x",
            "deep/er##v2.war",
        ];
        for raw in raws {
            let first = ContextName::new(raw, true);
            let again = ContextName::new(first.name(), false);
            assert_eq!(first.path(), again.path(), "path for {raw}");
            assert_eq!(first.version(), again.version(), "version for {raw}");
        }
    }

    #[test]
    fn display_uses_display_name() {
        assert_eq!(ContextName::new("", false).to_string(), "/");
        assert_eq!(ContextName::new("x##1", false).to_string(), "/x##1");
    }
}
