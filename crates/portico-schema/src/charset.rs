use std::collections::BTreeMap;

/// Locale-to-charset table shared read-only by every context.
///
/// Built once at startup (defaults plus configured overrides) and then handed
/// out behind an `Arc`; there is no global instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharsetMapper {
    mappings: BTreeMap<String, String>,
}

const DEFAULT_MAPPINGS: [(&str, &str); 2] = [("en", "ISO-8859-1"), ("fr", "ISO-8859-1")];

impl Default for CharsetMapper {
    fn default() -> Self {
        let mappings = DEFAULT_MAPPINGS
            .iter()
            .map(|(locale, charset)| ((*locale).to_owned(), (*charset).to_owned()))
            .collect();
        Self { mappings }
    }
}

impl CharsetMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mapper with no entries at all.
    pub fn empty() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_mapping(mut self, locale: &str, charset: &str) -> Self {
        self.mappings
            .insert(normalize_locale(locale), charset.to_owned());
        self
    }

    /// Charset for a locale such as `en-US`, `en_US` or `en`: the full locale
    /// is tried first, then its language alone.
    pub fn charset(&self, locale: &str) -> Option<&str> {
        let full = normalize_locale(locale);
        if let Some(charset) = self.mappings.get(&full) {
            return Some(charset.as_str());
        }
        let language = full.split('_').next().unwrap_or_default();
        self.mappings.get(language).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

/// `en-us` -> `en_US`.
fn normalize_locale(locale: &str) -> String {
    let mut parts = locale.trim().split(['-', '_']);
    let language = parts.next().unwrap_or_default().to_ascii_lowercase();
    match parts.next() {
        Some(country) if !country.is_empty() => {
            format!("{language}_{}", country.to_ascii_uppercase())
        }
        _ => language,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_english() {
        let mapper = CharsetMapper::new();
        assert_eq!(mapper.charset("en"), Some("ISO-8859-1"));
        assert_eq!(mapper.charset("en-GB"), Some("ISO-8859-1"));
        assert_eq!(mapper.charset("de"), None);
    }

    #[test]
    fn full_locale_beats_language() {
        let mapper = CharsetMapper::new()
            .with_mapping("zh", "GB18030")
            .with_mapping("zh_TW", "Big5");
        assert_eq!(mapper.charset("zh-tw"), Some("Big5"));
        assert_eq!(mapper.charset("zh-CN"), Some("GB18030"));
    }

    #[test]
    fn overrides_replace_defaults() {
        let mapper = CharsetMapper::new().with_mapping("EN", "UTF-8");
        assert_eq!(mapper.charset("en_US"), Some("UTF-8"));
        assert_eq!(mapper.len(), 2);
    }

    #[test]
    fn empty_mapper() {
        let mapper = CharsetMapper::empty();
        assert!(mapper.is_empty());
        assert_eq!(mapper.charset("en"), None);
    }
}
