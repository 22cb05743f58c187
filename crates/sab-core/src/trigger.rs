//! Activation-prefix matching.
//!
//! A message is only acted on when it starts with one of an ordered table of
//! prefixes. Every prefix carries its trailing separator, so a configured
//! `!ai` matches `"!ai weather"` but never `"!aiweather"`.

/// One candidate activation prefix.
#[derive(Debug, Clone)]
pub struct TriggerPrefix {
    prefix: String,
    case_sensitive: bool,
}

impl TriggerPrefix {
    pub fn exact(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), case_sensitive: true }
    }

    /// Case-insensitive over the prefix's own length. Folding is ASCII-only,
    /// which is all the stock prefixes need.
    pub fn any_case(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), case_sensitive: false }
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    fn matches(&self, text: &str) -> bool {
        if self.case_sensitive {
            return text.starts_with(&self.prefix);
        }
        let n = self.prefix.len();
        text.len() >= n && text.as_bytes()[..n].eq_ignore_ascii_case(self.prefix.as_bytes())
    }
}

/// Ordered set of activation prefixes; the first match wins.
#[derive(Debug, Clone)]
pub struct TriggerSet {
    prefixes: Vec<TriggerPrefix>,
}

impl TriggerSet {
    pub fn new(prefixes: Vec<TriggerPrefix>) -> Self {
        Self { prefixes }
    }

    /// The stock table: robot emoji, the colloquial `qq` in any case, then
    /// the configurable command prefix.
    pub fn with_ai_prefix(ai_prefix: &str) -> Self {
        Self::new(vec![
            TriggerPrefix::exact("🤖 "),
            TriggerPrefix::any_case("qq "),
            TriggerPrefix::exact(format!("{ai_prefix} ")),
        ])
    }

    pub fn is_triggered(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    /// Strips the matched prefix and trims the remainder. Text that matches
    /// no prefix comes back unchanged; callers gate on `is_triggered` first.
    pub fn extract_prompt<'a>(&self, text: &'a str) -> &'a str {
        match self.first_match(text) {
            Some(matched) => text[matched.prefix.len()..].trim(),
            None => text,
        }
    }

    /// Prefix literals in match order, for startup logging.
    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.iter().map(TriggerPrefix::as_str)
    }

    fn first_match(&self, text: &str) -> Option<&TriggerPrefix> {
        self.prefixes.iter().find(|p| p.matches(text))
    }
}
