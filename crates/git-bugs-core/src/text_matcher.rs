/// Case-insensitive substring matcher for free-text filters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMatcher {
    needle: String,
}

impl TextMatcher {
    /// Normalize a query string into a matcher. Returns `None` for blank inputs.
    #[must_use]
    pub fn new(query: &str) -> Option<Self> {
        let trimmed = query.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            needle: trimmed.to_lowercase(),
        })
    }

    /// Whether `value` contains the query.
    #[must_use]
    pub fn matches(&self, value: &str) -> bool {
        value.to_lowercase().contains(&self.needle)
    }

    /// Whether any of `values` contains the query.
    pub fn matches_any<'a, I>(&self, values: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        values.into_iter().any(|value| self.matches(value))
    }
}
