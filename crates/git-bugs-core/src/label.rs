use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;

/// A label attached to a bug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(String);

impl Label {
    /// Wrap a label name, trimming surrounding whitespace.
    #[must_use]
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_owned())
    }

    /// Label text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject blank or multi-line labels.
    ///
    /// # Errors
    /// Returns [`ValidationError::InvalidLabel`] for unusable label text.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.0.is_empty() || self.0.contains(['\n', '\r']) {
            return Err(ValidationError::InvalidLabel(self.0.clone()));
        }
        Ok(())
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Label {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Label {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
