use crate::{Labels, METRIC_NAME_LABEL, SHARD_LABEL};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `=`
    Equal,

    /// `!=`
    NotEqual,

    /// `=~`
    Regex,

    /// `!~`
    NotRegex,
}

impl MatchType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MatcherError {
    #[error("invalid regex {pattern:?} for label {name:?}: {source}")]
    InvalidRegex {
        name: String,
        pattern: String,
        source: regex_lite::Error,
    },
}

/// A predicate on the value of a single label.
///
/// A label missing from a series is matched as the empty string, so `app=""` selects the series
/// without an `app` label.
#[derive(Clone, Debug)]
pub struct LabelMatcher {
    kind: MatchType,
    name: String,
    value: String,

    /// Only for [`MatchType::Regex`] and [`MatchType::NotRegex`]; anchored on both ends.
    regex: Option<regex_lite::Regex>,
}

impl LabelMatcher {
    pub fn new(
        kind: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, MatcherError> {
        let (name, value) = (name.into(), value.into());

        let regex = match kind {
            MatchType::Equal | MatchType::NotEqual => None,
            MatchType::Regex | MatchType::NotRegex => {
                match regex_lite::Regex::new(&format!("^(?:{value})$")) {
                    Ok(regex) => Some(regex),
                    Err(source) => {
                        return Err(MatcherError::InvalidRegex {
                            name,
                            pattern: value,
                            source,
                        });
                    }
                }
            }
        };

        Ok(Self {
            kind,
            name,
            value,
            regex,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MatchType::Equal,
            name: name.into(),
            value: value.into(),
            regex: None,
        }
    }

    pub fn not_equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MatchType::NotEqual,
            name: name.into(),
            value: value.into(),
            regex: None,
        }
    }

    pub fn regex(
        name: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Result<Self, MatcherError> {
        Self::new(MatchType::Regex, name, pattern)
    }

    pub fn not_regex(
        name: impl Into<String>,
        pattern: impl Into<String>,
    ) -> Result<Self, MatcherError> {
        Self::new(MatchType::NotRegex, name, pattern)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn kind(&self) -> MatchType {
        self.kind
    }

    pub fn matches(&self, value: &str) -> bool {
        match (self.kind, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(regex)) => regex.is_match(value),
            (MatchType::NotRegex, Some(regex)) => !regex.is_match(value),

            // Regex matchers are always built with their regex.
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }

    /// Does the series with these labels satisfy this matcher?
    #[inline]
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name))
    }
}

impl std::fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind.as_str(), self.value)
    }
}

/// Drops the matchers on reserved labels, which no stored series can be selected by.
///
/// [`METRIC_NAME_LABEL`] is a constant only kept for upstream compatibility, and [`SHARD_LABEL`]
/// is injected by query sharding.
pub fn remove_reserved_matchers(matchers: &[LabelMatcher]) -> Vec<LabelMatcher> {
    matchers
        .iter()
        .filter(|matcher| matcher.name != METRIC_NAME_LABEL && matcher.name != SHARD_LABEL)
        .cloned()
        .collect()
}
