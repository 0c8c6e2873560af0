use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// A validated MQTT topic filter.
///
/// `+` and `#` must each occupy a whole level, and `#` may only be the final
/// level. Empty levels are allowed, so `/`, `a//b` and `sport/` are all valid
/// filters with empty-string levels.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Filter {
    /// The unadulterated filter string. Never empty.
    string: Box<str>,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum FilterParseError {
    #[error("topic filter cannot be empty")]
    EmptyFilter,
    #[error("`+` must occupy an entire level")]
    PlusInLevel,
    #[error("`#` must occupy an entire level")]
    HashInLevel,
    #[error("`#` must be the last level of a filter")]
    HashNotLast,
    #[error("topic filter cannot contain a null byte")]
    NullByte,
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        if string.is_empty() {
            return Err(FilterParseError::EmptyFilter);
        }

        if string.contains('\0') {
            return Err(FilterParseError::NullByte);
        }

        let mut levels = string.split('/').peekable();
        while let Some(level) = levels.next() {
            if level.contains('#') {
                if level != "#" {
                    return Err(FilterParseError::HashInLevel);
                }
                if levels.peek().is_some() {
                    return Err(FilterParseError::HashNotLast);
                }
            } else if level.contains('+') && level != "+" {
                return Err(FilterParseError::PlusInLevel);
            }
        }

        Ok(Filter {
            string: string.into(),
        })
    }
}

impl Filter {
    pub fn as_str(&self) -> &str {
        &self.string
    }

    pub fn levels(&self) -> std::str::Split<'_, char> {
        self.string.split('/')
    }

    /// `true` if the filter ends with the multi-level wildcard.
    pub fn is_multi_level(&self) -> bool {
        self.string.ends_with('#')
    }

    /// If this filter contains no wildcards, return `Ok(self.as_str())`;
    /// otherwise return the wildcard-free prefix of the filter.
    ///
    /// The prefix lets retained-message lookup limit its scan to topics that
    /// share it.
    pub fn exact_or_prefix(&self) -> Result<&str, &str> {
        match self.string.find(['+', '#']) {
            None => Ok(&self.string),
            Some(index) => Err(&self.string[..index]),
        }
    }

    /// Returns `true` if this filter matches the given concrete topic.
    ///
    /// Topics whose first level starts with `$` are reserved: a wildcard in
    /// the filter's first level never matches them.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic.is_empty() {
            return false;
        }

        let mut filter_levels = self.levels().peekable();

        if topic.starts_with('$') && matches!(filter_levels.peek(), Some(&"+") | Some(&"#")) {
            return false;
        }

        let mut topic_levels = topic.split('/');

        loop {
            match (filter_levels.next(), topic_levels.next()) {
                // `#` matches the rest of the topic, including zero levels:
                // `a/#` matches both `a` and `a/b/c`.
                (Some("#"), _) => return true,
                (Some(filter_level), Some(topic_level)) => {
                    if filter_level != "+" && filter_level != topic_level {
                        return false;
                    }
                }
                (Some(_), None) | (None, Some(_)) => return false,
                (None, None) => return true,
            }
        }
    }
}

/// Whether `topic` is publishable: non-empty, wildcard-free, no null bytes.
pub fn valid_topic(topic: &str) -> bool {
    !topic.is_empty() && !topic.contains(['+', '#', '\0'])
}

impl Debug for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Filter").field(&self.as_str()).finish()
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
