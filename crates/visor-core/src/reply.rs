//! Classification of turn results. The backend signals "nothing worth
//! showing" with a sentinel prefix rather than an empty message, and the
//! same check must apply everywhere a turn result is consumed.

/// Sentinel prefixes the backend uses to decline a reply. Matched
/// case-insensitively against the trimmed text. The truncated second form
/// shows up when the backend cuts the sentinel off mid-word.
const SILENT_PREFIXES: &[&str] = &["NO_REPLY", "NO_RE"];

/// A classified turn result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Renderable text.
    Text(String),
    /// Nothing to display. Not an error.
    Silent,
}

impl Reply {
    pub fn classify(raw: impl AsRef<str>) -> Self {
        let trimmed = raw.as_ref().trim();
        if trimmed.is_empty() {
            return Self::Silent;
        }
        let upper = trimmed.to_uppercase();
        if SILENT_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            return Self::Silent;
        }
        Self::Text(trimmed.to_string())
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Silent => None,
        }
    }

    pub fn is_silent(&self) -> bool {
        matches!(self, Self::Silent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_classifies_as_text() {
        assert_eq!(Reply::classify("hi there"), Reply::Text("hi there".into()));
    }

    #[test]
    fn text_is_trimmed() {
        assert_eq!(Reply::classify("  hello \n"), Reply::Text("hello".into()));
    }

    #[test]
    fn empty_and_whitespace_are_silent() {
        assert!(Reply::classify("").is_silent());
        assert!(Reply::classify("   \n\t").is_silent());
    }

    #[test]
    fn sentinel_prefixes_are_silent() {
        assert!(Reply::classify("NO_REPLY").is_silent());
        assert!(Reply::classify("NO_REPLY: nothing useful here").is_silent());
        assert!(Reply::classify("NO_RE").is_silent());
    }

    #[test]
    fn sentinel_match_is_case_insensitive() {
        assert!(Reply::classify("no_reply").is_silent());
        assert!(Reply::classify("No_Reply needed").is_silent());
    }

    #[test]
    fn sentinel_must_be_a_prefix() {
        let reply = Reply::classify("the answer is NO_REPLY");
        assert_eq!(reply.text(), Some("the answer is NO_REPLY"));
    }

    #[test]
    fn leading_whitespace_before_sentinel_still_silent() {
        assert!(Reply::classify("  NO_REPLY").is_silent());
    }
}
