//! End-of-conversation detection from the user's own words.

/// Matches user messages against a closing-phrase vocabulary (case-insensitive substring).
#[derive(Debug, Clone)]
pub struct ClosingDetector {
    phrases: Vec<String>,
}

impl ClosingDetector {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// True when `text` contains any closing phrase.
    pub fn is_closing(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }
}

impl Default for ClosingDetector {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_CLOSING_PHRASES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_case_insensitively_inside_text() {
        let d = ClosingDetector::default();
        assert!(d.is_closing("Thanks, BYE"));
        assert!(d.is_closing("ok that's all for today"));
        assert!(!d.is_closing("hi there"));
    }

    #[test]
    fn blank_phrases_are_ignored() {
        let d = ClosingDetector::new(["", "  ", "ciao"]);
        assert!(!d.is_closing("hello"));
        assert!(d.is_closing("Ciao!"));
    }
}
