use regex::Regex;

/// Coarse intent of an inbound text message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Intent {
    Start,
    Help,
    Status,
    Reset,
    Chat,
}

/// Maps raw text to an [`Intent`]. Opaque to the pipeline.
pub trait Classifier: Send + Sync {
    fn classify(&self, text: &str) -> Intent;
}

/// First-match keyword rules (commands and a few bare words).
pub struct KeywordClassifier {
    rules: Vec<(Regex, Intent)>,
}

impl KeywordClassifier {
    pub fn new() -> Self {
        let rule = |re: &str, intent| (Regex::new(re).expect("valid regex"), intent);
        Self {
            rules: vec![
                rule(r"(?i)^/start(@\w+)?\b", Intent::Start),
                rule(r"(?i)^(/help(@\w+)?\b|help\s*\??$)", Intent::Help),
                rule(r"(?i)^(/status(@\w+)?\b|status\s*\??$)", Intent::Status),
                rule(r"(?i)^/reset(@\w+)?\b", Intent::Reset),
            ],
        }
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier for KeywordClassifier {
    fn classify(&self, text: &str) -> Intent {
        let text = text.trim();
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, intent)| *intent)
            .unwrap_or(Intent::Chat)
    }
}
