//! Free-text filtering of history candidates
//!
//! A query is reduced to words (quotes stripped, split on whitespace). A
//! single word longer than two characters is a prefix match against any word
//! of the title or URL. A single short word only matches at the start of the
//! title or of the URL, allowing for the usual scheme, `www.` and `m.`
//! variants. Several words must all prefix-match.

/// Single words up to this many characters only match anchored
const SHORT_WORD_CHARS: usize = 2;

/// URL prefixes tried for anchored short-word matches
const URL_PREFIXES: &[&str] = &[
    "http://",
    "https://",
    "http://www.",
    "https://www.",
    "http://m.",
    "https://m.",
];

/// A parsed history search
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    words: Vec<String>,
}

impl SearchQuery {
    pub fn parse(text: &str) -> Self {
        let words = text
            .replace('"', "")
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Self { words }
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn short_word(&self) -> Option<&str> {
        match self.words.as_slice() {
            [word] if word.chars().count() <= SHORT_WORD_CHARS => Some(word),
            _ => None,
        }
    }

    /// Render as an FTS MATCH expression over `title` and `url` columns
    pub fn to_fts_expression(&self) -> String {
        if let Some(word) = self.short_word() {
            let mut clauses = vec![format!("title: \"^{}*\"", word)];
            clauses.extend(URL_PREFIXES.iter().map(|p| format!("url: \"^{}{}*\"", p, word)));
            return clauses.join(" OR ");
        }

        self.words.iter().map(|w| format!("\"{}*\"", w)).collect()
    }

    /// Evaluate the query against a title and URL
    pub fn matches(&self, title: &str, url: &str) -> bool {
        if self.words.is_empty() {
            return true;
        }

        let title = title.to_lowercase();
        let url = url.to_lowercase();

        if let Some(word) = self.short_word() {
            let word = word.to_lowercase();
            return title.starts_with(&word)
                || URL_PREFIXES
                    .iter()
                    .any(|p| url.strip_prefix(p).is_some_and(|rest| rest.starts_with(&word)));
        }

        let tokens: Vec<&str> = tokenize(&title).chain(tokenize(&url)).collect();
        self.words.iter().all(|word| {
            let word = word.to_lowercase();
            tokens.iter().any(|t| t.starts_with(&word))
        })
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty())
}
