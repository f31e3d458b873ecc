use regex::Regex;
use std::sync::LazyLock;
use tracing::{debug, warn};

use crate::ai::{truncate_chars, AIProvider};
use crate::models::{Posting, Profile, StrategyOutput, MAX_KEYWORDS};

/// Extra keywords taken from the title after profile matches.
const TITLE_WORD_LIMIT: usize = 5;
/// Description characters sent in the language-model prompt.
const PROMPT_DESCRIPTION_CHARS: usize = 2000;
const KEYWORD_MAX_TOKENS: u32 = 200;

static ALPHA_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\p{Alphabetic}+").expect("static regex"));
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]+|\d+[.)])\s*").expect("static regex"));

/// Maps a posting to an ordered list of at most [`MAX_KEYWORDS`] distinct,
/// lowercase keywords.
pub trait Classifier {
    fn extract(&self, posting: &Posting, profile: &Profile) -> StrategyOutput<Vec<String>>;
}

/// Case-insensitive substring matching against the profile's target keywords,
/// topped up with long words from the title.
pub struct KeywordClassifier;

impl Classifier for KeywordClassifier {
    fn extract(&self, posting: &Posting, profile: &Profile) -> StrategyOutput<Vec<String>> {
        let text = posting.searchable_text();
        let mut keywords = KeywordList::new();

        for keyword in &profile.target_keywords {
            let normalized = normalize_keyword(keyword);
            if !normalized.is_empty() && text.contains(&normalized) {
                keywords.push(normalized);
            }
        }

        let title = posting.title.to_lowercase();
        let mut from_title = 0;
        for token in ALPHA_TOKEN.find_iter(&title) {
            if from_title >= TITLE_WORD_LIMIT || keywords.is_full() {
                break;
            }
            if token.as_str().chars().count() > 4 && keywords.push(token.as_str().to_string()) {
                from_title += 1;
            }
        }

        StrategyOutput::new(keywords.into_vec())
    }
}

/// Asks the language model for a comma-separated keyword list. Any service
/// failure yields an empty list.
pub struct AiClassifier<'a> {
    provider: &'a dyn AIProvider,
}

impl<'a> AiClassifier<'a> {
    pub fn new(provider: &'a dyn AIProvider) -> Self {
        Self { provider }
    }
}

impl Classifier for AiClassifier<'_> {
    fn extract(&self, posting: &Posting, _profile: &Profile) -> StrategyOutput<Vec<String>> {
        let prompt = keyword_prompt(posting);
        match self.provider.complete(&prompt, KEYWORD_MAX_TOKENS) {
            Ok(response) => {
                let keywords = parse_keyword_list(&response);
                debug!(posting_id = %posting.id, count = keywords.len(), "model keywords");
                StrategyOutput::new(keywords)
            }
            Err(e) => {
                warn!(posting_id = %posting.id, error = %e, "keyword extraction failed, using none");
                StrategyOutput::fallback(Vec::new())
            }
        }
    }
}

fn keyword_prompt(posting: &Posting) -> String {
    format!(
        "Analyze this job posting and extract the {max} most important technical skills, \
        technologies and competencies. Return ONLY a comma-separated list of keywords, \
        no explanations.\n\n\
        Title: {title}\n\
        Requirements: {requirements}\n\n\
        Description:\n{description}",
        max = MAX_KEYWORDS,
        title = posting.title,
        requirements = posting.requirements,
        description = truncate_chars(&posting.description, PROMPT_DESCRIPTION_CHARS),
    )
}

/// Parses a comma- or newline-separated reply into a capped, deduplicated list.
pub fn parse_keyword_list(response: &str) -> Vec<String> {
    let mut keywords = KeywordList::new();
    for item in response.split([',', '\n']) {
        if keywords.is_full() {
            break;
        }
        keywords.push(normalize_keyword(item));
    }
    keywords.into_vec()
}

fn normalize_keyword(raw: &str) -> String {
    let unmarked = LIST_MARKER.replace(raw.trim(), "");
    unmarked
        .trim_matches(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '`'))
        .trim_end_matches('.')
        .to_lowercase()
}

/// Ordered set with the keyword cap built in.
struct KeywordList {
    items: Vec<String>,
}

impl KeywordList {
    fn new() -> Self {
        Self { items: Vec::new() }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= MAX_KEYWORDS
    }

    /// Returns whether the keyword was added.
    fn push(&mut self, keyword: String) -> bool {
        if keyword.is_empty() || self.is_full() || self.items.contains(&keyword) {
            return false;
        }
        self.items.push(keyword);
        true
    }

    fn into_vec(self) -> Vec<String> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::stub::{Failing, FixedReply};
    use crate::models::Source;
    use std::collections::HashSet;

    fn posting(title: &str, description: &str) -> Posting {
        let mut p = Posting::new(Source::Indeed, "1", title, "Acme", "Paris", "https://x/1");
        p.description = description.to_string();
        p
    }

    fn profile(targets: &[&str]) -> Profile {
        Profile {
            target_keywords: targets.iter().map(|s| s.to_string()).collect(),
            ..Profile::default()
        }
    }

    fn assert_capped_and_distinct(keywords: &[String]) {
        assert!(keywords.len() <= MAX_KEYWORDS);
        let lowered: HashSet<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        assert_eq!(lowered.len(), keywords.len());
    }

    #[test]
    fn test_keyword_classifier_keeps_profile_order() {
        let p = posting("Data Scientist", "We use SQL, Python and Power BI daily.");
        let keywords = KeywordClassifier.extract(&p, &profile(&["Power BI", "Python", "Tableau", "SQL"])).value;
        assert_eq!(keywords[..3], ["power bi", "python", "sql"]);
    }

    #[test]
    fn test_keyword_classifier_appends_long_title_words() {
        let p = posting("Senior Data Scientist - Machine Learning", "Python");
        let keywords = KeywordClassifier.extract(&p, &profile(&["python", "machine learning"])).value;
        assert_eq!(
            keywords,
            vec!["python", "machine learning", "senior", "scientist", "machine", "learning"]
        );
    }

    #[test]
    fn test_keyword_classifier_title_words_are_deduplicated_against_matches() {
        let p = posting("Scrum Master Agile", "");
        let keywords = KeywordClassifier.extract(&p, &profile(&["SCRUM", "master"])).value;
        assert_eq!(keywords, vec!["scrum", "master", "agile"]);
    }

    #[test]
    fn test_keyword_classifier_caps_at_ten() {
        let description = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima";
        let targets: Vec<&str> = description.split(' ').collect();
        let p = posting("Engineering Leader Principal Architect", description);

        let keywords = KeywordClassifier.extract(&p, &profile(&targets)).value;
        assert_eq!(keywords.len(), MAX_KEYWORDS);
        assert_capped_and_distinct(&keywords);
        assert!(!keywords.contains(&"engineering".to_string()));
    }

    #[test]
    fn test_keyword_classifier_handles_duplicate_targets() {
        let p = posting("Data Analyst", "sql sql SQL");
        let keywords = KeywordClassifier.extract(&p, &profile(&["SQL", "sql", " Sql "])).value;
        assert_eq!(keywords, vec!["sql", "analyst"]);
    }

    #[test]
    fn test_keyword_classifier_title_words_accented() {
        let p = posting("Ingénieur Données", "");
        let keywords = KeywordClassifier.extract(&p, &profile(&[])).value;
        assert_eq!(keywords, vec!["ingénieur", "données"]);
    }

    #[test]
    fn test_parse_keyword_list_normalizes_and_caps() {
        let reply = "Python, SQL, python, \"Power BI\", - Tableau\n1. Airflow, , Spark, dbt, Kafka., AWS, GCP, Azure, Docker";
        let keywords = parse_keyword_list(reply);
        assert_eq!(keywords[..5], ["python", "sql", "power bi", "tableau", "airflow"]);
        assert_eq!(keywords.len(), MAX_KEYWORDS);
        assert_capped_and_distinct(&keywords);
        assert!(keywords.contains(&"kafka".to_string()));
    }

    #[test]
    fn test_parse_keyword_list_keeps_inner_punctuation() {
        assert_eq!(parse_keyword_list("Node.js, .NET, 3D modeling"), vec!["node.js", ".net", "3d modeling"]);
    }

    #[test]
    fn test_ai_classifier_uses_model_reply() {
        let provider = FixedReply::new("Machine Learning, NLP, Scikit-learn");
        let classifier = AiClassifier::new(&provider);
        let p = posting("Data Scientist", &"x".repeat(5000));

        let extracted = classifier.extract(&p, &Profile::default());
        assert!(!extracted.fell_back);
        assert_eq!(extracted.value, vec!["machine learning", "nlp", "scikit-learn"]);

        let prompts = provider.prompts.borrow();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("Title: Data Scientist"));
        assert!(prompts[0].len() < 5000);
    }

    #[test]
    fn test_ai_classifier_falls_back_to_empty_on_failure() {
        let classifier = AiClassifier::new(&Failing);
        let p = posting("Data Scientist", "Python");
        let keywords = classifier.extract(&p, &profile(&["python"]));
        assert!(keywords.fell_back);
        assert!(keywords.value.is_empty());
    }
}
