use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Upper bound on the keywords kept for a posting.
pub const MAX_KEYWORDS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Indeed,
    Linkedin,
    WelcomeToTheJungle,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Indeed, Source::Linkedin, Source::WelcomeToTheJungle];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Indeed => "indeed",
            Source::Linkedin => "linkedin",
            Source::WelcomeToTheJungle => "welcome_to_the_jungle",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::ALL
            .into_iter()
            .find(|source| source.as_str() == s)
            .ok_or_else(|| format!("unknown source '{}'", s))
    }
}

/// Lifecycle of a posting.
///
/// `Scraped` is the only initial state. The pipeline moves postings to
/// `Test` (dry-run) or `Applied` (live); `Responded` and `Rejected` are only
/// reached through manual marking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Scraped,
    Test,
    Applied,
    Responded,
    Rejected,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Scraped,
        Status::Test,
        Status::Applied,
        Status::Responded,
        Status::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Scraped => "scraped",
            Status::Test => "test",
            Status::Applied => "applied",
            Status::Responded => "responded",
            Status::Rejected => "rejected",
        }
    }

    /// Whether `self -> next` is a valid path through the lifecycle.
    /// Staying in the same status is always allowed.
    pub fn can_transition_to(self, next: Status) -> bool {
        if self == next {
            return true;
        }
        match self {
            Status::Scraped => matches!(next, Status::Test | Status::Applied | Status::Rejected),
            Status::Test | Status::Applied => matches!(next, Status::Responded | Status::Rejected),
            Status::Responded => next == Status::Rejected,
            Status::Rejected => false,
        }
    }

    /// Statuses that count against the application caps.
    pub fn counts_as_application(self) -> bool {
        matches!(self, Status::Test | Status::Applied)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == lower)
            .ok_or_else(|| {
                format!(
                    "unknown status '{}' (expected one of: scraped, test, applied, responded, rejected)",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub requirements: String,
    pub salary: Option<String>,
    pub url: String,
    pub source: Source,
    pub keywords: Vec<String>,
    pub status: Status,
    pub date_scraped: DateTime<Utc>,
    pub application_date: Option<DateTime<Utc>>,
    pub cv_adapted: Option<String>,
}

impl Posting {
    /// Builds a freshly scraped posting. The description starts as a short
    /// placeholder until the full text is fetched.
    pub fn new(
        source: Source,
        native_id: &str,
        title: &str,
        company: &str,
        location: &str,
        url: &str,
    ) -> Self {
        Self {
            id: posting_id(source, native_id),
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            description: format!("{} at {}", title, company),
            requirements: String::new(),
            salary: None,
            url: url.to_string(),
            source,
            keywords: Vec::new(),
            status: Status::Scraped,
            date_scraped: Utc::now(),
            application_date: None,
            cv_adapted: None,
        }
    }

    /// Lowercased `title + " " + description`, the text keyword matching runs on.
    pub fn searchable_text(&self) -> String {
        format!("{} {}", self.title, self.description).to_lowercase()
    }
}

pub fn posting_id(source: Source, native_id: &str) -> String {
    format!("{}_{}", source.as_str(), native_id.trim())
}

/// A named, static search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub keywords: String,
    pub location: String,
    pub exclude_keywords: Vec<String>,
    pub min_salary: Option<i64>,
    pub max_pages_per_site: u32,
    pub target_keywords: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            keywords: String::new(),
            location: "France".to_string(),
            exclude_keywords: Vec::new(),
            min_salary: None,
            max_pages_per_site: 2,
            target_keywords: Vec::new(),
        }
    }
}

impl Profile {
    /// Returns the first exclusion keyword found in the posting's title or
    /// description, if any.
    pub fn excluded_by(&self, posting: &Posting) -> Option<&str> {
        let text = posting.searchable_text();
        self.exclude_keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .find(|k| text.contains(&k.to_lowercase()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapWindow {
    Hourly,
    Daily,
}

impl fmt::Display for CapWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapWindow::Hourly => f.write_str("hourly"),
            CapWindow::Daily => f.write_str("daily"),
        }
    }
}

/// What a classifier or adapter produced. `fell_back` is set when the value
/// is the safe default returned after a language-model failure.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutput<T> {
    pub value: T,
    pub fell_back: bool,
}

impl<T> StrategyOutput<T> {
    pub fn new(value: T) -> Self {
        Self { value, fell_back: false }
    }

    pub fn fallback(value: T) -> Self {
        Self { value, fell_back: true }
    }
}

/// Aggregate counts for one pipeline cycle. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub discovered: usize,
    pub excluded: usize,
    pub persisted_new: usize,
    pub persisted_duplicate: usize,
    pub fetch_errors: usize,
    pub session_errors: usize,
    pub full_text_fetched: usize,
    pub full_text_unavailable: usize,
    pub selected: usize,
    /// Scraped postings past the application age limit, left unprocessed.
    pub stale_skipped: usize,
    pub classified: usize,
    pub adapted: usize,
    /// Language-model failures answered with the safe default.
    pub classify_fallbacks: usize,
    pub adapt_fallbacks: usize,
    pub applied_ok: usize,
    pub applied_failed: usize,
    pub recorded_test: usize,
    pub store_errors: usize,
    pub cap_reached: Option<CapWindow>,
    pub fetch_delay: Duration,
    pub posting_delay: Duration,
    pub pauses: usize,
    pub pause_delay: Duration,
}

impl RunSummary {
    pub fn total_delay(&self) -> Duration {
        self.fetch_delay + self.posting_delay + self.pause_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posting_id_combines_source_and_native_id() {
        assert_eq!(posting_id(Source::Indeed, "abc123"), "indeed_abc123");
        assert_eq!(
            posting_id(Source::WelcomeToTheJungle, " x-9 "),
            "welcome_to_the_jungle_x-9"
        );
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in Status::ALL {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert_eq!("APPLIED".parse::<Status>().unwrap(), Status::Applied);
        assert!("closed".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_never_returns_to_scraped() {
        for status in Status::ALL {
            if status != Status::Scraped {
                assert!(!status.can_transition_to(Status::Scraped), "{} -> scraped", status);
            }
        }
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::Scraped.can_transition_to(Status::Test));
        assert!(Status::Scraped.can_transition_to(Status::Applied));
        assert!(Status::Applied.can_transition_to(Status::Responded));
        assert!(Status::Test.can_transition_to(Status::Rejected));
        assert!(!Status::Test.can_transition_to(Status::Applied));
        assert!(!Status::Rejected.can_transition_to(Status::Responded));
        assert!(Status::Rejected.can_transition_to(Status::Rejected));
    }

    #[test]
    fn test_profile_exclusion_is_case_insensitive() {
        let profile = Profile {
            exclude_keywords: vec!["Stage".to_string(), "  ".to_string()],
            ..Profile::default()
        };
        let mut posting = Posting::new(
            Source::Indeed,
            "1",
            "Data Scientist (STAGE)",
            "Acme",
            "Paris",
            "https://example.com/1",
        );
        assert_eq!(profile.excluded_by(&posting), Some("Stage"));

        posting.title = "Data Scientist".to_string();
        posting.description = "CDI".to_string();
        assert_eq!(profile.excluded_by(&posting), None);
    }
}
