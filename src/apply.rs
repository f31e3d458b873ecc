use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::browser::Driver;
use crate::models::Posting;
use crate::pacing::{DelayRange, RandomDelay};
use crate::source::{layout, source_for_url};

/// Time a simulated submission takes.
const SIMULATED_WAIT: DelayRange = DelayRange::new(1.0, 3.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyMode {
    #[default]
    Simulate,
    Browser,
}

impl fmt::Display for ApplyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyMode::Simulate => f.write_str("simulate"),
            ApplyMode::Browser => f.write_str("browser"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Success,
    Failure,
}

/// Submits one application. Persisting the outcome is the caller's job.
pub trait Applicant {
    fn apply(&mut self, posting: &Posting, resume: &str) -> ApplyOutcome;
}

/// Stands in for a real submission: waits a moment and succeeds with a fixed
/// probability.
pub struct SimulatedApplicant {
    delay: RandomDelay,
    success_rate: f64,
}

impl SimulatedApplicant {
    pub fn new(delay: RandomDelay, success_rate: f64) -> Self {
        Self { delay, success_rate }
    }
}

impl Applicant for SimulatedApplicant {
    fn apply(&mut self, posting: &Posting, resume: &str) -> ApplyOutcome {
        let waited = self.delay.pause(SIMULATED_WAIT);
        let outcome = if self.delay.chance(self.success_rate) {
            ApplyOutcome::Success
        } else {
            ApplyOutcome::Failure
        };
        info!(
            posting_id = %posting.id,
            resume_chars = resume.len(),
            waited_ms = waited.as_millis() as u64,
            ?outcome,
            "simulated application"
        );
        outcome
    }
}

/// Opens the posting page and clicks the site's apply control.
pub struct BrowserApplicant<D: Driver> {
    driver: D,
}

impl<D: Driver> BrowserApplicant<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }
}

impl<D: Driver> Applicant for BrowserApplicant<D> {
    fn apply(&mut self, posting: &Posting, _resume: &str) -> ApplyOutcome {
        let source = source_for_url(&posting.url).unwrap_or(posting.source);
        if let Err(e) = self.driver.get(&posting.url) {
            warn!(posting_id = %posting.id, error = %e, "could not open posting");
            return ApplyOutcome::Failure;
        }

        match self.driver.click(layout(source).cookie_button) {
            Err(e) if e.is_fatal() => {
                warn!(posting_id = %posting.id, error = %e, "browser session lost");
                return ApplyOutcome::Failure;
            }
            Err(e) => debug!(posting_id = %posting.id, error = %e, "cookie banner click failed"),
            Ok(_) => {}
        }
        for selector in layout(source).apply_buttons {
            match self.driver.click(selector) {
                Ok(true) => {
                    info!(posting_id = %posting.id, selector, "apply control clicked");
                    return ApplyOutcome::Success;
                }
                Ok(false) => debug!(posting_id = %posting.id, selector, "apply control not found"),
                Err(e) => {
                    warn!(posting_id = %posting.id, error = %e, "apply click failed");
                    return ApplyOutcome::Failure;
                }
            }
        }
        warn!(posting_id = %posting.id, "no apply control on page");
        ApplyOutcome::Failure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::fake::FakeDriver;
    use crate::models::Source;
    use crate::pacing::NoSleep;

    fn posting() -> Posting {
        Posting::new(
            Source::Indeed,
            "a1",
            "Data Scientist",
            "Acme",
            "Paris",
            "https://fr.indeed.com/viewjob?jk=a1",
        )
    }

    #[test]
    fn test_simulated_applicant_honours_success_rate() {
        let mut always = SimulatedApplicant::new(RandomDelay::with_seed(Box::new(NoSleep), 1), 1.0);
        let mut never = SimulatedApplicant::new(RandomDelay::with_seed(Box::new(NoSleep), 1), 0.0);
        for _ in 0..10 {
            assert_eq!(always.apply(&posting(), "cv"), ApplyOutcome::Success);
            assert_eq!(never.apply(&posting(), "cv"), ApplyOutcome::Failure);
        }
    }

    #[test]
    fn test_browser_applicant_clicks_apply_button() {
        let driver = FakeDriver::new()
            .page("https://fr.indeed.com/viewjob?jk=a1", "<button id='indeedApplyButton'>")
            .clickable("button[id*='indeedApply']");
        let mut applicant = BrowserApplicant::new(driver);

        assert_eq!(applicant.apply(&posting(), "cv"), ApplyOutcome::Success);
        assert_eq!(applicant.driver.clicked, vec!["button[id*='indeedApply']"]);
    }

    #[test]
    fn test_browser_applicant_fails_without_button_or_page() {
        let driver = FakeDriver::new().page("https://fr.indeed.com/viewjob?jk=a1", "<p>closed</p>");
        let mut applicant = BrowserApplicant::new(driver);
        assert_eq!(applicant.apply(&posting(), "cv"), ApplyOutcome::Failure);

        let mut applicant = BrowserApplicant::new(FakeDriver::new());
        assert_eq!(applicant.apply(&posting(), "cv"), ApplyOutcome::Failure);
    }

    #[test]
    fn test_browser_applicant_stops_when_session_is_lost() {
        let driver = FakeDriver::new()
            .page("https://fr.indeed.com/viewjob?jk=a1", "<button id='indeedApplyButton'>")
            .lost_on_click("#onetrust-accept-btn-handler")
            .clickable("#indeedApplyButton");
        let mut applicant = BrowserApplicant::new(driver);

        assert_eq!(applicant.apply(&posting(), "cv"), ApplyOutcome::Failure);
        assert!(applicant.driver.clicked.is_empty());
    }

    #[test]
    fn test_apply_mode_parses_from_config() {
        #[derive(Deserialize)]
        struct Wrapper {
            mode: ApplyMode,
        }
        let parsed: Wrapper = toml::from_str("mode = \"browser\"").unwrap();
        assert_eq!(parsed.mode, ApplyMode::Browser);
        assert_eq!(ApplyMode::default().to_string(), "simulate");
    }
}
