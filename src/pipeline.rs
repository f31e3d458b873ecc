use chrono::{Duration as ChronoDuration, Utc};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::adapt::Adapter;
use crate::apply::{Applicant, ApplyOutcome};
use crate::classify::Classifier;
use crate::config::{ApplicationSettings, QualityFilters};
use crate::db::{Database, StatusUpdate, StoreResult, UpsertOutcome};
use crate::models::{Posting, Profile, RunSummary, Status};
use crate::pacing::{Pacer, RandomDelay, RateLimiter};
use crate::source::{parse_salary_range, PostingSource, SourceError};

/// Why a discovered posting was dropped before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Keyword(String),
    Company(String),
    MissingSalary,
    Salary { max: i64, floor: i64 },
}

impl fmt::Display for Exclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exclusion::Keyword(k) => write!(f, "contains excluded keyword '{}'", k),
            Exclusion::Company(c) => write!(f, "company '{}' is excluded", c),
            Exclusion::MissingSalary => f.write_str("no salary given"),
            Exclusion::Salary { max, floor } => write!(f, "salary up to {} below {}", max, floor),
        }
    }
}

pub fn screen(posting: &Posting, profile: &Profile, quality: &QualityFilters) -> Option<Exclusion> {
    if let Some(keyword) = profile.excluded_by(posting) {
        return Some(Exclusion::Keyword(keyword.to_string()));
    }

    let company = posting.company.trim().to_lowercase();
    if let Some(excluded) = quality
        .exclude_companies
        .iter()
        .find(|c| c.trim().to_lowercase() == company)
    {
        return Some(Exclusion::Company(excluded.clone()));
    }

    let salary = posting.salary.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if quality.require_salary && salary.is_none() {
        return Some(Exclusion::MissingSalary);
    }

    let floor = profile.min_salary?;
    let (_, max) = parse_salary_range(salary?)?;
    (max < floor).then_some(Exclusion::Salary { max, floor })
}

/// One search → persist → classify → adapt → apply → record pass.
pub struct Pipeline<'a, S: PostingSource> {
    store: &'a Database,
    source: S,
    classifier: Box<dyn Classifier + 'a>,
    adapter: Box<dyn Adapter + 'a>,
    applicant: Box<dyn Applicant + 'a>,
    pacer: Pacer,
    limiter: RateLimiter,
    settings: ApplicationSettings,
    base_resume: String,
}

impl<'a, S: PostingSource> Pipeline<'a, S> {
    /// The rate limiter starts from the applications already recorded in
    /// the last day, so caps hold across runs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a Database,
        source: S,
        classifier: Box<dyn Classifier + 'a>,
        adapter: Box<dyn Adapter + 'a>,
        applicant: Box<dyn Applicant + 'a>,
        settings: ApplicationSettings,
        delay: RandomDelay,
        base_resume: String,
    ) -> StoreResult<Self> {
        let history = store.application_dates_since(Utc::now() - ChronoDuration::days(1))?;
        debug!(recent_applications = history.len(), "rate limiter seeded");
        let limiter =
            RateLimiter::new(settings.max_per_hour, settings.max_per_day).with_history(history);

        Ok(Self {
            store,
            source,
            classifier,
            adapter,
            applicant,
            pacer: Pacer::new(settings.pace(), delay),
            limiter,
            settings,
            base_resume,
        })
    }

    pub fn run_cycle(&mut self, profile: &Profile, dry_run: bool) -> StoreResult<RunSummary> {
        let mut summary = RunSummary::default();
        let fetch_delay_before = self.source.fetch_delay();

        self.collect(profile, &mut summary);

        let mut batch = self.store.list_by_status(Status::Scraped)?;
        if let Some(days) = self.settings.quality.max_application_age_days {
            let cutoff = Utc::now() - ChronoDuration::days(i64::from(days));
            let before = batch.len();
            batch.retain(|p| p.date_scraped >= cutoff);
            summary.stale_skipped = before - batch.len();
        }
        // Postings never tried go first; a failed apply keeps its adapted CV.
        batch.sort_by_key(|p| p.cv_adapted.is_some());
        batch.truncate(self.settings.max_postings_per_cycle);
        summary.selected = batch.len();
        info!(selected = batch.len(), dry_run, "processing postings");

        for posting in batch {
            if let Err(window) = self.limiter.check(Utc::now()) {
                info!(%window, "application cap reached, stopping");
                summary.cap_reached = Some(window);
                break;
            }
            self.process(posting, profile, dry_run, &mut summary);

            let step = self.pacer.after_posting();
            summary.posting_delay += step.delay;
            if let Some(pause) = step.pause {
                summary.pauses += 1;
                summary.pause_delay += pause;
            }
        }

        summary.fetch_delay = self.source.fetch_delay().saturating_sub(fetch_delay_before);
        Ok(summary)
    }

    /// Hands the source back so its session can be closed explicitly.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Searches, screens and persists. Errors are counted, never raised.
    fn collect(&mut self, profile: &Profile, summary: &mut RunSummary) {
        let results = self.source.search(
            &profile.keywords,
            &profile.location,
            profile.max_pages_per_site,
        );

        for result in results {
            let posting = match result {
                Ok(posting) => posting,
                Err(SourceError::Session(e)) => {
                    error!(error = %e, "search aborted");
                    summary.session_errors += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "search page skipped");
                    summary.fetch_errors += 1;
                    continue;
                }
            };
            summary.discovered += 1;

            if let Some(reason) = screen(&posting, profile, &self.settings.quality) {
                debug!(posting_id = %posting.id, %reason, "posting excluded");
                summary.excluded += 1;
                continue;
            }

            match self.store.upsert(&posting) {
                Ok(UpsertOutcome::Inserted) => summary.persisted_new += 1,
                Ok(UpsertOutcome::Refreshed) => summary.persisted_duplicate += 1,
                Err(e) => {
                    error!(posting_id = %posting.id, error = %e, "could not persist posting");
                    summary.store_errors += 1;
                }
            }
        }
        info!(
            discovered = summary.discovered,
            new = summary.persisted_new,
            duplicate = summary.persisted_duplicate,
            excluded = summary.excluded,
            "search finished"
        );
    }

    /// Classify, adapt, apply and record one posting. Each posting is its
    /// own unit: a failure here never touches the others.
    fn process(&mut self, mut posting: Posting, profile: &Profile, dry_run: bool, summary: &mut RunSummary) {
        if posting.description.chars().count() < self.settings.quality.min_description_length {
            match self.source.fetch_full_text(&posting.url) {
                Some(text) => {
                    posting.description = text;
                    summary.full_text_fetched += 1;
                    if let Err(e) = self.store.upsert(&posting) {
                        warn!(posting_id = %posting.id, error = %e, "could not store full description");
                        summary.store_errors += 1;
                    }
                }
                None => summary.full_text_unavailable += 1,
            }
        }

        let extracted = self.classifier.extract(&posting, profile);
        summary.classified += 1;
        if extracted.fell_back {
            summary.classify_fallbacks += 1;
        }
        let keywords = extracted.value;

        let adapted = self.adapter.adapt(&self.base_resume, &posting, &keywords);
        summary.adapted += 1;
        if adapted.fell_back {
            summary.adapt_fallbacks += 1;
        }
        let resume = adapted.value;

        let now = Utc::now();
        let status = if dry_run {
            summary.recorded_test += 1;
            Status::Test
        } else {
            match self.applicant.apply(&posting, &resume) {
                ApplyOutcome::Success => {
                    summary.applied_ok += 1;
                    Status::Applied
                }
                ApplyOutcome::Failure => {
                    summary.applied_failed += 1;
                    Status::Scraped
                }
            }
        };

        let update = StatusUpdate {
            status,
            keywords: Some(&keywords),
            cv_adapted: Some(&resume),
            application_date: status.counts_as_application().then_some(now),
        };
        match self.store.update_status(&posting.id, update) {
            Ok(()) => {
                if status.counts_as_application() {
                    self.limiter.record(now);
                }
                info!(posting_id = %posting.id, title = %posting.title, %status, keywords = keywords.len(), "posting processed");
            }
            Err(e) => {
                error!(posting_id = %posting.id, error = %e, "could not record outcome");
                summary.store_errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::{AiAdapter, ResumeSettings, TemplateAdapter};
    use crate::ai::stub::Failing;
    use crate::apply::SimulatedApplicant;
    use crate::browser::fake::FakeDriver;
    use crate::classify::{AiClassifier, KeywordClassifier};
    use crate::models::{CapWindow, Source};
    use crate::pacing::{DelayRange, NoSleep};
    use crate::source::{search_url, SiteSettings, SiteSource};
    use std::time::Duration;

    const RESUME: &str = "JANE DOE\nDATA & AI | SCRUM MASTER & AGILE PROJECT MANAGEMENT\n\nSKILLS\n- Python, SQL";

    const PAGE: &str = r#"
        <div data-jk="a1"><h2><a><span>Data Scientist</span></a></h2>
            <span data-testid="company-name">Acme</span>
            <div class="job-snippet">Python and machine learning</div></div>
        <div data-jk="a2"><h2><a><span>Scrum Master Agile</span></a></h2>
            <span data-testid="company-name">Globex</span></div>
        <div data-jk="a3"><h2><a><span>Data Analyst</span></a></h2>
            <span data-testid="company-name">Initech</span></div>"#;

    fn site() -> SiteSettings {
        SiteSettings {
            delay: DelayRange::new(2.0, 2.0),
            ..SiteSettings::default()
        }
    }

    fn page_url(page: u32) -> String {
        search_url(Source::Indeed, &site(), "data", "Paris", page)
            .unwrap()
            .to_string()
    }

    fn profile() -> Profile {
        Profile {
            keywords: "data".to_string(),
            location: "Paris".to_string(),
            max_pages_per_site: 1,
            target_keywords: vec!["python".to_string(), "sql".to_string()],
            ..Profile::default()
        }
    }

    fn settings() -> ApplicationSettings {
        ApplicationSettings {
            delay: DelayRange::new(30.0, 120.0),
            jitter: 0.2,
            pause_after: 2,
            pause_secs: 300,
            ..ApplicationSettings::default()
        }
    }

    fn pipeline<'a>(
        store: &'a Database,
        driver: FakeDriver,
        settings: ApplicationSettings,
        applicant: Box<dyn Applicant + 'a>,
    ) -> Pipeline<'a, SiteSource<FakeDriver>> {
        let source = SiteSource::new(
            driver,
            vec![(Source::Indeed, site())],
            RandomDelay::with_seed(Box::new(NoSleep), 1),
        );
        Pipeline::new(
            store,
            source,
            Box::new(KeywordClassifier),
            Box::new(TemplateAdapter::new(ResumeSettings::default())),
            applicant,
            settings,
            RandomDelay::with_seed(Box::new(NoSleep), 2),
            RESUME.to_string(),
        )
        .unwrap()
    }

    fn simulated(success_rate: f64) -> Box<dyn Applicant> {
        Box::new(SimulatedApplicant::new(
            RandomDelay::with_seed(Box::new(NoSleep), 3),
            success_rate,
        ))
    }

    fn driver() -> FakeDriver {
        FakeDriver::new().page(&page_url(0), PAGE)
    }

    #[test]
    fn test_dry_run_records_every_posting_as_test() {
        let store = Database::open_in_memory().unwrap();
        let mut pipeline = pipeline(&store, driver(), settings(), simulated(0.0));

        let summary = pipeline.run_cycle(&profile(), true).unwrap();

        assert_eq!(summary.discovered, 3);
        assert_eq!(summary.persisted_new, 3);
        assert_eq!(summary.recorded_test, 3);
        assert_eq!(summary.classify_fallbacks + summary.adapt_fallbacks, 0);
        assert_eq!(summary.applied_ok + summary.applied_failed, 0);
        assert_eq!(store.list(None, None).unwrap().len(), 3);

        let tested = store.list_by_status(Status::Test).unwrap();
        assert_eq!(tested.len(), 3);
        for posting in &tested {
            assert!(!posting.cv_adapted.as_deref().unwrap_or("").is_empty());
            assert!(posting.application_date.is_some());
        }
        let a1 = store.get("indeed_a1").unwrap().unwrap();
        assert_eq!(a1.keywords[0], "python");
    }

    #[test]
    fn test_model_failures_are_counted_in_summary() {
        let store = Database::open_in_memory().unwrap();
        let source = SiteSource::new(
            driver(),
            vec![(Source::Indeed, site())],
            RandomDelay::with_seed(Box::new(NoSleep), 1),
        );
        let mut pipeline = Pipeline::new(
            &store,
            source,
            Box::new(AiClassifier::new(&Failing)),
            Box::new(AiAdapter::new(&Failing)),
            simulated(1.0),
            settings(),
            RandomDelay::with_seed(Box::new(NoSleep), 2),
            RESUME.to_string(),
        )
        .unwrap();

        let summary = pipeline.run_cycle(&profile(), true).unwrap();
        assert_eq!(summary.classified, 3);
        assert_eq!(summary.classify_fallbacks, 3);
        assert_eq!(summary.adapt_fallbacks, 3);
        assert_eq!(summary.recorded_test, 3);

        let a1 = store.get("indeed_a1").unwrap().unwrap();
        assert!(a1.keywords.is_empty());
        assert_eq!(a1.cv_adapted.as_deref(), Some(RESUME));
    }

    #[test]
    fn test_second_cycle_adds_nothing_and_keeps_status() {
        let store = Database::open_in_memory().unwrap();
        let mut pipeline = pipeline(&store, driver(), settings(), simulated(1.0));
        pipeline.run_cycle(&profile(), true).unwrap();

        let summary = pipeline.run_cycle(&profile(), true).unwrap();
        assert_eq!(summary.persisted_new, 0);
        assert_eq!(summary.persisted_duplicate, 3);
        assert_eq!(summary.selected, 0);
        assert_eq!(store.list(None, None).unwrap().len(), 3);
        assert_eq!(store.list_by_status(Status::Test).unwrap().len(), 3);
    }

    #[test]
    fn test_scrum_title_gets_scrum_headline() {
        let store = Database::open_in_memory().unwrap();
        let mut pipeline = pipeline(&store, driver(), settings(), simulated(1.0));
        pipeline.run_cycle(&profile(), true).unwrap();

        let resume = ResumeSettings::default();
        let cv = store.get("indeed_a2").unwrap().unwrap().cv_adapted.unwrap();
        assert!(cv.contains(&resume.scrum_master_headline));
        assert!(!cv.contains(&resume.data_scientist_headline));
    }

    #[test]
    fn test_live_run_applies_and_failures_stay_scraped() {
        let store = Database::open_in_memory().unwrap();
        let mut live = pipeline(&store, driver(), settings(), simulated(1.0));
        let summary = live.run_cycle(&profile(), false).unwrap();
        assert_eq!(summary.applied_ok, 3);
        assert_eq!(store.list_by_status(Status::Applied).unwrap().len(), 3);

        let store = Database::open_in_memory().unwrap();
        let mut failing = pipeline(&store, driver(), settings(), simulated(0.0));
        let summary = failing.run_cycle(&profile(), false).unwrap();
        assert_eq!(summary.applied_failed, 3);
        let scraped = store.list_by_status(Status::Scraped).unwrap();
        assert_eq!(scraped.len(), 3);
        assert!(scraped.iter().all(|p| p.cv_adapted.is_some() && p.application_date.is_none()));
    }

    #[test]
    fn test_pacing_is_bounded_and_pauses_counted() {
        let store = Database::open_in_memory().unwrap();
        let mut pipeline = pipeline(&store, driver(), settings(), simulated(1.0));
        let summary = pipeline.run_cycle(&profile(), true).unwrap();

        assert!(summary.posting_delay >= Duration::from_secs(30 * 3));
        assert!(summary.posting_delay <= Duration::from_secs(120 * 3));
        assert_eq!(summary.pauses, 1);
        assert_eq!(summary.pause_delay, Duration::from_secs(300));
        // One full-text fetch per posting, each paced by the site delay.
        assert_eq!(summary.fetch_delay, Duration::from_secs(6));
    }

    #[test]
    fn test_hourly_cap_stops_processing() {
        let store = Database::open_in_memory().unwrap();
        let settings = ApplicationSettings {
            max_per_hour: Some(2),
            ..settings()
        };
        let mut pipeline = pipeline(&store, driver(), settings, simulated(1.0));
        let summary = pipeline.run_cycle(&profile(), true).unwrap();

        assert_eq!(summary.recorded_test, 2);
        assert_eq!(summary.cap_reached, Some(CapWindow::Hourly));
        assert_eq!(store.list_by_status(Status::Scraped).unwrap().len(), 1);
    }

    #[test]
    fn test_daily_cap_is_seeded_from_store() {
        let store = Database::open_in_memory().unwrap();
        let settings = ApplicationSettings {
            max_per_day: Some(3),
            ..settings()
        };
        pipeline(&store, driver(), settings.clone(), simulated(1.0))
            .run_cycle(&profile(), true)
            .unwrap();

        let more = FakeDriver::new().page(
            &page_url(0),
            r#"<div data-jk="b1"><h2><a><span>ML Engineer</span></a></h2></div>"#,
        );
        let summary = pipeline(&store, more, settings, simulated(1.0))
            .run_cycle(&profile(), true)
            .unwrap();
        assert_eq!(summary.persisted_new, 1);
        assert_eq!(summary.cap_reached, Some(CapWindow::Daily));
        assert_eq!(summary.recorded_test, 0);
    }

    #[test]
    fn test_fetch_errors_are_counted_not_raised() {
        let store = Database::open_in_memory().unwrap();
        let driver = FakeDriver::new().broken(&page_url(0)).page(&page_url(1), PAGE);
        let profile = Profile {
            max_pages_per_site: 2,
            ..profile()
        };
        let mut pipeline = pipeline(&store, driver, settings(), simulated(1.0));
        let summary = pipeline.run_cycle(&profile, true).unwrap();

        assert_eq!(summary.fetch_errors, 1);
        assert_eq!(summary.persisted_new, 3);
        assert_eq!(summary.fetch_delay, Duration::from_secs(8));
    }

    #[test]
    fn test_short_description_is_enriched() {
        let store = Database::open_in_memory().unwrap();
        let full = format!("<div id='jobDescriptionText'><p>{}</p></div>", "SQL and Python. ".repeat(20));
        let driver = driver().page("https://fr.indeed.com/viewjob?jk=a1", &full);
        let mut pipeline = pipeline(&store, driver, settings(), simulated(1.0));
        let summary = pipeline.run_cycle(&profile(), true).unwrap();

        assert_eq!(summary.full_text_fetched, 1);
        assert_eq!(summary.full_text_unavailable, 2);
        let a1 = store.get("indeed_a1").unwrap().unwrap();
        assert!(a1.description.starts_with("SQL and Python."));
        assert_eq!(a1.keywords[..2], ["python", "sql"]);
    }

    #[test]
    fn test_invalid_transition_only_affects_that_posting() {
        struct RejectsFirst<'s> {
            store: &'s Database,
        }
        impl Applicant for RejectsFirst<'_> {
            fn apply(&mut self, posting: &Posting, _resume: &str) -> ApplyOutcome {
                if posting.id == "indeed_a1" {
                    self.store
                        .update_status(&posting.id, StatusUpdate::status(Status::Rejected))
                        .unwrap();
                }
                ApplyOutcome::Success
            }
        }

        let store = Database::open_in_memory().unwrap();
        let applicant = Box::new(RejectsFirst { store: &store });
        let mut pipeline = pipeline(&store, driver(), settings(), applicant);
        let summary = pipeline.run_cycle(&profile(), false).unwrap();

        assert_eq!(summary.store_errors, 1);
        assert_eq!(store.get("indeed_a1").unwrap().unwrap().status, Status::Rejected);
        assert_eq!(store.list_by_status(Status::Applied).unwrap().len(), 2);
    }

    #[test]
    fn test_screen_filters() {
        let quality = QualityFilters {
            exclude_companies: vec!["Globex".to_string()],
            ..QualityFilters::default()
        };
        let profile = Profile {
            exclude_keywords: vec!["stage".to_string()],
            min_salary: Some(40000),
            ..Profile::default()
        };
        let mut posting = Posting::new(Source::Indeed, "1", "Data Scientist", "Acme", "Paris", "u");
        assert_eq!(screen(&posting, &profile, &quality), None);

        posting.salary = Some("30k - 35k €".to_string());
        assert_eq!(
            screen(&posting, &profile, &quality),
            Some(Exclusion::Salary { max: 35000, floor: 40000 })
        );

        posting.salary = Some("Selon profil".to_string());
        assert_eq!(screen(&posting, &profile, &quality), None);

        posting.company = " globex ".to_string();
        assert_eq!(screen(&posting, &profile, &quality), Some(Exclusion::Company("Globex".to_string())));

        posting.title = "Stage Data Scientist".to_string();
        assert_eq!(screen(&posting, &profile, &quality), Some(Exclusion::Keyword("stage".to_string())));
    }

    #[test]
    fn test_screen_requires_salary_when_asked() {
        let quality = QualityFilters {
            require_salary: true,
            ..QualityFilters::default()
        };
        let profile = Profile::default();
        let mut posting = Posting::new(Source::Indeed, "1", "Data Scientist", "Acme", "Paris", "u");
        assert_eq!(screen(&posting, &profile, &quality), Some(Exclusion::MissingSalary));

        posting.salary = Some("   ".to_string());
        assert_eq!(screen(&posting, &profile, &quality), Some(Exclusion::MissingSalary));

        posting.salary = Some("45k €".to_string());
        assert_eq!(screen(&posting, &profile, &quality), None);

        posting.salary = None;
        assert_eq!(screen(&posting, &profile, &QualityFilters::default()), None);
    }

    #[test]
    fn test_postings_past_age_limit_are_not_selected() {
        let store = Database::open_in_memory().unwrap();
        let mut old = Posting::new(Source::Indeed, "old", "Data Engineer", "Initech", "Paris", "u");
        old.date_scraped = Utc::now() - ChronoDuration::days(10);
        store.upsert(&old).unwrap();

        let mut pipeline = pipeline(&store, driver(), settings(), simulated(1.0));
        let summary = pipeline.run_cycle(&profile(), true).unwrap();
        assert_eq!(summary.stale_skipped, 1);
        assert_eq!(summary.selected, 3);
        assert_eq!(store.get("indeed_old").unwrap().unwrap().status, Status::Scraped);

        let settings = ApplicationSettings {
            quality: QualityFilters {
                max_application_age_days: None,
                ..QualityFilters::default()
            },
            ..settings()
        };
        let mut unlimited = self::pipeline(&store, driver(), settings, simulated(1.0));
        let summary = unlimited.run_cycle(&profile(), true).unwrap();
        assert_eq!(summary.stale_skipped, 0);
        assert_eq!(store.get("indeed_old").unwrap().unwrap().status, Status::Test);
    }

    #[test]
    fn test_failed_postings_yield_to_untried_ones() {
        let store = Database::open_in_memory().unwrap();
        let settings = ApplicationSettings {
            max_postings_per_cycle: 2,
            ..settings()
        };
        let mut pipeline = pipeline(&store, driver(), settings, simulated(0.0));

        let first = pipeline.run_cycle(&profile(), false).unwrap();
        assert_eq!(first.applied_failed, 2);
        let untried: Vec<_> = store
            .list_by_status(Status::Scraped)
            .unwrap()
            .into_iter()
            .filter(|p| p.cv_adapted.is_none())
            .collect();
        assert_eq!(untried.len(), 1);

        let second = pipeline.run_cycle(&profile(), false).unwrap();
        assert_eq!(second.applied_failed, 2);
        let tried = store.get(&untried[0].id).unwrap().unwrap();
        assert!(tried.cv_adapted.is_some());
    }

    #[test]
    fn test_excluded_postings_are_not_persisted() {
        let store = Database::open_in_memory().unwrap();
        let profile = Profile {
            exclude_keywords: vec!["scrum".to_string()],
            ..profile()
        };
        let mut pipeline = pipeline(&store, driver(), settings(), simulated(1.0));
        let summary = pipeline.run_cycle(&profile, true).unwrap();

        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.persisted_new, 2);
        assert!(store.get("indeed_a2").unwrap().is_none());
    }
}
