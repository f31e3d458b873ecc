use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{Driver, DriverError};
use crate::models::{Posting, Source};
use crate::pacing::{DelayRange, RandomDelay};

#[derive(Debug, Error)]
pub enum SourceError {
    /// One page could not be fetched; the search moves on to the next page.
    #[error("{site} page {page} could not be fetched: {source}")]
    Transient {
        site: Source,
        page: u32,
        #[source]
        source: DriverError,
    },

    /// The driver session is gone; the search ends.
    #[error("browser session lost: {0}")]
    Session(#[source] DriverError),

    #[error("invalid search URL for {site}: {reason}")]
    InvalidUrl { site: Source, reason: String },
}

// --- Site layouts ---

enum Paging {
    /// Result offset: `page * step`.
    Offset(&'static str, u32),
    /// One-based page number.
    Number(&'static str),
}

enum CardId {
    Attribute(&'static str),
    /// Attribute holding a URN whose last `:`-separated segment is the id.
    Urn(&'static str),
    /// Last path segment of the card's link.
    LinkSlug,
}

/// Where each piece of a listing lives on one site.
pub struct SiteLayout {
    pub base_url: &'static str,
    host_marker: &'static str,
    query_param: &'static str,
    location_param: &'static str,
    paging: Paging,
    card: &'static str,
    card_id: CardId,
    title: &'static [&'static str],
    company: &'static [&'static str],
    location: &'static [&'static str],
    salary: &'static [&'static str],
    snippet: &'static [&'static str],
    link: &'static str,
    /// Path joined with the native id to build the posting URL, when the
    /// card link is a tracking redirect.
    view_path: Option<&'static str>,
    pub cookie_button: &'static str,
    expand_button: Option<&'static str>,
    description: &'static [&'static str],
    pub apply_buttons: &'static [&'static str],
}

static INDEED: SiteLayout = SiteLayout {
    base_url: "https://fr.indeed.com/jobs",
    host_marker: "indeed.",
    query_param: "q",
    location_param: "l",
    paging: Paging::Offset("start", 10),
    card: "[data-jk]",
    card_id: CardId::Attribute("data-jk"),
    title: &["h2 a span", "h2.jobTitle span"],
    company: &["[data-testid='company-name']", ".companyName"],
    location: &["[data-testid='text-location']", "[data-testid='job-location']"],
    salary: &[".salary-snippet-container", "[data-testid='attribute_snippet_testid']"],
    snippet: &[".job-snippet"],
    link: "h2 a",
    view_path: Some("/viewjob?jk="),
    cookie_button: "#onetrust-accept-btn-handler",
    expand_button: None,
    description: &["#jobDescriptionText"],
    apply_buttons: &["#indeedApplyButton", "button[id*='indeedApply']"],
};

static LINKEDIN: SiteLayout = SiteLayout {
    base_url: "https://www.linkedin.com/jobs/search/",
    host_marker: "linkedin.",
    query_param: "keywords",
    location_param: "location",
    paging: Paging::Offset("start", 25),
    card: "div.base-card[data-entity-urn]",
    card_id: CardId::Urn("data-entity-urn"),
    title: &["h3.base-search-card__title"],
    company: &["h4.base-search-card__subtitle"],
    location: &["span.job-search-card__location"],
    salary: &["span.job-search-card__salary-info"],
    snippet: &[],
    link: "a.base-card__full-link",
    view_path: None,
    cookie_button: "button[action-type='ACCEPT']",
    expand_button: Some("button.show-more-less-html__button"),
    description: &[".show-more-less-html__markup", ".description__text"],
    apply_buttons: &["button.jobs-apply-button"],
};

static WELCOME_TO_THE_JUNGLE: SiteLayout = SiteLayout {
    base_url: "https://www.welcometothejungle.com/fr/jobs",
    host_marker: "welcometothejungle.",
    query_param: "query",
    location_param: "aroundQuery",
    paging: Paging::Number("page"),
    card: "li[data-testid='search-results-list-item-wrapper']",
    card_id: CardId::LinkSlug,
    title: &["h4", "h2"],
    company: &["[data-testid='job-card-company-name']", "span.wui-text"],
    location: &["[data-testid='job-card-location']"],
    salary: &["[data-testid='job-card-salary']"],
    snippet: &[],
    link: "a[href*='/jobs/']",
    view_path: None,
    cookie_button: "#axeptio_btn_acceptAll",
    expand_button: None,
    description: &["[data-testid='job-section-description']", "#the-position-section"],
    apply_buttons: &["[data-testid='job_bottom-button-apply']", "[data-testid='job_header-button-apply']"],
};

pub fn layout(source: Source) -> &'static SiteLayout {
    match source {
        Source::Indeed => &INDEED,
        Source::Linkedin => &LINKEDIN,
        Source::WelcomeToTheJungle => &WELCOME_TO_THE_JUNGLE,
    }
}

/// Guesses the site a posting URL belongs to.
pub fn source_for_url(url: &str) -> Option<Source> {
    let host = Url::parse(url).ok()?.host_str()?.to_lowercase();
    Source::ALL
        .into_iter()
        .find(|source| host.contains(layout(*source).host_marker))
}

// --- Settings ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub enabled: bool,
    /// Overrides the built-in search URL.
    pub base_url: Option<String>,
    pub cards_per_page: usize,
    pub delay: DelayRange,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: None,
            cards_per_page: 5,
            delay: DelayRange::new(2.0, 5.0),
        }
    }
}

impl SiteSettings {
    fn with(enabled: bool, min: f64, max: f64) -> Self {
        Self {
            enabled,
            delay: DelayRange::new(min, max),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteTable {
    pub indeed: SiteSettings,
    pub linkedin: SiteSettings,
    pub welcome_to_the_jungle: SiteSettings,
}

impl Default for SiteTable {
    fn default() -> Self {
        Self {
            indeed: SiteSettings::with(true, 2.0, 5.0),
            linkedin: SiteSettings::with(false, 3.0, 7.0),
            welcome_to_the_jungle: SiteSettings::with(true, 2.0, 4.0),
        }
    }
}

impl SiteTable {
    pub fn get(&self, source: Source) -> &SiteSettings {
        match source {
            Source::Indeed => &self.indeed,
            Source::Linkedin => &self.linkedin,
            Source::WelcomeToTheJungle => &self.welcome_to_the_jungle,
        }
    }

    pub fn enabled(&self) -> Vec<(Source, SiteSettings)> {
        Source::ALL
            .into_iter()
            .filter(|source| self.get(*source).enabled)
            .map(|source| (source, self.get(source).clone()))
            .collect()
    }
}

pub fn search_url(
    source: Source,
    settings: &SiteSettings,
    query: &str,
    location: &str,
    page: u32,
) -> Result<Url, SourceError> {
    let layout = layout(source);
    let base = settings.base_url.as_deref().unwrap_or(layout.base_url);
    let (page_param, page_value) = match &layout.paging {
        Paging::Offset(param, step) => (*param, page * *step),
        Paging::Number(param) => (*param, page + 1),
    };
    let page_value = page_value.to_string();
    Url::parse_with_params(
        base,
        &[
            (layout.query_param, query),
            (layout.location_param, location),
            (page_param, page_value.as_str()),
        ],
    )
    .map_err(|e| SourceError::InvalidUrl {
        site: source,
        reason: e.to_string(),
    })
}

// --- Source seam ---

/// Produces postings for a search and full descriptions on demand.
pub trait PostingSource {
    fn search<'a>(
        &'a mut self,
        query: &'a str,
        location: &'a str,
        max_pages: u32,
    ) -> Box<dyn Iterator<Item = Result<Posting, SourceError>> + 'a>;

    /// Full description text, or `None` when the page or its description
    /// region cannot be reached.
    fn fetch_full_text(&mut self, url: &str) -> Option<String>;

    /// Total time spent waiting between fetches so far.
    fn fetch_delay(&self) -> Duration;
}

/// Scrapes the enabled job sites through a [`Driver`].
pub struct SiteSource<D: Driver> {
    driver: D,
    sites: Vec<(Source, SiteSettings)>,
    delay: RandomDelay,
    fetched_once: bool,
    fetch_delay: Duration,
    consented: Vec<Source>,
}

impl<D: Driver> SiteSource<D> {
    pub fn new(driver: D, sites: Vec<(Source, SiteSettings)>, delay: RandomDelay) -> Self {
        Self {
            driver,
            sites,
            delay,
            fetched_once: false,
            fetch_delay: Duration::ZERO,
            consented: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    fn paced_get(&mut self, url: &str, range: DelayRange) -> Result<(), DriverError> {
        if self.fetched_once {
            self.fetch_delay += self.delay.pause(range);
        }
        self.fetched_once = true;
        self.driver.get(url)
    }

    /// Clicks the consent banner once per site. Only a lost session is
    /// reported; any other click failure leaves the banner in place.
    fn accept_cookies(&mut self, source: Source) -> Result<(), DriverError> {
        if self.consented.contains(&source) {
            return Ok(());
        }
        self.consented.push(source);
        match self.driver.click(layout(source).cookie_button) {
            Ok(true) => debug!(site = %source, "cookie banner accepted"),
            Ok(false) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => debug!(site = %source, error = %e, "cookie banner click failed"),
        }
        Ok(())
    }

    fn fetch_page(
        &mut self,
        site: usize,
        query: &str,
        location: &str,
        page: u32,
    ) -> Result<Vec<Posting>, SourceError> {
        let (source, settings) = self.sites[site].clone();
        let url = search_url(source, &settings, query, location, page)?;
        info!(site = %source, page, "fetching search page");

        let wrap = |e: DriverError| {
            if e.is_fatal() {
                SourceError::Session(e)
            } else {
                SourceError::Transient {
                    site: source,
                    page,
                    source: e,
                }
            }
        };

        self.paced_get(url.as_str(), settings.delay).map_err(wrap)?;
        self.accept_cookies(source).map_err(wrap)?;
        let html = self.driver.page_source().map_err(wrap)?;

        let postings = parse_cards(source, &html, &url, settings.cards_per_page);
        debug!(site = %source, page, count = postings.len(), "parsed result cards");
        Ok(postings)
    }
}

impl<D: Driver> PostingSource for SiteSource<D> {
    fn search<'a>(
        &'a mut self,
        query: &'a str,
        location: &'a str,
        max_pages: u32,
    ) -> Box<dyn Iterator<Item = Result<Posting, SourceError>> + 'a> {
        Box::new(Search {
            source: self,
            query,
            location,
            max_pages,
            site: 0,
            page: 0,
            buffer: Vec::new().into_iter(),
            done: false,
        })
    }

    fn fetch_full_text(&mut self, url: &str) -> Option<String> {
        let site = source_for_url(url);
        let range = site
            .and_then(|s| self.sites.iter().find(|(source, _)| *source == s))
            .map(|(_, settings)| settings.delay)
            .unwrap_or(SiteSettings::default().delay);

        if let Err(e) = self.paced_get(url, range) {
            warn!(url, error = %e, "full description unavailable");
            return None;
        }

        let layouts: Vec<&SiteLayout> = match site {
            Some(source) => vec![layout(source)],
            None => Source::ALL.into_iter().map(layout).collect(),
        };
        for expand in layouts.iter().filter_map(|l| l.expand_button) {
            match self.driver.click(expand) {
                Err(e) if e.is_fatal() => {
                    warn!(url, error = %e, "full description unavailable");
                    return None;
                }
                Err(e) => debug!(url, error = %e, "show-more click failed"),
                Ok(_) => {}
            }
        }

        let html = match self.driver.page_source() {
            Ok(html) => html,
            Err(e) => {
                warn!(url, error = %e, "full description unavailable");
                return None;
            }
        };
        let document = Html::parse_document(&html);
        let text = layouts
            .iter()
            .flat_map(|l| l.description.iter())
            .filter_map(|sel| Selector::parse(sel).ok())
            .find_map(|sel| {
                document
                    .select(&sel)
                    .map(block_text)
                    .find(|text| !text.is_empty())
            });

        if text.is_none() {
            warn!(url, "description region not found");
        }
        text
    }

    fn fetch_delay(&self) -> Duration {
        self.fetch_delay
    }
}

/// Walks sites in configuration order and pages in ascending order.
struct Search<'a, D: Driver> {
    source: &'a mut SiteSource<D>,
    query: &'a str,
    location: &'a str,
    max_pages: u32,
    site: usize,
    page: u32,
    buffer: std::vec::IntoIter<Posting>,
    done: bool,
}

impl<D: Driver> Iterator for Search<'_, D> {
    type Item = Result<Posting, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(posting) = self.buffer.next() {
                return Some(Ok(posting));
            }
            if self.done || self.site >= self.source.sites.len() {
                return None;
            }
            if self.page >= self.max_pages {
                self.site += 1;
                self.page = 0;
                continue;
            }

            let page = self.page;
            self.page += 1;
            match self.source.fetch_page(self.site, self.query, self.location, page) {
                Ok(postings) => self.buffer = postings.into_iter(),
                Err(e @ SourceError::Transient { .. }) => return Some(Err(e)),
                Err(e @ SourceError::InvalidUrl { .. }) => {
                    self.site += 1;
                    self.page = 0;
                    return Some(Err(e));
                }
                Err(e @ SourceError::Session(_)) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

// --- HTML parsing ---

fn select_first<'a>(scope: ElementRef<'a>, selectors: &[&str]) -> Option<ElementRef<'a>> {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| scope.select(&sel).next())
}

fn first_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .filter_map(|sel| scope.select(&sel).next().map(inline_text))
        .find(|text| !text.is_empty())
}

fn inline_text(element: ElementRef<'_>) -> String {
    element.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of an element with block boundaries kept as line breaks.
fn block_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    for node in element.descendants() {
        if let Some(text) = node.value().as_text() {
            raw.push_str(text);
        } else if let Some(el) = node.value().as_element() {
            if matches!(
                el.name(),
                "p" | "br" | "li" | "div" | "ul" | "ol" | "h1" | "h2" | "h3" | "h4" | "h5" | "h6"
            ) {
                raw.push('\n');
            }
        }
    }
    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn card_native_id(card: ElementRef<'_>, layout: &SiteLayout) -> Option<String> {
    let id = match layout.card_id {
        CardId::Attribute(attr) => card.value().attr(attr)?.to_string(),
        CardId::Urn(attr) => card.value().attr(attr)?.rsplit(':').next()?.to_string(),
        CardId::LinkSlug => {
            let href = select_first(card, &[layout.link])?.value().attr("href")?;
            let path = href.split(['?', '#']).next()?;
            path.trim_end_matches('/').rsplit('/').next()?.to_string()
        }
    };
    let id = id.trim().to_string();
    (!id.is_empty()).then_some(id)
}

/// Turns one search result page into postings, at most `limit` of them.
/// Cards without an id or a title are skipped.
pub fn parse_cards(source: Source, html: &str, page_url: &Url, limit: usize) -> Vec<Posting> {
    let layout = layout(source);
    let Ok(card_selector) = Selector::parse(layout.card) else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let mut postings = Vec::new();
    for card in document.select(&card_selector).take(limit) {
        let Some(native_id) = card_native_id(card, layout) else {
            debug!(site = %source, "card without id skipped");
            continue;
        };
        let Some(title) = first_text(card, layout.title) else {
            debug!(site = %source, native_id, "card without title skipped");
            continue;
        };
        let company = first_text(card, layout.company).unwrap_or_else(|| "Unknown".to_string());
        let location = first_text(card, layout.location).unwrap_or_default();

        let href = select_first(card, &[layout.link]).and_then(|a| a.value().attr("href"));
        let url = match (layout.view_path, href) {
            (Some(path), _) => page_url.join(&format!("{}{}", path, native_id)).ok(),
            (None, Some(href)) => page_url.join(href).ok(),
            (None, None) => None,
        }
        .map(|u| u.to_string())
        .unwrap_or_else(|| page_url.to_string());

        let mut posting = Posting::new(source, &native_id, &title, &company, &location, &url);
        posting.salary = first_text(card, layout.salary);
        if let Some(snippet) = first_text(card, layout.snippet) {
            posting.description = format!("{}\n{}", posting.description, snippet);
        }
        postings.push(posting);
    }
    postings
}

// --- Salary ---

static THOUSANDS_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d)[ \u{a0}\u{202f},.](\d{3})\b").expect("static regex")
});
static AMOUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)\s*(k)?").expect("static regex"));
static HOURLY_OR_DAILY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:heures?|hours?|hourly|jours?|days?|daily)\b|/\s*h\b").expect("static regex")
});
static MONTHLY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:mois|months?|monthly|mensuel)\b").expect("static regex"));

/// Yearly amounts above this are parsing noise, not salaries.
const MAX_SALARY: f64 = 10_000_000.0;

/// Parses salary text into a yearly `(min, max)` range.
///
/// Handles ranges ("45 000 € - 55 000 €", "45k-55k €"), single figures
/// ("$150,000") and monthly amounts. Hourly and daily rates are not
/// comparable with a yearly floor and yield `None`.
pub fn parse_salary_range(text: &str) -> Option<(i64, i64)> {
    let lower = text.to_lowercase();
    if HOURLY_OR_DAILY.is_match(&lower) {
        return None;
    }
    let monthly = MONTHLY.is_match(&lower);

    let mut joined = lower;
    loop {
        let next = THOUSANDS_SEPARATOR.replace_all(&joined, "$1$2").into_owned();
        if next == joined {
            break;
        }
        joined = next;
    }

    let amounts: Vec<i64> = AMOUNT
        .captures_iter(&joined)
        .filter_map(|caps| {
            let value: f64 = caps[1].replace(',', ".").parse().ok()?;
            let value = if caps.get(2).is_some() { value * 1000.0 } else { value };
            (value <= MAX_SALARY).then_some(value as i64)
        })
        .filter(|value| *value >= 1000)
        .filter_map(|value| if monthly { value.checked_mul(12) } else { Some(value) })
        .take(2)
        .collect();

    match amounts.as_slice() {
        [single] => Some((*single, *single)),
        [a, b] => Some((*a.min(b), *a.max(b))),
        _ => None,
    }
}
