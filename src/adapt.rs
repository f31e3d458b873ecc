use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ai::{truncate_chars, AIProvider};
use crate::models::{Posting, StrategyOutput};

const PROMPT_DESCRIPTION_CHARS: usize = 1500;
const ADAPT_MAX_TOKENS: u32 = 2500;
const HIGHLIGHT_HEADER: &str = "=== HIGHLIGHTED SKILLS FOR THIS ROLE ===";

/// Produces a posting-tailored variant of the base résumé.
pub trait Adapter {
    fn adapt(&self, base_resume: &str, posting: &Posting, keywords: &[String]) -> StrategyOutput<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    /// Exact text of the headline line that role templates replace.
    pub headline: String,
    pub highlight_count: usize,
    pub data_scientist_headline: String,
    pub scrum_master_headline: String,
    pub data_analyst_headline: String,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            headline: "DATA & AI | SCRUM MASTER & AGILE PROJECT MANAGEMENT".to_string(),
            highlight_count: 8,
            data_scientist_headline: "DATA SCIENTIST | MACHINE LEARNING & ARTIFICIAL INTELLIGENCE"
                .to_string(),
            scrum_master_headline: "SCRUM MASTER | AGILE PROJECT MANAGEMENT & DIGITAL TRANSFORMATION"
                .to_string(),
            data_analyst_headline: "DATA ANALYST | BUSINESS INTELLIGENCE & DATA VISUALISATION"
                .to_string(),
        }
    }
}

impl ResumeSettings {
    fn headline_for(&self, role: Role) -> &str {
        match role {
            Role::DataScientist => &self.data_scientist_headline,
            Role::ScrumMaster => &self.scrum_master_headline,
            Role::DataAnalyst => &self.data_analyst_headline,
        }
    }
}

/// Role families with a dedicated headline template, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    DataScientist,
    ScrumMaster,
    DataAnalyst,
}

impl Role {
    const PRIORITY: [Role; 3] = [Role::DataScientist, Role::ScrumMaster, Role::DataAnalyst];

    fn indicators(&self) -> &'static [&'static str] {
        match self {
            Role::DataScientist => &["data scientist", "scientist"],
            Role::ScrumMaster => &["scrum", "agile", "project manager", "chef de projet"],
            Role::DataAnalyst => &["data analyst", "analyst"],
        }
    }

    pub fn detect(title: &str) -> Option<Role> {
        let title = title.to_lowercase();
        Role::PRIORITY
            .into_iter()
            .find(|role| role.indicators().iter().any(|i| title.contains(i)))
    }
}

/// Swaps the headline line for a role template and appends a highlighted
/// skills section. Every other line of the base résumé is kept verbatim.
pub struct TemplateAdapter {
    settings: ResumeSettings,
}

impl TemplateAdapter {
    pub fn new(settings: ResumeSettings) -> Self {
        Self { settings }
    }
}

impl Adapter for TemplateAdapter {
    fn adapt(&self, base_resume: &str, posting: &Posting, keywords: &[String]) -> StrategyOutput<String> {
        let replacement = Role::detect(&posting.title).map(|role| self.settings.headline_for(role));
        let target = self.settings.headline.trim();

        let mut replaced = false;
        let lines: Vec<&str> = base_resume
            .split('\n')
            .map(|line| match replacement {
                Some(headline) if !replaced && !target.is_empty() && line.trim() == target => {
                    replaced = true;
                    headline
                }
                _ => line,
            })
            .collect();
        let mut adapted = lines.join("\n");

        if keywords.is_empty() {
            return StrategyOutput::new(adapted);
        }

        let top: Vec<&str> = keywords
            .iter()
            .take(self.settings.highlight_count)
            .map(String::as_str)
            .collect();

        let content_end = adapted.trim_end_matches('\n').len();
        adapted.truncate(content_end);
        adapted.push_str(&format!(
            "\n\n{}\nKey skills: {}\nTarget role: {} at {}\n",
            HIGHLIGHT_HEADER,
            top.join(", "),
            posting.title,
            posting.company
        ));
        StrategyOutput::new(adapted)
    }
}

/// Rewrites the résumé with the language model. Any failure returns the base
/// résumé unchanged.
pub struct AiAdapter<'a> {
    provider: &'a dyn AIProvider,
}

impl<'a> AiAdapter<'a> {
    pub fn new(provider: &'a dyn AIProvider) -> Self {
        Self { provider }
    }
}

impl Adapter for AiAdapter<'_> {
    fn adapt(&self, base_resume: &str, posting: &Posting, keywords: &[String]) -> StrategyOutput<String> {
        let prompt = adapt_prompt(base_resume, posting, keywords);
        match self.provider.complete(&prompt, ADAPT_MAX_TOKENS) {
            Ok(response) => {
                let text = strip_code_fence(&response);
                if text.trim().is_empty() {
                    warn!(posting_id = %posting.id, "model returned an empty resume, keeping base");
                    return StrategyOutput::fallback(base_resume.to_string());
                }
                debug!(posting_id = %posting.id, chars = text.len(), "resume rewritten");
                StrategyOutput::new(text.to_string())
            }
            Err(e) => {
                warn!(posting_id = %posting.id, error = %e, "resume adaptation failed, keeping base");
                StrategyOutput::fallback(base_resume.to_string())
            }
        }
    }
}

fn adapt_prompt(base_resume: &str, posting: &Posting, keywords: &[String]) -> String {
    format!(
        "You are an expert resume writer. Adapt the resume below for this job posting.\n\n\
        RULES:\n\
        - Keep exactly the same professional experiences, education and dates\n\
        - Reuse the vocabulary of the job posting where it truthfully applies\n\
        - Reorder skills if it makes the resume more relevant\n\
        - Invent NOTHING: no new employer, project, skill, figure or degree\n\
        - Return only the adapted resume as plain text\n\n\
        Job title: {title}\n\
        Company: {company}\n\
        Key skills: {keywords}\n\n\
        Job description:\n{description}\n\n\
        Resume:\n{resume}",
        title = posting.title,
        company = posting.company,
        keywords = keywords.join(", "),
        description = truncate_chars(&posting.description, PROMPT_DESCRIPTION_CHARS),
        resume = base_resume,
    )
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => {
            let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
            body.trim_end().strip_suffix("```").unwrap_or(body).trim()
        }
        None => trimmed,
    }
}
