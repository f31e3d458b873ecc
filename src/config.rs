use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use crate::adapt::ResumeSettings;
use crate::ai::{api_key_from, resolve_model};
use crate::apply::ApplyMode;
use crate::browser::BrowserSettings;
use crate::db::Database;
use crate::models::Profile;
use crate::pacing::{DelayRange, PaceSettings};
use crate::source::SiteTable;

pub const LOCAL_CONFIG_FILE: &str = "jobpilot.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("could not serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("unknown profile '{name}' (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// How keywords are extracted and résumés adapted for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Keyword,
    Ai,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Keyword => f.write_str("keyword"),
            Strategy::Ai => f.write_str("ai"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub database: Option<PathBuf>,
    pub cv_template: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFilters {
    /// Descriptions shorter than this get the full text fetched.
    pub min_description_length: usize,
    /// Drop postings that do not state a salary.
    pub require_salary: bool,
    /// Postings scraped longer ago than this are no longer applied to.
    pub max_application_age_days: Option<u32>,
    pub exclude_companies: Vec<String>,
}

impl Default for QualityFilters {
    fn default() -> Self {
        Self {
            min_description_length: 200,
            require_salary: false,
            max_application_age_days: Some(7),
            exclude_companies: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub mode: ApplyMode,
    pub jitter: f64,
    pub max_per_day: Option<usize>,
    pub max_per_hour: Option<usize>,
    /// Take a longer pause after this many postings; 0 disables it.
    pub pause_after: usize,
    pub pause_secs: u64,
    pub max_postings_per_cycle: usize,
    /// Probability that a simulated application succeeds.
    pub success_rate: f64,
    pub delay: DelayRange,
    pub quality: QualityFilters,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Simulate,
            jitter: 0.2,
            max_per_day: Some(50),
            max_per_hour: Some(10),
            pause_after: 5,
            pause_secs: 300,
            max_postings_per_cycle: 5,
            success_rate: 0.8,
            delay: DelayRange::new(30.0, 120.0),
            quality: QualityFilters::default(),
        }
    }
}

impl ApplicationSettings {
    pub fn pace(&self) -> PaceSettings {
        PaceSettings {
            delay: self.delay,
            jitter: self.jitter,
            pause_after: self.pause_after,
            pause_secs: self.pause_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_profile: String,
    pub strategy: Strategy,
    pub model: String,
    pub paths: Paths,
    pub browser: BrowserSettings,
    pub sites: SiteTable,
    pub application: ApplicationSettings,
    pub resume: ResumeSettings,
    pub profiles: BTreeMap<String, Profile>,
    /// File the configuration was read from, if any.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_profile: "data_scientist".to_string(),
            strategy: Strategy::Keyword,
            model: "gpt-4o-mini".to_string(),
            paths: Paths::default(),
            browser: BrowserSettings::default(),
            sites: SiteTable::default(),
            application: ApplicationSettings::default(),
            resume: ResumeSettings::default(),
            profiles: default_profiles(),
            loaded_from: None,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn default_profiles() -> BTreeMap<String, Profile> {
    let mut profiles = BTreeMap::new();
    profiles.insert(
        "data_scientist".to_string(),
        Profile {
            keywords: "data scientist python machine learning".to_string(),
            location: "Île-de-France".to_string(),
            exclude_keywords: strings(&["stage", "intern", "bénévole", "freelance"]),
            min_salary: Some(40000),
            max_pages_per_site: 5,
            target_keywords: strings(&[
                "python", "machine learning", "sql", "nlp", "scikit-learn", "deep learning",
                "pandas", "statistics",
            ]),
        },
    );
    profiles.insert(
        "scrum_master".to_string(),
        Profile {
            keywords: "scrum master agile project manager".to_string(),
            location: "Île-de-France".to_string(),
            exclude_keywords: strings(&["stage", "intern", "bénévole"]),
            min_salary: Some(45000),
            max_pages_per_site: 3,
            target_keywords: strings(&["scrum", "agile", "kanban", "jira", "safe", "product owner"]),
        },
    );
    profiles.insert(
        "data_analyst".to_string(),
        Profile {
            keywords: "data analyst business intelligence power bi".to_string(),
            location: "Île-de-France".to_string(),
            exclude_keywords: strings(&["stage", "intern", "bénévole"]),
            min_salary: Some(35000),
            max_pages_per_site: 4,
            target_keywords: strings(&["sql", "power bi", "tableau", "excel", "python", "dashboard"]),
        },
    );
    profiles
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "jobpilot")
}

impl Config {
    /// Platform location of the configuration file.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads from `explicit`, else `./jobpilot.toml`, else the platform
    /// config file. With no file at all the built-in defaults are used.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        let candidates = [Some(PathBuf::from(LOCAL_CONFIG_FILE)), Self::default_path()];
        for path in candidates.into_iter().flatten() {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        debug!("no configuration file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.loaded_from = Some(path.to_path_buf());
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn database_path(&self) -> PathBuf {
        self.paths
            .database
            .clone()
            .unwrap_or_else(Database::default_path)
    }

    pub fn cv_template_path(&self) -> PathBuf {
        self.paths.cv_template.clone().unwrap_or_else(|| {
            project_dirs()
                .map(|dirs| dirs.data_dir().join("cv_template.txt"))
                .unwrap_or_else(|| PathBuf::from("cv_template.txt"))
        })
    }

    /// Looks up `name`, or the default profile when `None`.
    pub fn profile<'a>(&'a self, name: Option<&'a str>) -> Result<(&'a str, &'a Profile), ConfigError> {
        let name = name.unwrap_or(self.default_profile.as_str());
        self.profiles
            .get(name)
            .map(|profile| (name, profile))
            .ok_or_else(|| ConfigError::UnknownProfile {
                name: name.to_string(),
                available: self.profiles.keys().cloned().collect::<Vec<_>>().join(", "),
            })
    }

    /// Reports every problem at once, before any network activity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.profiles.is_empty() {
            problems.push("no search profile defined".to_string());
        } else if !self.profiles.contains_key(&self.default_profile) {
            problems.push(format!("default_profile '{}' is not defined", self.default_profile));
        }
        for (name, profile) in &self.profiles {
            if profile.keywords.trim().is_empty() {
                problems.push(format!("profile '{}': keywords are empty", name));
            }
            if profile.max_pages_per_site == 0 {
                problems.push(format!("profile '{}': max_pages_per_site must be at least 1", name));
            }
        }

        let app = &self.application;
        if !app.delay.is_valid() {
            problems.push(format!(
                "application.delay: min ({}) must be >= 0 and <= max ({})",
                app.delay.min, app.delay.max
            ));
        }
        if !(0.0..=1.0).contains(&app.jitter) {
            problems.push(format!("application.jitter must be within [0, 1], got {}", app.jitter));
        }
        if !(0.0..=1.0).contains(&app.success_rate) {
            problems.push(format!(
                "application.success_rate must be within [0, 1], got {}",
                app.success_rate
            ));
        }
        if app.quality.max_application_age_days == Some(0) {
            problems.push("application.quality.max_application_age_days must be at least 1".to_string());
        }
        if app.max_postings_per_cycle == 0 {
            problems.push("application.max_postings_per_cycle must be at least 1".to_string());
        }

        let enabled = self.sites.enabled();
        if enabled.is_empty() {
            problems.push("no site enabled under [sites]".to_string());
        }
        for (source, site) in &enabled {
            if !site.delay.is_valid() {
                problems.push(format!("sites.{}.delay: min must be >= 0 and <= max", source));
            }
            if site.cards_per_page == 0 {
                problems.push(format!("sites.{}.cards_per_page must be at least 1", source));
            }
            if let Some(url) = &site.base_url {
                if let Err(e) = reqwest::Url::parse(url) {
                    problems.push(format!("sites.{}.base_url '{}': {}", source, url, e));
                }
            }
        }

        if self.resume.headline.trim().is_empty() {
            problems.push("resume.headline is empty".to_string());
        }
        let template = self.cv_template_path();
        if !template.is_file() {
            problems.push(format!(
                "CV template missing: {} (run `jobpilot setup`)",
                template.display()
            ));
        }

        if self.strategy == Strategy::Ai {
            match resolve_model(&self.model) {
                Ok(spec) => {
                    if let Err(e) = api_key_from(spec.provider.api_key_var()) {
                        problems.push(e.to_string());
                    }
                }
                Err(e) => problems.push(e),
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Files written by `setup`, with whether each was newly created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupReport {
    pub config: (PathBuf, bool),
    pub cv_template: (PathBuf, bool),
}

/// Writes a default configuration and the base CV template, leaving
/// existing files untouched.
pub fn setup(config: &Config, config_path: &Path) -> Result<SetupReport, ConfigError> {
    let wrote_config = write_if_absent(config_path, &config.to_toml()?)?;
    let template = config.cv_template_path();
    let wrote_template = write_if_absent(&template, &default_cv_template(&config.resume))?;
    Ok(SetupReport {
        config: (config_path.to_path_buf(), wrote_config),
        cv_template: (template, wrote_template),
    })
}

fn write_if_absent(path: &Path, content: &str) -> Result<bool, ConfigError> {
    if path.exists() {
        return Ok(false);
    }
    let io_err = |source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    fs::write(path, content).map_err(io_err)?;
    info!(path = %path.display(), "created");
    Ok(true)
}

pub fn default_cv_template(resume: &ResumeSettings) -> String {
    format!(
        "JANE DOE
{headline}

CONTACT
Paris, France | jane.doe@example.com | +33 6 00 00 00 00
LinkedIn | Portfolio

PROFESSIONAL EXPERIENCE

Digital Project Assistant, work-study (2024/2025)
Rail transport company, Saint-Denis
- Coordinated IT projects in Agile (Scrum) and digital transformation initiatives
- Ran a collaborative portal for occupational health, cutting communication delays by 30%
- Level 3 user support and resolution of complex incidents
- Delivered technical and functional training on newly deployed tools

Digital Project Officer, work-study (2022/2023)
Energy company, Châtillon
- Analysed and optimised existing data flows
- Built data solutions and coordinated teams
- Trained teams on new data visualisation tools

EDUCATION
Master in Data Management (2023/2025)
Bachelor in E-commerce & Digital Marketing (2022/2023)
Technical degree in Statistics & Business Intelligence (2020/2022)

TECHNICAL SKILLS
- Languages: Python, SQL, R, JavaScript, HTML/CSS
- Machine Learning: Scikit-learn, predictive models, NLP
- Data Visualisation: Power BI, dashboards, Jupyter Notebook
- Project Management: Agile (Scrum, Kanban), Jira, Trello
- Databases: complex queries, optimisation, migration

SOFT SKILLS
- Analytical thinking and problem solving
- Team collaboration and coordination
- Adaptability and change management
",
        headline = resume.headline
    )
}
