mod adapt;
mod ai;
mod apply;
mod browser;
mod classify;
mod config;
mod db;
mod export;
mod models;
mod pacing;
mod pipeline;
mod source;
mod tui;

use adapt::{Adapter, AiAdapter, TemplateAdapter};
use ai::{create_provider, resolve_model};
use anyhow::{anyhow, Context, Result};
use apply::{Applicant, ApplyMode, BrowserApplicant, SimulatedApplicant};
use browser::WebDriverSession;
use chrono::Utc;
use clap::{Parser, Subcommand};
use classify::{AiClassifier, Classifier, KeywordClassifier};
use config::{Config, Strategy, LOCAL_CONFIG_FILE};
use db::{Database, StatusUpdate};
use export::ExportFormat;
use models::{Posting, RunSummary, Status};
use pacing::{RandomDelay, ThreadSleeper};
use pipeline::Pipeline;
use source::SiteSource;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobpilot")]
#[command(about = "Job application automation - scrape, classify, tailor and apply")]
struct Cli {
    /// Configuration file (defaults to ./jobpilot.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration and CV template if absent
    Setup,

    /// Check the configuration without touching the network
    Validate,

    /// Run one scrape → classify → adapt → apply cycle
    Run {
        /// Search profile (defaults to default_profile)
        #[arg(short, long)]
        profile: Option<String>,

        /// Record postings as test instead of applying
        #[arg(long)]
        dry_run: bool,
    },

    /// Browse postings in a terminal dashboard
    Dashboard {
        /// Only show postings with this status
        #[arg(short, long)]
        status: Option<Status>,
    },

    /// List postings
    List {
        /// Filter by status (scraped, test, applied, responded, rejected)
        #[arg(short, long)]
        status: Option<Status>,

        /// Maximum number of postings to show
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show posting details
    Show {
        /// Posting ID
        id: String,
    },

    /// Move a posting to a new status
    Mark {
        /// Posting ID
        id: String,

        /// New status
        status: Status,
    },

    /// Export postings
    Export {
        #[arg(short, long, value_enum, default_value = "csv")]
        format: ExportFormat,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only export postings with this status
        #[arg(short, long)]
        status: Option<Status>,
    },

    /// Posting counts per status
    Stats,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("jobpilot=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn open_store(config: &Config) -> Result<Database> {
    let path = config.database_path();
    Database::open(&path).with_context(|| format!("opening database at {}", path.display()))
}

fn setup_command(config: &Config, explicit: Option<&Path>) -> Result<()> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| config.loaded_from.clone())
        .or_else(Config::default_path)
        .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE));

    let report = config::setup(config, &path)?;
    for (label, (path, created)) in [("Config", &report.config), ("CV template", &report.cv_template)] {
        if *created {
            println!("{} written to {}", label, path.display());
        } else {
            println!("{} already exists at {}", label, path.display());
        }
    }

    let db = open_store(config)?;
    if let Some(path) = db.path() {
        println!("Database ready at {}", path.display());
    }
    Ok(())
}

fn run_command(config: &Config, profile: Option<&str>, dry_run: bool) -> Result<()> {
    config.validate()?;
    let (profile_name, profile) = config.profile(profile)?;
    let db = open_store(config)?;

    let template = config.cv_template_path();
    let base_resume = std::fs::read_to_string(&template)
        .with_context(|| format!("reading CV template {}", template.display()))?;

    let provider = match config.strategy {
        Strategy::Ai => {
            let spec = resolve_model(&config.model).map_err(|e| anyhow!(e))?;
            let provider = create_provider(&spec).context("creating language-model provider")?;
            info!(model = %spec.short_name, model_id = provider.model_name(), "language model selected");
            Some(provider)
        }
        Strategy::Keyword => None,
    };
    let (classifier, adapter): (Box<dyn Classifier + '_>, Box<dyn Adapter + '_>) = match provider.as_deref() {
        Some(provider) => (
            Box::new(AiClassifier::new(provider)),
            Box::new(AiAdapter::new(provider)),
        ),
        None => (
            Box::new(KeywordClassifier),
            Box::new(TemplateAdapter::new(config.resume.clone())),
        ),
    };

    let live_browser = !dry_run && config.application.mode == ApplyMode::Browser;
    let applicant: Box<dyn Applicant> = if live_browser {
        let session = WebDriverSession::open(&config.browser).context("opening apply browser session")?;
        Box::new(BrowserApplicant::new(session))
    } else {
        Box::new(SimulatedApplicant::new(
            RandomDelay::new(Box::new(ThreadSleeper)),
            config.application.success_rate,
        ))
    };

    let session = WebDriverSession::open(&config.browser).context("opening search browser session")?;
    let source = SiteSource::new(
        session,
        config.sites.enabled(),
        RandomDelay::new(Box::new(ThreadSleeper)),
    );

    info!(
        profile = profile_name,
        strategy = ?config.strategy,
        mode = %config.application.mode,
        dry_run,
        "starting run"
    );

    let mut pipeline = Pipeline::new(
        &db,
        source,
        classifier,
        adapter,
        applicant,
        config.application.clone(),
        RandomDelay::new(Box::new(ThreadSleeper)),
        base_resume,
    )?;
    let summary = pipeline.run_cycle(profile, dry_run)?;

    if let Err(e) = pipeline.into_source().into_driver().close() {
        warn!(error = %e, "browser session did not close cleanly");
    }

    print_summary(profile_name, &summary, dry_run);
    Ok(())
}

fn secs(d: Duration) -> String {
    format!("{:.1}s", d.as_secs_f64())
}

fn print_summary(profile: &str, s: &RunSummary, dry_run: bool) {
    println!("Run summary for profile '{}'{}", profile, if dry_run { " (dry run)" } else { "" });
    println!("{}", "-".repeat(44));
    println!("{:<28} {:>8}", "Discovered", s.discovered);
    println!("{:<28} {:>8}", "Excluded", s.excluded);
    println!("{:<28} {:>8}", "New", s.persisted_new);
    println!("{:<28} {:>8}", "Already known", s.persisted_duplicate);
    println!("{:<28} {:>8}", "Fetch errors", s.fetch_errors);
    println!("{:<28} {:>8}", "Session errors", s.session_errors);
    println!("{:<28} {:>8}", "Selected", s.selected);
    println!("{:<28} {:>8}", "Past age limit", s.stale_skipped);
    println!("{:<28} {:>8}", "Full text fetched", s.full_text_fetched);
    println!("{:<28} {:>8}", "Full text unavailable", s.full_text_unavailable);
    println!("{:<28} {:>8}", "Classified", s.classified);
    println!("{:<28} {:>8}", "Adapted", s.adapted);
    println!("{:<28} {:>8}", "Keyword fallbacks", s.classify_fallbacks);
    println!("{:<28} {:>8}", "CV fallbacks", s.adapt_fallbacks);
    if dry_run {
        println!("{:<28} {:>8}", "Recorded as test", s.recorded_test);
    } else {
        println!("{:<28} {:>8}", "Applied", s.applied_ok);
        println!("{:<28} {:>8}", "Application failures", s.applied_failed);
    }
    println!("{:<28} {:>8}", "Store errors", s.store_errors);
    if let Some(window) = s.cap_reached {
        println!("{:<28} {:>8}", "Cap reached", window.to_string());
    }
    println!(
        "{:<28} {:>8}",
        "Delays (fetch/posting/pause)",
        format!("{}/{}/{}", secs(s.fetch_delay), secs(s.posting_delay), secs(s.pause_delay))
    );
    println!("{:<28} {:>8}", "Pauses", s.pauses);
    println!("{:<28} {:>8}", "Total waiting", secs(s.total_delay()));
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

fn print_posting(posting: &Posting) {
    println!("Posting {}", posting.id);
    println!("Title: {}", posting.title);
    println!("Company: {}", posting.company);
    println!("Location: {}", posting.location);
    println!("Status: {}", posting.status);
    println!("Source: {}", posting.source);
    println!("URL: {}", posting.url);
    if let Some(salary) = &posting.salary {
        println!("Salary: {}", salary);
    }
    println!("Scraped: {}", posting.date_scraped.format("%Y-%m-%d %H:%M"));
    if let Some(applied) = posting.application_date {
        println!("Applied: {}", applied.format("%Y-%m-%d %H:%M"));
    }
    if !posting.keywords.is_empty() {
        println!("Keywords: {}", posting.keywords.join(", "));
    }
    println!("\n--- Description ---\n{}", posting.description);
    if !posting.requirements.is_empty() {
        println!("\n--- Requirements ---\n{}", posting.requirements);
    }
    if let Some(cv) = &posting.cv_adapted {
        println!("\n--- Adapted CV ---\n{}", cv);
    }
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    // `setup` may be pointed at a config file it is about to create.
    let fresh_setup =
        matches!(cli.command, Commands::Setup) && cli.config.as_ref().is_some_and(|p| !p.exists());
    let config = if fresh_setup {
        Config::default()
    } else {
        Config::load(cli.config.as_deref())?
    };

    match cli.command {
        Commands::Setup => setup_command(&config, cli.config.as_deref())?,

        Commands::Validate => {
            config.validate()?;
            match &config.loaded_from {
                Some(path) => println!("Configuration OK ({})", path.display()),
                None => println!("Configuration OK (built-in defaults)"),
            }
            println!("Profiles: {}", config.profiles.keys().cloned().collect::<Vec<_>>().join(", "));
            let sites: Vec<String> = config.sites.enabled().iter().map(|(s, _)| s.to_string()).collect();
            println!("Sites: {}", sites.join(", "));
            println!("Strategy: {:?}, apply mode: {}", config.strategy, config.application.mode);
        }

        Commands::Run { profile, dry_run } => run_command(&config, profile.as_deref(), dry_run)?,

        Commands::Dashboard { status } => {
            let db = open_store(&config)?;
            tui::run_dashboard(&db, status)?;
        }

        Commands::List { status, limit } => {
            let db = open_store(&config)?;
            let postings = db.list(status, limit)?;
            if postings.is_empty() {
                println!("No postings found.");
            } else {
                println!(
                    "{:<24} {:<10} {:<32} {:<20} {:<16}",
                    "ID", "STATUS", "TITLE", "COMPANY", "LOCATION"
                );
                println!("{}", "-".repeat(106));
                for p in postings {
                    println!(
                        "{:<24} {:<10} {:<32} {:<20} {:<16}",
                        truncate(&p.id, 24),
                        p.status,
                        truncate(&p.title, 30),
                        truncate(&p.company, 18),
                        truncate(&p.location, 16)
                    );
                }
            }
        }

        Commands::Show { id } => {
            let db = open_store(&config)?;
            match db.get(&id)? {
                Some(posting) => print_posting(&posting),
                None => println!("Posting {} not found.", id),
            }
        }

        Commands::Mark { id, status } => {
            let db = open_store(&config)?;
            let mut update = StatusUpdate::status(status);
            if status.counts_as_application() {
                update.application_date = Some(Utc::now());
            }
            db.update_status(&id, update)?;
            println!("Marked {} as {}.", id, status);
        }

        Commands::Export {
            format,
            output,
            status,
        } => {
            let db = open_store(&config)?;
            let postings = db.list(status, None)?;
            match &output {
                Some(path) => {
                    let file = File::create(path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    export::write(&postings, format, &mut BufWriter::new(file))?;
                    println!("Exported {} postings to {}", postings.len(), path.display());
                }
                None => export::write(&postings, format, &mut io::stdout().lock())?,
            }
        }

        Commands::Stats => {
            let db = open_store(&config)?;
            let counts = db.count_by_status()?;
            let total: usize = counts.iter().map(|(_, n)| n).sum();
            println!("{:<12} {:>6}", "STATUS", "COUNT");
            println!("{}", "-".repeat(19));
            for (status, n) in &counts {
                println!("{:<12} {:>6}", status.as_str(), n);
            }
            println!("{}", "-".repeat(19));
            println!("{:<12} {:>6}", "total", total);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("Ingénieur données senior", 12), "Ingénieur...");
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["jobpilot", "run", "--profile", "data_analyst", "--dry-run"]).unwrap();
        match cli.command {
            Commands::Run { profile, dry_run } => {
                assert_eq!(profile.as_deref(), Some("data_analyst"));
                assert!(dry_run);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_parses_mark_status() {
        let cli = Cli::try_parse_from(["jobpilot", "mark", "indeed_a1", "responded"]).unwrap();
        match cli.command {
            Commands::Mark { id, status } => {
                assert_eq!(id, "indeed_a1");
                assert_eq!(status, Status::Responded);
            }
            _ => panic!("expected mark"),
        }
        assert!(Cli::try_parse_from(["jobpilot", "mark", "indeed_a1", "hired"]).is_err());
    }
}
