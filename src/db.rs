use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::models::{Posting, Source, Status};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("posting '{0}' not found")]
    NotFound(String),

    #[error("posting '{id}' cannot move from {from} to {to}")]
    InvalidTransition { id: String, from: Status, to: Status },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed keywords column: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed column value: {0}")]
    Column(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Refreshed,
}

/// Partial update applied by [`Database::update_status`].
#[derive(Debug, Clone)]
pub struct StatusUpdate<'a> {
    pub status: Status,
    pub keywords: Option<&'a [String]>,
    pub cv_adapted: Option<&'a str>,
    pub application_date: Option<DateTime<Utc>>,
}

impl StatusUpdate<'_> {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            keywords: None,
            cv_adapted: None,
            application_date: None,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, title, company, location, description, requirements, salary,
        url, source, date_scraped, keywords, status, cv_adapted, application_date
 FROM jobs";

pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.init()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> StoreResult<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    pub fn default_path() -> PathBuf {
        // Use XDG data directory or fallback
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobpilot") {
            proj_dirs.data_dir().join("jobs.db")
        } else {
            PathBuf::from("jobs.db")
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn init(&self) -> StoreResult<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                company TEXT NOT NULL DEFAULT '',
                location TEXT NOT NULL DEFAULT '',
                description TEXT NOT NULL DEFAULT '',
                requirements TEXT NOT NULL DEFAULT '',
                salary TEXT,
                url TEXT NOT NULL DEFAULT '',
                source TEXT NOT NULL,
                date_scraped TEXT NOT NULL,
                keywords TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'scraped' CHECK (status IN ('scraped', 'test', 'applied', 'responded', 'rejected')),
                cv_adapted TEXT,
                application_date TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status, date_scraped);
            "#,
        )?;
        Ok(())
    }

    /// Inserts a new posting or refreshes an existing one.
    ///
    /// A refresh only rewrites descriptive fields. `status`, `date_scraped`,
    /// `application_date` and `cv_adapted` keep their stored values,
    /// `keywords` are replaced only by a non-empty list, and a fetched full
    /// description is not overwritten by a shorter listing snippet.
    pub fn upsert(&self, posting: &Posting) -> StoreResult<UpsertOutcome> {
        let tx = self.conn.unchecked_transaction()?;

        let exists = tx
            .query_row("SELECT 1 FROM jobs WHERE id = ?1", [&posting.id], |_| Ok(()))
            .optional()?
            .is_some();

        let keywords = serde_json::to_string(&posting.keywords)?;

        let outcome = if exists {
            tx.execute(
                "UPDATE jobs SET title = ?2, company = ?3, location = ?4,
                        description = CASE WHEN length(?5) >= length(description) THEN ?5 ELSE description END,
                        requirements = ?6, salary = ?7, url = ?8, source = ?9,
                        keywords = CASE WHEN ?10 = '[]' THEN keywords ELSE ?10 END
                 WHERE id = ?1",
                params![
                    posting.id,
                    posting.title,
                    posting.company,
                    posting.location,
                    posting.description,
                    posting.requirements,
                    posting.salary,
                    posting.url,
                    posting.source.as_str(),
                    keywords,
                ],
            )?;
            UpsertOutcome::Refreshed
        } else {
            tx.execute(
                "INSERT INTO jobs (id, title, company, location, description, requirements, salary,
                                   url, source, date_scraped, keywords, status, cv_adapted, application_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                params![
                    posting.id,
                    posting.title,
                    posting.company,
                    posting.location,
                    posting.description,
                    posting.requirements,
                    posting.salary,
                    posting.url,
                    posting.source.as_str(),
                    format_timestamp(&posting.date_scraped),
                    keywords,
                    posting.status.as_str(),
                    posting.cv_adapted,
                    posting.application_date.as_ref().map(format_timestamp),
                ],
            )?;
            UpsertOutcome::Inserted
        };

        tx.commit()?;
        debug!(posting_id = %posting.id, ?outcome, "upserted posting");
        Ok(outcome)
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<Posting>> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        let raw = self
            .conn
            .query_row(&sql, [id], RawPosting::from_row)
            .optional()?;
        raw.map(RawPosting::into_posting).transpose()
    }

    /// All postings with `status`, oldest `date_scraped` first.
    pub fn list_by_status(&self, status: Status) -> StoreResult<Vec<Posting>> {
        let sql = format!(
            "{} WHERE status = ?1 ORDER BY date_scraped ASC, id ASC",
            SELECT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([status.as_str()], RawPosting::from_row)?;

        let mut postings = Vec::new();
        for raw in rows {
            postings.push(raw?.into_posting()?);
        }
        Ok(postings)
    }

    /// Postings for display, newest first, optionally filtered by status.
    pub fn list(&self, status: Option<Status>, limit: Option<usize>) -> StoreResult<Vec<Posting>> {
        let mut sql = String::from(SELECT_COLUMNS);
        if status.is_some() {
            sql.push_str(" WHERE status = ?1");
        }
        sql.push_str(" ORDER BY date_scraped DESC, id ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(s) = status {
            stmt.query_map([s.as_str()], RawPosting::from_row)?
        } else {
            stmt.query_map([], RawPosting::from_row)?
        };

        let mut postings = Vec::new();
        for raw in rows {
            postings.push(raw?.into_posting()?);
        }
        Ok(postings)
    }

    /// Partial lifecycle update. Fields left as `None` keep their stored value.
    pub fn update_status(&self, id: &str, update: StatusUpdate<'_>) -> StoreResult<()> {
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<String> = tx
            .query_row("SELECT status FROM jobs WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        let current = match current {
            Some(s) => parse_status(&s)?,
            None => return Err(StoreError::NotFound(id.to_string())),
        };

        if !current.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current,
                to: update.status,
            });
        }

        let keywords = update.keywords.map(serde_json::to_string).transpose()?;

        tx.execute(
            "UPDATE jobs SET status = ?2,
                    keywords = COALESCE(?3, keywords),
                    cv_adapted = COALESCE(?4, cv_adapted),
                    application_date = COALESCE(?5, application_date)
             WHERE id = ?1",
            params![
                id,
                update.status.as_str(),
                keywords,
                update.cv_adapted,
                update.application_date.as_ref().map(format_timestamp),
            ],
        )?;

        tx.commit()?;
        debug!(posting_id = %id, from = %current, to = %update.status, "status updated");
        Ok(())
    }

    pub fn count_by_status(&self) -> StoreResult<Vec<(Status, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts: Vec<(Status, usize)> = Status::ALL.iter().map(|s| (*s, 0)).collect();
        for row in rows {
            let (status, count) = row?;
            let status = parse_status(&status)?;
            if let Some(entry) = counts.iter_mut().find(|(s, _)| *s == status) {
                entry.1 = count as usize;
            }
        }
        Ok(counts)
    }

    /// Application timestamps at or after `since`, oldest first. A posting
    /// keeps counting after a later move to `responded` or `rejected`.
    pub fn application_dates_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<DateTime<Utc>>> {
        let mut stmt = self.conn.prepare(
            "SELECT application_date FROM jobs
             WHERE application_date IS NOT NULL AND application_date >= ?1
             ORDER BY application_date ASC",
        )?;
        let rows = stmt.query_map([format_timestamp(&since)], |row| row.get::<_, String>(0))?;

        let mut dates = Vec::new();
        for row in rows {
            dates.push(parse_timestamp(&row?)?);
        }
        Ok(dates)
    }
}

/// Column values as stored, before enum and timestamp parsing.
struct RawPosting {
    id: String,
    title: String,
    company: String,
    location: String,
    description: String,
    requirements: String,
    salary: Option<String>,
    url: String,
    source: String,
    date_scraped: String,
    keywords: String,
    status: String,
    cv_adapted: Option<String>,
    application_date: Option<String>,
}

impl RawPosting {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            company: row.get(2)?,
            location: row.get(3)?,
            description: row.get(4)?,
            requirements: row.get(5)?,
            salary: row.get(6)?,
            url: row.get(7)?,
            source: row.get(8)?,
            date_scraped: row.get(9)?,
            keywords: row.get(10)?,
            status: row.get(11)?,
            cv_adapted: row.get(12)?,
            application_date: row.get(13)?,
        })
    }

    fn into_posting(self) -> StoreResult<Posting> {
        Ok(Posting {
            source: self.source.parse::<Source>().map_err(StoreError::Column)?,
            status: parse_status(&self.status)?,
            keywords: serde_json::from_str(&self.keywords)?,
            date_scraped: parse_timestamp(&self.date_scraped)?,
            application_date: self.application_date.as_deref().map(parse_timestamp).transpose()?,
            id: self.id,
            title: self.title,
            company: self.company,
            location: self.location,
            description: self.description,
            requirements: self.requirements,
            salary: self.salary,
            url: self.url,
            cv_adapted: self.cv_adapted,
        })
    }
}

// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Column(format!("timestamp '{}': {}", s, e)))
}

fn parse_status(s: &str) -> StoreResult<Status> {
    s.parse::<Status>().map_err(StoreError::Column)
}
