use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use std::io::Write;

use crate::models::Posting;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Json,
}

const CSV_HEADER: [&str; 14] = [
    "id",
    "title",
    "company",
    "location",
    "source",
    "status",
    "salary",
    "url",
    "date_scraped",
    "application_date",
    "keywords",
    "description",
    "requirements",
    "cv_adapted",
];

pub fn write(postings: &[Posting], format: ExportFormat, out: &mut dyn Write) -> Result<()> {
    match format {
        ExportFormat::Csv => write_csv(postings, out)?,
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut *out, postings)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(())
}

fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One row per posting, keywords joined with `; `.
pub fn write_csv(postings: &[Posting], out: &mut dyn Write) -> std::io::Result<()> {
    write_row(out, &CSV_HEADER)?;
    for p in postings {
        let keywords = p.keywords.join("; ");
        let date_scraped = timestamp(&p.date_scraped);
        let application_date = p.application_date.as_ref().map(timestamp).unwrap_or_default();
        write_row(
            out,
            &[
                &p.id,
                &p.title,
                &p.company,
                &p.location,
                p.source.as_str(),
                p.status.as_str(),
                p.salary.as_deref().unwrap_or(""),
                &p.url,
                &date_scraped,
                &application_date,
                &keywords,
                &p.description,
                &p.requirements,
                p.cv_adapted.as_deref().unwrap_or(""),
            ],
        )?;
    }
    Ok(())
}

fn write_row(out: &mut dyn Write, fields: &[&str]) -> std::io::Result<()> {
    let line: Vec<String> = fields.iter().map(|f| escape_field(f)).collect();
    writeln!(out, "{}", line.join(","))
}

fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
