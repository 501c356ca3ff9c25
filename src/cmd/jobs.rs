//! Job inspection commands. These only need the database, not a sandbox
//! provider or model endpoint.

use std::str::FromStr;

use anyhow::{Context, Result};
use code_sentinel::config::Config;
use code_sentinel::db::{DbHandle, JobFilter, SentinelDb, Transition};
use code_sentinel::engine::reconciler::{bug_category, bug_severity};
use code_sentinel::engine::{Reconciler, RunVerdict};
use sentinel_common::{JobReport, JobStatus};

fn open_db(config: &Config) -> Result<DbHandle> {
    let path = &config.database.path;
    if !path.exists() {
        anyhow::bail!(
            "No database at {}. Start the service or run a job first.",
            path.display()
        );
    }
    let db = SentinelDb::new(path).context("Failed to open sentinel database")?;
    Ok(DbHandle::new(db))
}

pub fn print_report(report: &JobReport) {
    println!();
    println!("Status:  {}", report.status);
    println!("Verdict: {:?}", RunVerdict::for_report(report));
    if !report.summary.is_empty() {
        println!();
        println!("{}", report.summary);
    }
    if !report.test_results.is_empty() {
        println!();
        println!("Tests:");
        for test in &report.test_results {
            println!("  [{}] {} ({})", test.status, test.test_name, test.test_file);
        }
    }
    if !report.detected_errors.is_empty() {
        println!();
        println!("Bugs:");
        for bug in &report.detected_errors {
            println!(
                "  [{:?}/{:?}] {} ({})",
                bug_severity(bug),
                bug_category(bug),
                bug.message,
                bug.source_file.as_deref().unwrap_or("unknown")
            );
        }
    }
    println!();
}

pub async fn cmd_status(config: &Config, job_id: i64, json: bool) -> Result<()> {
    let db = open_db(config)?;
    let report = Reconciler::new(db).report(job_id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Job {}", job_id);
        print_report(&report);
    }
    Ok(())
}

pub async fn cmd_list(config: &Config, status: Option<&str>, limit: u32) -> Result<()> {
    let status = status
        .map(JobStatus::from_str)
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let db = open_db(config)?;
    let filter = JobFilter {
        user_id: None,
        status,
        limit: Some(limit),
    };
    let jobs = db.call(move |db| db.list_jobs(&filter)).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:<6} {:<11} {:<20} Bug", "Id", "Status", "Created");
    for job in &jobs {
        let bug: String = job.bug_description.chars().take(60).collect();
        println!(
            "{:<6} {:<11} {:<20} {}",
            job.id,
            job.status.as_str(),
            job.created_at,
            bug.replace('\n', " ")
        );
    }
    Ok(())
}

pub async fn cmd_cancel(config: &Config, job_id: i64) -> Result<()> {
    let db = open_db(config)?;
    let transition = db
        .call(move |db| {
            if db.get_job(job_id)?.is_none() {
                anyhow::bail!("Job {} not found", job_id);
            }
            db.cancel_job(job_id)
        })
        .await?;
    match transition {
        Transition::Applied(_) => println!("Job {} canceled.", job_id),
        other => anyhow::bail!(
            "Job {} is not running (status {})",
            job_id,
            other.job().status
        ),
    }
    Ok(())
}

pub async fn cmd_compare(config: &Config, base: i64, target: i64) -> Result<()> {
    let db = open_db(config)?;
    let comparison = Reconciler::new(db).compare_runs(base, target).await?;
    println!(
        "Run {} ({} bugs) -> run {} ({} bugs)",
        comparison.base_run.id,
        comparison.base_run.bug_count,
        comparison.compare_run.id,
        comparison.compare_run.bug_count
    );
    for (label, bugs) in [
        ("New", &comparison.new_bugs),
        ("Fixed", &comparison.fixed_bugs),
        ("Unchanged", &comparison.unchanged_bugs),
    ] {
        println!();
        println!("{} ({}):", label, bugs.len());
        for bug in bugs {
            println!("  - {}", bug.comparison_key());
        }
    }
    Ok(())
}
