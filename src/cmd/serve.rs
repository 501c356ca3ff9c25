//! Service and foreground run commands: `code-sentinel serve` and `code-sentinel run`.

use anyhow::Result;
use code_sentinel::config::Config;

pub async fn cmd_serve(mut config: Config, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    code_sentinel::server::start_server(config).await
}

pub async fn cmd_run(
    config: &Config,
    repo_url: &str,
    bug: &str,
    user: &str,
    json: bool,
) -> Result<()> {
    let runner = code_sentinel::server::build_runner(config)?;
    let job = runner.create(user, repo_url, bug).await?;
    println!("Started job {} for {}", job.id, repo_url);

    let outcome = runner.drive(job.id).await;
    // The report is printed for failed runs too; partial results are kept.
    let report = runner.reconciler().report(job.id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        super::jobs::print_report(&report);
    }

    match outcome {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Job {} failed: {}", job.id, e),
    }
}
