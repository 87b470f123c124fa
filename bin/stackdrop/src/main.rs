//! stackdrop deploys declarative infrastructure stacks and publishes their
//! static assets, one stage at a time.

mod cli;
mod report;

use std::{path::Path, process::ExitCode};

use anyhow::{Context, Result};
use clap::Parser;

use cli::{Cli, Command, OutputFormat};
use stackdrop_deploy::{
    Cancellation, DeployConfig, DeploymentPipeline, HttpGateway, StackManager, TracingReporter,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = ?e, "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Init { path, force } => {
            init(&path, force)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Deploy {
            target,
            stage,
            remove,
            concurrency,
        } => {
            let mut config = DeployConfig::load(&cli.config)?;
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency.max(1);
            }
            deploy(&config, &target, &stage, remove, cli.format).await
        }
        Command::Status { target, stage } => {
            let config = DeployConfig::load(&cli.config)?;
            status(&config, &target, &stage, cli.format).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Outputs { target, stage } => {
            let config = DeployConfig::load(&cli.config)?;
            outputs(&config, &target, &stage, cli.format)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }
    DeployConfig::starter()?.save_to_file(path)?;
    println!("Wrote starter manifest to {}", path.display());
    Ok(())
}

fn gateway(config: &DeployConfig) -> Result<HttpGateway> {
    HttpGateway::new(config.gateway_url.clone())
        .with_context(|| format!("Failed to set up gateway client for {}", config.gateway_url))
}

/// Exit status of a process killed by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Cancellation tripped by the first Ctrl-C. A second one exits immediately.
fn interruptible() -> Cancellation {
    let cancel = Cancellation::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::warn!("Interrupted, stopping in-flight work (press Ctrl-C again to exit now)...");
        signal.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::error!("Interrupted again, exiting");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    });
    cancel
}

async fn deploy(
    config: &DeployConfig,
    target: &str,
    stage: &str,
    remove: bool,
    format: OutputFormat,
) -> Result<ExitCode> {
    let targets = config.targets(target, stage)?;
    let gateway = gateway(config)?;
    let reporter = TracingReporter;

    tracing::info!(
        gateway = %config.gateway_url,
        stage,
        targets = targets.len(),
        remove,
        "Starting deployment..."
    );

    let pipeline =
        DeploymentPipeline::new(&gateway, config.settings(stage), &reporter, interruptible());
    let report = if remove {
        pipeline.remove(&targets).await
    } else {
        pipeline.run(&targets).await
    };

    match format {
        OutputFormat::Table => println!("{}", report::pipeline_table(&report)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report::pipeline_json(&report))?
        ),
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn status(
    config: &DeployConfig,
    target: &str,
    stage: &str,
    format: OutputFormat,
) -> Result<()> {
    let targets = config.targets(target, stage)?;
    let gateway = gateway(config)?;
    let manager = StackManager::new(
        &gateway,
        config.settings(stage).stack_poller,
        interruptible(),
    );

    let mut states = Vec::with_capacity(targets.len());
    for target in &targets {
        let state = manager
            .observe(&target.stack.name)
            .await
            .with_context(|| format!("Failed to read stack {}", target.stack.name))?;
        states.push((target.name.clone(), state));
    }

    match format {
        OutputFormat::Table => println!("{}", report::status_table(&states)),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report::status_json(&states))?
        ),
    }
    Ok(())
}

fn outputs(config: &DeployConfig, target: &str, stage: &str, format: OutputFormat) -> Result<()> {
    let unit = config
        .unit(target)
        .with_context(|| format!("Unknown target `{target}`"))?;
    let store = config.outputs_store(&unit.name);

    let record = store.get(stage).with_context(|| {
        format!(
            "No outputs recorded for {target} in stage {stage} ({})",
            store.path().display()
        )
    })?;

    match format {
        OutputFormat::Table => println!("{}", report::outputs_table(&record)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackdrop_deploy::types::StackOutputs;
    use tempdir::TempDir;

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new("stackdrop-cli").unwrap();
        let path = dir.path().join("Stackdrop.toml");

        init(&path, false).unwrap();
        assert!(init(&path, false).is_err());
        init(&path, true).unwrap();

        let config = DeployConfig::load(&path).unwrap();
        assert_eq!(config.units.len(), 2);
    }

    #[test]
    fn test_outputs_reads_persisted_record() {
        let dir = TempDir::new("stackdrop-cli").unwrap();
        let path = dir.path().join("Stackdrop.toml");
        init(&path, false).unwrap();
        let config = DeployConfig::load(&path).unwrap();

        assert!(outputs(&config, "site", "dev", OutputFormat::Json).is_err());

        let bucket: StackOutputs = [("BucketName".to_string(), "site-dev-assets".to_string())]
            .into_iter()
            .collect();
        config
            .outputs_store("site")
            .save("dev", bucket, None)
            .unwrap();

        outputs(&config, "site", "dev", OutputFormat::Table).unwrap();
        assert!(outputs(&config, "worker", "dev", OutputFormat::Table).is_err());
    }
}
