//! Closet — clothing detection, catalog indexing and similarity search.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::json;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod app;
mod cli;

use app::App;
use cli::{Cli, Command, ProductCommand, RunOptions};
use closet_core::ClosetConfig;
use closet_pipeline::{create_indexing_job, create_querying_job, submit_indexing, submit_querying};
use closet_store::{Job, JobFilter, JobType, NewProduct};

fn resolve_data_dir(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var("CLOSET_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let data_dir = resolve_data_dir(cli.data_dir);
    let config = ClosetConfig::from_env(&data_dir)
        .with_context(|| format!("preparing data directory {}", data_dir.display()))?;
    let app = App::open(config)?;

    match cli.command {
        Command::Worker => run_worker(&app).await,
        Command::Product(ProductCommand::Add {
            name,
            sku,
            description,
            price_cents,
        }) => {
            let product = app.store.add_product(NewProduct {
                sku,
                name,
                description,
                price_cents,
            })?;
            print_json(&product)
        }
        Command::Index { image, product, run } => {
            let (bytes, filename) = read_upload(&image).await?;
            let job = create_indexing_job(
                &app.store,
                app.objects.as_ref(),
                &app.config.pipeline.images_bucket,
                bytes,
                &filename,
                product,
            )
            .await?;
            submit_indexing(&app.queue, job.id)?;
            follow_job(&app, job, run).await
        }
        Command::Query { image, run } => {
            let (bytes, filename) = read_upload(&image).await?;
            let job = create_querying_job(
                &app.store,
                app.objects.as_ref(),
                &app.config.pipeline.images_bucket,
                bytes,
                &filename,
            )
            .await?;
            submit_querying(&app.queue, job.id)?;
            follow_job(&app, job, run).await
        }
        Command::Job { id } => print_json(&load_job(&app, id)?),
        Command::Jobs {
            status,
            job_type,
            limit,
            offset,
        } => {
            let jobs = app.store.list_jobs(&JobFilter {
                status,
                job_type,
                limit,
                offset,
            })?;
            print_json(&jobs)
        }
        Command::Results { job_id } => print_results(&app, job_id),
    }
}

async fn run_worker(app: &App) -> anyhow::Result<()> {
    let worker = app.worker()?;
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            let _ = stop_tx.send(true);
        }
    });
    worker.run(stop_rx).await?;
    Ok(())
}

async fn read_upload(path: &Path) -> anyhow::Result<(Vec<u8>, String)> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());
    Ok((bytes, filename))
}

fn load_job(app: &App, id: Uuid) -> anyhow::Result<Job> {
    app.store
        .get_job(id)?
        .with_context(|| format!("job {} not found", id))
}

/// Print the new job, then optionally process and/or watch it.
async fn follow_job(app: &App, job: Job, run: RunOptions) -> anyhow::Result<()> {
    info!("Created {} job {}", job.job_type, job.id);
    if run.inline {
        let processed = app.worker()?.run_until_idle().await?;
        info!("Processed {} tasks", processed);
    }
    if !run.wait && !run.inline {
        return print_json(&job);
    }

    let mut last_details = None;
    loop {
        let current = load_job(app, job.id)?;
        if current.processing_details != last_details {
            if let Some(details) = &current.processing_details {
                eprintln!("[{}] {}", current.status, details);
            }
            last_details = current.processing_details.clone();
        }
        if current.is_terminal() {
            print_json(&current)?;
            if current.status == closet_store::JobStatus::Failed {
                bail!("job {} failed", current.id);
            }
            return Ok(());
        }
        if run.inline {
            warn!("Queue drained but job {} is still {}", current.id, current.status);
            return print_json(&current);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

fn print_results(app: &App, job_id: Uuid) -> anyhow::Result<()> {
    let job = load_job(app, job_id)?;
    match job.job_type {
        JobType::Indexing => {
            let result = app.store.get_indexing_result(job_id)?;
            print_json(&json!({ "job": job, "result": result }))
        }
        JobType::Querying => {
            let cloths = match app.store.get_query_result(job_id)? {
                Some(qr) => app.store.get_query_cloths(qr.id)?,
                None => Vec::new(),
            };
            print_json(&json!({ "job": job, "cloths": cloths }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_flag_wins() {
        let dir = resolve_data_dir(Some(PathBuf::from("/tmp/x")));
        assert_eq!(dir, PathBuf::from("/tmp/x"));
    }

    #[tokio::test]
    async fn test_read_upload_keeps_filename() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("look.png");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();
        let (bytes, name) = read_upload(&path).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(name, "look.png");
    }
}
