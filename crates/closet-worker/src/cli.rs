//! Command line definition.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use closet_store::{JobStatus, JobType};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "closet", version, about = "Clothing detection, indexing and similarity search")]
pub struct Cli {
    /// Data directory (databases and object storage). Defaults to $CLOSET_DATA_DIR or ./data
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the pipeline worker until interrupted
    Worker,
    /// Manage catalog products
    #[command(subcommand)]
    Product(ProductCommand),
    /// Upload a product photo and index the item matching the product
    Index {
        image: PathBuf,
        #[arg(long, value_name = "PRODUCT_ID")]
        product: Uuid,
        #[command(flatten)]
        run: RunOptions,
    },
    /// Upload an outfit photo and find similar catalog items
    Query {
        image: PathBuf,
        #[command(flatten)]
        run: RunOptions,
    },
    /// Show one job
    Job { id: Uuid },
    /// List jobs, newest first
    Jobs {
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
        #[arg(long = "type", value_parser = parse_job_type)]
        job_type: Option<JobType>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show the results of a finished job
    Results { job_id: Uuid },
}

#[derive(Subcommand, Debug)]
pub enum ProductCommand {
    /// Add a product to the catalog
    Add {
        name: String,
        #[arg(long)]
        sku: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        price_cents: Option<i64>,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct RunOptions {
    /// Poll the job until it finishes
    #[arg(long)]
    pub wait: bool,
    /// Process the job in this process instead of leaving it to a worker
    #[arg(long)]
    pub inline: bool,
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse().map_err(|e: closet_core::Error| e.to_string())
}

fn parse_job_type(s: &str) -> Result<JobType, String> {
    s.parse().map_err(|e: closet_core::Error| e.to_string())
}
