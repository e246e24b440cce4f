//! Queue task handlers for every pipeline stage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::context::StageContext;
use crate::graph::*;
use crate::orchestrator::{orchestrate_indexing, orchestrate_querying};
use crate::stages::{self, LabeledItem};
use closet_core::{Error, Result};
use closet_queue::{TaskHandler, TaskOutput, TaskRegistry};

/// Pipeline tasks, one handler each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    OrchestrateIndexing,
    OrchestrateQuerying,
    DetectItems,
    FanOutIndexing,
    FanOutQuerying,
    LabelItem,
    SelectAndStore,
    QueryItem,
    FinalizeIndexing,
    FinalizeQuerying,
    MarkJobFailed,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::OrchestrateIndexing,
        Stage::OrchestrateQuerying,
        Stage::DetectItems,
        Stage::FanOutIndexing,
        Stage::FanOutQuerying,
        Stage::LabelItem,
        Stage::SelectAndStore,
        Stage::QueryItem,
        Stage::FinalizeIndexing,
        Stage::FinalizeQuerying,
        Stage::MarkJobFailed,
    ];

    pub fn task_name(&self) -> &'static str {
        match self {
            Stage::OrchestrateIndexing => ORCHESTRATE_INDEXING,
            Stage::OrchestrateQuerying => ORCHESTRATE_QUERYING,
            Stage::DetectItems => DETECT_ITEMS,
            Stage::FanOutIndexing => FAN_OUT_INDEXING,
            Stage::FanOutQuerying => FAN_OUT_QUERYING,
            Stage::LabelItem => LABEL_ITEM,
            Stage::SelectAndStore => SELECT_AND_STORE,
            Stage::QueryItem => QUERY_ITEM,
            Stage::FinalizeIndexing => FINALIZE_INDEXING,
            Stage::FinalizeQuerying => FINALIZE_QUERYING,
            Stage::MarkJobFailed => MARK_JOB_FAILED,
        }
    }
}

/// Register a handler for every stage.
pub fn register_stages(registry: &mut TaskRegistry, ctx: Arc<StageContext>) {
    for stage in Stage::ALL {
        registry.register(
            stage.task_name(),
            Arc::new(StageTask {
                stage,
                ctx: ctx.clone(),
            }),
        );
    }
}

#[derive(Debug, Deserialize)]
struct JobArgs {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct DetectArgs {
    job_id: Uuid,
    image_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct IndexingArgs {
    job_id: Uuid,
    product_id: Uuid,
    collection: String,
}

#[derive(Debug, Deserialize)]
struct QueryingArgs {
    job_id: Uuid,
    query_result_id: Uuid,
    collection: String,
}

#[derive(Debug, Deserialize)]
struct LabelArgs {
    job_id: Uuid,
    crop_id: Uuid,
    index: usize,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct QueryItemArgs {
    job_id: Uuid,
    query_result_id: Uuid,
    collection: String,
    total: usize,
}

#[derive(Debug, Deserialize)]
struct FinalizeIndexingArgs {
    job_id: Uuid,
    created_crop_ids: Vec<Uuid>,
}

fn parse_args<T: DeserializeOwned>(stage: Stage, args: Value) -> Result<T> {
    serde_json::from_value(args)
        .map_err(|e| Error::Validation(format!("bad arguments for {}: {}", stage.task_name(), e)))
}

fn parse_input<T: DeserializeOwned>(stage: Stage, input: Option<Value>) -> Result<T> {
    let input = input.ok_or_else(|| {
        Error::Validation(format!("{} expects the previous result as input", stage.task_name()))
    })?;
    serde_json::from_value(input)
        .map_err(|e| Error::Validation(format!("bad input for {}: {}", stage.task_name(), e)))
}

fn value<T: serde::Serialize>(v: T) -> Result<TaskOutput> {
    Ok(TaskOutput::Value(serde_json::to_value(v)?))
}

struct StageTask {
    stage: Stage,
    ctx: Arc<StageContext>,
}

#[async_trait]
impl TaskHandler for StageTask {
    async fn run(&self, args: Value, input: Option<Value>) -> Result<TaskOutput> {
        let ctx = self.ctx.as_ref();
        let stage = self.stage;
        match stage {
            Stage::OrchestrateIndexing | Stage::OrchestrateQuerying => {
                let a: JobArgs = parse_args(stage, args)?;
                let graph = if stage == Stage::OrchestrateIndexing {
                    orchestrate_indexing(ctx, a.job_id)?
                } else {
                    orchestrate_querying(ctx, a.job_id)?
                };
                Ok(match graph {
                    Some(graph) => TaskOutput::Replace(graph),
                    None => TaskOutput::Value(Value::Null),
                })
            }
            Stage::DetectItems => {
                let a: DetectArgs = parse_args(stage, args)?;
                value(stages::detect_items(ctx, a.job_id, a.image_id).await?)
            }
            Stage::FanOutIndexing => {
                let a: IndexingArgs = parse_args(stage, args)?;
                let crop_ids: Vec<Uuid> = parse_input(stage, input)?;
                Ok(TaskOutput::Replace(indexing_fan_out(
                    a.job_id,
                    a.product_id,
                    &a.collection,
                    &crop_ids,
                )))
            }
            Stage::FanOutQuerying => {
                let a: QueryingArgs = parse_args(stage, args)?;
                let crop_ids: Vec<Uuid> = parse_input(stage, input)?;
                Ok(TaskOutput::Replace(querying_fan_out(
                    a.job_id,
                    a.query_result_id,
                    &a.collection,
                    &crop_ids,
                )))
            }
            Stage::LabelItem => {
                let a: LabelArgs = parse_args(stage, args)?;
                value(stages::label_item(ctx, a.job_id, a.crop_id, a.index, a.total).await?)
            }
            Stage::SelectAndStore => {
                let a: IndexingArgs = parse_args(stage, args)?;
                let items: Vec<LabeledItem> = parse_input(stage, input)?;
                value(
                    stages::select_and_store(ctx, a.job_id, a.product_id, &a.collection, items)
                        .await?,
                )
            }
            Stage::QueryItem => {
                let a: QueryItemArgs = parse_args(stage, args)?;
                let item: LabeledItem = parse_input(stage, input)?;
                value(
                    stages::query_item(ctx, a.job_id, a.query_result_id, &a.collection, a.total, item)
                        .await?,
                )
            }
            Stage::FinalizeIndexing => {
                let a: FinalizeIndexingArgs = parse_args(stage, args)?;
                let selected: LabeledItem = parse_input(stage, input)?;
                value(stages::finalize_indexing(ctx, a.job_id, &a.created_crop_ids, selected)?)
            }
            Stage::FinalizeQuerying => {
                let a: JobArgs = parse_args(stage, args)?;
                let cloth_ids: Vec<Uuid> = parse_input(stage, input)?;
                stages::finalize_querying(ctx, a.job_id, &cloth_ids)?;
                Ok(TaskOutput::Value(Value::Null))
            }
            Stage::MarkJobFailed => {
                let a: JobArgs = parse_args(stage, args)?;
                let message = input
                    .as_ref()
                    .and_then(Value::as_str)
                    .unwrap_or("Job failed")
                    .to_string();
                stages::mark_job_failed(ctx, a.job_id, &message)?;
                Ok(TaskOutput::Value(Value::Null))
            }
        }
    }
}
