use std::sync::Arc;

use rocket::State;
use rocket::serde::json::Json;

use crate::AppContext;
use crate::api::guards::GuardAuth;
use crate::api::{AppResult, GuardResult};
use crate::workflow::engine::ExecutionSummary;

/// Operator visibility into the pipeline: every workflow execution and its
/// state. A photo that was accepted but never catalogued shows up here as
/// a non-completed execution.
#[get("/api/system/executions")]
pub async fn list_executions(
    auth: GuardResult<GuardAuth>,
    context: &State<Arc<AppContext>>,
) -> AppResult<Json<Vec<ExecutionSummary>>> {
    let _ = auth?;
    let summaries = context.engine.list_executions().await?;
    Ok(Json(summaries))
}
