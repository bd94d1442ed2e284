use crate::analysis::{AnalysisError, Chart};
use crate::db::ExecutorError;
use crate::pipeline::{AnswerBundle, ExplanationFailure, Pipeline, PipelineError, PipelineFailure};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub question: String,
}

#[derive(Debug, Serialize)]
pub struct DataFrame {
    pub columns: Vec<String>,
    pub data: Vec<Map<String, Value>>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub sql: Option<String>,
    pub dataframe: Option<DataFrame>,
    pub explanation: Option<String>,
    pub explanation_error: Option<ExplanationFailure>,
    /// Base64-encoded chart, analysis requests only.
    pub image: Option<String>,
    pub image_format: Option<&'static str>,
}

impl From<AnswerBundle> for QueryResponse {
    fn from(bundle: AnswerBundle) -> Self {
        let dataframe = bundle.result.map(|table| DataFrame {
            columns: table.column_names(),
            data: table.to_records(),
        });
        let image = bundle.chart.as_ref().map(Chart::to_base64);
        QueryResponse {
            sql: bundle.sql.map(|s| s.into_inner()),
            dataframe,
            explanation: bundle.explanation,
            explanation_error: bundle.explanation_error,
            image_format: image.as_ref().map(|_| Chart::FORMAT),
            image,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: &'static str,
    pub stage: Option<&'static str>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn invalid_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorBody {
                error: message,
                kind: "invalid_request",
                stage: None,
            },
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err.failure {
            PipelineFailure::EmptyQuestion => StatusCode::BAD_REQUEST,
            PipelineFailure::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineFailure::Execution(ExecutorError::Refused(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineFailure::Model(_) => StatusCode::BAD_GATEWAY,
            PipelineFailure::Execution(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineFailure::Analysis(AnalysisError::MissingPartner) => StatusCode::BAD_REQUEST,
            PipelineFailure::Analysis(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: ErrorBody {
                error: err.failure.to_string(),
                kind: err.kind(),
                stage: Some(err.stage),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/query", post(query))
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// POST /api/query
async fn query(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::invalid_request(e.body_text()))?;
    match state.pipeline.answer(&request.question).await {
        Ok(bundle) => Ok(Json(bundle.into())),
        Err(err) => {
            warn!(kind = err.kind(), stage = err.stage, error = %err.failure, "query failed");
            Err(err.into())
        }
    }
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<Value> {
    let database = if state.pipeline.executor().ping().await {
        "connected"
    } else {
        "unavailable"
    };
    Json(serde_json::json!({ "status": "ok", "database": database }))
}
