use crate::ai::prompt::{
    build_explanation_prompt, build_generation_prompt, build_generation_prompt_with_feedback,
};
use crate::ai::sanitize::{validate_sql, SqlRejection, ValidatedSql};
use crate::ai::{LanguageModel, ModelError, SchemaContext};
use crate::analysis::{analysis_target, analyze_partner, render_analysis_chart, AnalysisError, AnalysisStage, Chart};
use crate::db::{ExecutorError, QueryExecutor, ResultTable};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    PromptBuilt,
    SqlGenerated,
    SqlValidated,
    QueryExecuted,
    ExplanationPromptBuilt,
    Explained,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::PromptBuilt => "prompt_built",
            Stage::SqlGenerated => "sql_generated",
            Stage::SqlValidated => "sql_validated",
            Stage::QueryExecuted => "query_executed",
            Stage::ExplanationPromptBuilt => "explanation_prompt_built",
            Stage::Explained => "explained",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineFailure {
    #[error("question is empty")]
    EmptyQuestion,
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Rejected(#[from] SqlRejection),
    #[error(transparent)]
    Execution(#[from] ExecutorError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl PipelineFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineFailure::EmptyQuestion => "empty_question",
            PipelineFailure::Model(e) => e.kind(),
            PipelineFailure::Rejected(r) => r.kind(),
            PipelineFailure::Execution(e) => e.kind(),
            PipelineFailure::Analysis(_) => "analysis_failure",
        }
    }
}

/// Terminal failure, tagged with the last state the run reached.
#[derive(Debug, Error)]
#[error("{failure} (after {stage})")]
pub struct PipelineError {
    pub stage: &'static str,
    pub failure: PipelineFailure,
}

impl PipelineError {
    fn at(stage: Stage, failure: impl Into<PipelineFailure>) -> Self {
        Self {
            stage: stage.as_str(),
            failure: failure.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.failure.kind()
    }
}

impl From<AnalysisError> for PipelineError {
    fn from(e: AnalysisError) -> Self {
        Self {
            stage: e.stage().as_str(),
            failure: PipelineFailure::Analysis(e),
        }
    }
}

/// Why a run returned its result without an explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExplanationFailure {
    pub kind: &'static str,
    /// Kind of the underlying model error.
    pub cause: &'static str,
    pub error: String,
}

impl From<&ModelError> for ExplanationFailure {
    fn from(e: &ModelError) -> Self {
        Self {
            kind: "explanation_failure",
            cause: e.kind(),
            error: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerBundle {
    pub request_id: Uuid,
    pub sql: Option<ValidatedSql>,
    pub result: Option<ResultTable>,
    pub explanation: Option<String>,
    /// Set when the result stands but the explanation call failed.
    pub explanation_error: Option<ExplanationFailure>,
    #[serde(skip)]
    pub chart: Option<Chart>,
    pub generation_attempts: usize,
}

impl AnswerBundle {
    fn empty(request_id: Uuid) -> Self {
        Self {
            request_id,
            sql: None,
            result: None,
            explanation: None,
            explanation_error: None,
            chart: None,
            generation_attempts: 0,
        }
    }
}

pub struct Pipeline {
    model: Arc<dyn LanguageModel>,
    executor: Arc<dyn QueryExecutor>,
    schema: Arc<SchemaContext>,
    generation_attempts: usize,
}

impl Pipeline {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        executor: Arc<dyn QueryExecutor>,
        schema: Arc<SchemaContext>,
    ) -> Self {
        Self {
            model,
            executor,
            schema,
            generation_attempts: 1,
        }
    }

    /// Allow up to `attempts` generations when the validator rejects the SQL.
    pub fn with_generation_attempts(mut self, attempts: usize) -> Self {
        self.generation_attempts = attempts.max(1);
        self
    }

    pub fn executor(&self) -> &Arc<dyn QueryExecutor> {
        &self.executor
    }

    pub async fn answer(&self, question: &str) -> Result<AnswerBundle, PipelineError> {
        let request_id = Uuid::new_v4();
        let span = info_span!("pipeline", %request_id);
        async move {
            let question = question.trim();
            if question.is_empty() {
                return Err(PipelineError::at(Stage::Start, PipelineFailure::EmptyQuestion));
            }
            info!(question, "answering question");

            let bundle = match analysis_target(question) {
                Some(partner) => self.run_analysis(request_id, partner).await?,
                None => self.run_question(request_id, question).await?,
            };
            info!("request complete");
            Ok(bundle)
        }
        .instrument(span)
        .await
    }

    async fn run_question(&self, request_id: Uuid, question: &str) -> Result<AnswerBundle, PipelineError> {
        let (sql, attempts) = self.generate_sql(question).await?;

        // validate_sql is idempotent; this guards the value on its way to the store
        let sql = validate_sql(sql.as_str()).map_err(|r| PipelineError::at(Stage::SqlValidated, r))?;
        let result = self
            .executor
            .execute(&sql)
            .await
            .map_err(|e| PipelineError::at(Stage::SqlValidated, e))?;
        debug!(
            stage = %Stage::QueryExecuted,
            rows = result.row_count,
            truncated = result.truncated,
            elapsed_ms = result.execution_time_ms as u64,
        );

        let prompt = build_explanation_prompt(question, sql.as_str(), &result, &self.schema);
        debug!(stage = %Stage::ExplanationPromptBuilt, chars = prompt.len());

        let mut bundle = AnswerBundle::empty(request_id);
        bundle.generation_attempts = attempts;
        match self.model.generate(&prompt).await {
            Ok(text) => {
                debug!(stage = %Stage::Explained);
                bundle.explanation = Some(text.trim().to_string());
            }
            Err(e) => {
                warn!(error = %e, "explanation failed; returning result without it");
                bundle.explanation_error = Some(ExplanationFailure::from(&e));
            }
        }
        bundle.sql = Some(sql);
        bundle.result = Some(result);
        debug!(stage = %Stage::Done);
        Ok(bundle)
    }

    async fn generate_sql(&self, question: &str) -> Result<(ValidatedSql, usize), PipelineError> {
        let mut prompt = build_generation_prompt(question, &self.schema);
        let mut attempt = 1;
        loop {
            debug!(stage = %Stage::PromptBuilt, attempt, chars = prompt.len());
            let raw = self
                .model
                .generate(&prompt)
                .await
                .map_err(|e| PipelineError::at(Stage::PromptBuilt, e))?;
            debug!(stage = %Stage::SqlGenerated, attempt);

            match validate_sql(&raw) {
                Ok(sql) => {
                    debug!(stage = %Stage::SqlValidated, sql = sql.as_str());
                    return Ok((sql, attempt));
                }
                Err(rejection) if attempt < self.generation_attempts => {
                    warn!(attempt, reason = %rejection, "generated SQL rejected; retrying with feedback");
                    prompt = build_generation_prompt_with_feedback(
                        question,
                        &self.schema,
                        raw.trim(),
                        &rejection.to_string(),
                    );
                    attempt += 1;
                }
                Err(rejection) => {
                    warn!(attempt, reason = %rejection, "generated SQL rejected");
                    return Err(PipelineError::at(Stage::SqlGenerated, rejection));
                }
            }
        }
    }

    async fn run_analysis(&self, request_id: Uuid, partner: &str) -> Result<AnswerBundle, PipelineError> {
        let analysis = analyze_partner(self.executor.as_ref(), partner).await?;
        let chart = render_analysis_chart(&analysis);
        debug!(stage = %AnalysisStage::Rendered, bytes = chart.svg.len());

        let mut bundle = AnswerBundle::empty(request_id);
        bundle.explanation = Some(format!("Transaction analysis completed for {partner}"));
        bundle.chart = Some(chart);
        Ok(bundle)
    }
}
