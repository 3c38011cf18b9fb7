use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::config::Settings;

const SCORING_SYSTEM_PROMPT: &str = r#"You are an experienced essay examiner.
Your task is to assess the student's essay against the provided rubric and assign scores.

IMPORTANT: if the submitted text is empty, meaningless, or clearly not an essay,
you MUST return "unprocessable": true together with a short reason.

Assessment criteria:
1. Relevance to the assigned topic
2. Structure and coherence of the argument
3. Grammar, spelling and punctuation
4. Vocabulary range and register
5. Use of evidence and examples

Response format (strict JSON):
{
  "unprocessable": false,
  "unprocessable_reason": null,
  "total_score": <number>,
  "max_score": <number>,
  "criteria_scores": [
    {
      "criterion_name": "criterion title",
      "score": <number>,
      "max_score": <number>,
      "comment": "short justification"
    }
  ],
  "feedback": "overall feedback for the student with concrete recommendations"
}
"#;

#[derive(Debug, Clone)]
pub struct ScoreRequest {
    pub essay_id: String,
    pub content: String,
    pub language: Option<String>,
    pub rubric: Value,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct ScoreReport {
    pub total_score: f64,
    pub max_score: f64,
    pub analysis: Value,
    pub feedback: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("scoring request timed out")]
    Timeout,
    #[error("network failure calling scoring backend: {0}")]
    Network(String),
    #[error("scoring backend rate limited the request")]
    RateLimited,
    #[error("scoring backend error (status {status}): {detail}")]
    Api { status: u16, detail: String },
    #[error("essay rejected as unprocessable: {0}")]
    Unprocessable(String),
    #[error("malformed scoring response: {0}")]
    MalformedResponse(String),
}

impl ScoringError {
    /// Transient errors go through the retry path; everything else is a
    /// permanent failure and terminates the task immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::Unprocessable(_) | Self::MalformedResponse(_) => false,
        }
    }
}

/// Stateless adapter around the external AI scorer. One call, one attempt;
/// retry and backoff belong to the worker pipeline, not the client.
#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreReport, ScoringError>;
}

pub struct OpenAiScoringClient {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiScoringClient {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(settings.ai().ai_request_timeout);
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|err| anyhow::anyhow!(err).context("Failed to build HTTP client"))?;

        Ok(Self {
            client,
            api_key: settings.ai().openai_api_key.clone(),
            base_url: settings.ai().openai_base_url.trim_end_matches('/').to_string(),
            model: settings.ai().ai_model.clone(),
            max_tokens: settings.ai().ai_max_tokens,
        })
    }
}

#[async_trait]
impl ScoringClient for OpenAiScoringClient {
    async fn score(&self, request: ScoreRequest) -> Result<ScoreReport, ScoringError> {
        let timer = Instant::now();
        let essay_id = request.essay_id.clone();

        let language = request.language.as_deref().unwrap_or("unspecified");
        let user_prompt = format!(
            "Language: {}\n\nRubric (maximum {} points):\n{}\n\nEssay to assess:\n{}\n\nAssess the essay and respond with the JSON format described in the system prompt.",
            language,
            request.max_score,
            serde_json::to_string_pretty(&request.rubric).unwrap_or_default(),
            request.content
        );

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SCORING_SYSTEM_PROMPT},
                {"role": "user", "content": user_prompt}
            ],
            "max_completion_tokens": self.max_tokens,
            "response_format": {"type": "json_object"}
        });

        tracing::info!(essay_id = %essay_id, "Sending AI scoring request");

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                ScoringError::MalformedResponse("missing response content".to_string())
            })?;

        let payload: Value = serde_json::from_str(content)
            .map_err(|err| ScoringError::MalformedResponse(err.to_string()))?;

        let report = parse_score_payload(payload, request.max_score, &self.model)?;

        tracing::info!(
            essay_id = %essay_id,
            duration_seconds = timer.elapsed().as_secs_f64(),
            total_score = report.total_score,
            "AI scoring completed"
        );

        Ok(report)
    }
}

fn classify_request_error(err: reqwest::Error) -> ScoringError {
    if err.is_timeout() {
        ScoringError::Timeout
    } else {
        ScoringError::Network(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &Value) -> ScoringError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return ScoringError::RateLimited;
    }
    ScoringError::Api { status: status.as_u16(), detail: body.to_string() }
}

/// Turn the model's JSON payload into a report, honoring the unprocessable
/// escape hatch.
fn parse_score_payload(
    mut payload: Value,
    default_max_score: f64,
    model: &str,
) -> Result<ScoreReport, ScoringError> {
    let unreadable =
        payload.get("unprocessable").and_then(|value| value.as_bool()).unwrap_or(false);
    if unreadable {
        let reason = payload
            .get("unprocessable_reason")
            .and_then(|value| value.as_str())
            .unwrap_or("content rejected by the scoring model")
            .to_string();
        return Err(ScoringError::Unprocessable(reason));
    }

    let total_score = payload
        .get("total_score")
        .and_then(|value| value.as_f64())
        .ok_or_else(|| ScoringError::MalformedResponse("missing total_score".to_string()))?;

    let max_score =
        payload.get("max_score").and_then(|value| value.as_f64()).unwrap_or(default_max_score);

    let feedback =
        payload.get("feedback").and_then(|value| value.as_str()).map(|value| value.to_string());

    if let Some(map) = payload.as_object_mut() {
        map.remove("unprocessable");
        map.remove("unprocessable_reason");
    }

    Ok(ScoreReport {
        total_score,
        max_score,
        analysis: payload,
        feedback,
        model: Some(model.to_string()),
    })
}
