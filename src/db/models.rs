use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use time::PrimitiveDateTime;

use crate::db::types::TaskStatus;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Essay {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub language: Option<String>,
    pub submitted_at: PrimitiveDateTime,
    pub created_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CorrectionTask {
    pub id: String,
    pub essay_id: String,
    pub status: TaskStatus,
    pub attempt_count: i32,
    pub last_attempt_at: Option<PrimitiveDateTime>,
    pub next_retry_at: Option<PrimitiveDateTime>,
    pub error_detail: Option<String>,
    pub created_at: PrimitiveDateTime,
    pub updated_at: PrimitiveDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CorrectionResult {
    pub id: String,
    pub task_id: String,
    pub total_score: f64,
    pub max_score: f64,
    pub analysis: Json<serde_json::Value>,
    pub feedback: Option<String>,
    pub model: Option<String>,
    pub produced_at: PrimitiveDateTime,
}
