//! Handlers for `/imports` endpoints.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/imports` | admin; `202` with the initial progress |
//! | `GET`  | `/imports/{id}/status` | 404 if not found |
//! | `POST` | `/imports/{id}/cancel` | admin |
//! | `POST` | `/imports/recover` | admin; runs one recovery pass |

use axum::{
  Json,
  extract::{Path, State},
  http::StatusCode,
  response::IntoResponse,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use strata_core::{blob::BlobStore, queue::MessageQueue, store::StatStore};
use strata_importer::{ImportProgress, RecoveryReport, SubmitRequest};
use tracing::info;
use uuid::Uuid;

use crate::{AppState, auth::Admin, error::ApiError};

// ─── Submit ───────────────────────────────────────────────────────────────────

/// Body of `POST /imports`. File contents travel inline as text.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
  pub release_id:     Uuid,
  pub subject_name:   String,
  pub data_file_name: String,
  pub meta_file_name: String,
  pub data:           String,
  pub meta:           String,
}

impl From<SubmitBody> for SubmitRequest {
  fn from(body: SubmitBody) -> Self {
    Self {
      release_id:     body.release_id,
      subject_name:   body.subject_name,
      data_file_name: body.data_file_name,
      meta_file_name: body.meta_file_name,
      data:           Bytes::from(body.data),
      meta:           Bytes::from(body.meta),
    }
  }
}

/// `POST /imports`
pub async fn submit<S, Q, B>(
  _admin: Admin,
  State(state): State<AppState<S, Q, B>>,
  Json(body): Json<SubmitBody>,
) -> Result<impl IntoResponse, ApiError>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  if body.subject_name.trim().is_empty() {
    return Err(ApiError::BadRequest("subjectName must not be empty".into()));
  }
  let record = state.pipeline.coordinator.submit(body.into()).await?;
  Ok((StatusCode::ACCEPTED, Json(ImportProgress::from(&record))))
}

// ─── Status ───────────────────────────────────────────────────────────────────

/// `GET /imports/{id}/status`
pub async fn status<S, Q, B>(
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
) -> Result<Json<ImportProgress>, ApiError>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  Ok(Json(state.pipeline.coordinator.status(id).await?))
}

// ─── Cancel ───────────────────────────────────────────────────────────────────

/// `POST /imports/{id}/cancel`: `{"cancelled": false}` when the import had
/// already finished.
pub async fn cancel<S, Q, B>(
  _admin: Admin,
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  let cancelled = state.pipeline.coordinator.cancel(id).await?;
  Ok(Json(json!({ "cancelled": cancelled })))
}

// ─── Recover ──────────────────────────────────────────────────────────────────

/// `POST /imports/recover`
pub async fn recover<S, Q, B>(
  _admin: Admin,
  State(state): State<AppState<S, Q, B>>,
) -> Result<Json<RecoveryReport>, ApiError>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  info!("recovery requested over the API");
  Ok(Json(state.pipeline.recovery.run().await?))
}
