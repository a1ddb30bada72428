//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::{HeaderValue, StatusCode, header},
  response::{IntoResponse, Response},
};
use serde_json::json;
use strata_core::query::QueryError;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("unauthorized")]
  Unauthorized,

  /// Field-level problems with a query; nothing was run.
  #[error("invalid query ({} error(s))", .0.len())]
  Query(Vec<QueryError>),

  #[error("import error: {0}")]
  Import(#[from] strata_importer::Error),

  #[error("export error: {0}")]
  Export(#[from] strata_csv::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self { Self::Store(Box::new(e)) }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
      ApiError::Unauthorized => {
        let mut res = (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response();
        res.headers_mut().insert(
          header::WWW_AUTHENTICATE,
          HeaderValue::from_static("Basic realm=\"strata\""),
        );
        return res;
      }
      ApiError::Query(errors) => (StatusCode::BAD_REQUEST, json!({ "errors": errors })),
      ApiError::Import(strata_importer::Error::Validation(errors)) => {
        let errors: Vec<QueryError> = errors
          .iter()
          .map(|e| {
            let field = match (e.row, &e.column) {
              (Some(row), _) => format!("row {row}"),
              (None, Some(column)) => column.clone(),
              (None, None) => "file".to_owned(),
            };
            QueryError::new(field, e.to_string())
          })
          .collect();
        (StatusCode::BAD_REQUEST, json!({ "errors": errors }))
      }
      ApiError::Import(strata_importer::Error::ImportNotFound(id)) => {
        (StatusCode::NOT_FOUND, json!({ "error": format!("import {id} not found") }))
      }
      ApiError::Import(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() })),
      ApiError::Export(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() })),
      ApiError::Store(e) => (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() })),
    };
    (status, Json(body)).into_response()
  }
}
