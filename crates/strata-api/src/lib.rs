//! JSON API for strata.
//!
//! Exposes an axum [`Router`] over any [`StatStore`] plus the import
//! [`Pipeline`] that writes it. Query endpoints are public; import
//! administration and footnote authoring require HTTP Basic credentials.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `POST` | `/table-builder` | JSON, or CSV with `Accept: text/csv` |
//! | `POST` | `/data-sets/{id}/query` | `?page=&pageSize=` |
//! | `GET`  | `/data-sets/{id}/meta` | |
//! | `GET`  | `/data-sets/{id}/footnotes` | `POST` to add one (admin) |
//! | `POST` | `/imports` | admin |
//! | `GET`  | `/imports/{id}/status` | |
//! | `POST` | `/imports/{id}/cancel` | admin |
//! | `POST` | `/imports/recover` | admin |

pub mod auth;
pub mod config;
pub mod error;
pub mod export;
pub mod imports;
pub mod query;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use strata_core::{blob::BlobStore, queue::MessageQueue, store::StatStore};
use strata_importer::Pipeline;
use tower_http::trace::TraceLayer;

pub use auth::{Admin, AuthConfig};
pub use config::QueryConfig;
pub use error::ApiError;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all handlers.
pub struct AppState<S, Q, B> {
  pub store:    Arc<S>,
  pub pipeline: Arc<Pipeline<S, Q, B>>,
  pub auth:     Arc<AuthConfig>,
  pub query:    QueryConfig,
}

// Derived `Clone` would demand `S: Clone`, `Q: Clone` and `B: Clone`.
impl<S, Q, B> Clone for AppState<S, Q, B> {
  fn clone(&self) -> Self {
    Self {
      store:    self.store.clone(),
      pipeline: self.pipeline.clone(),
      auth:     self.auth.clone(),
      query:    self.query.clone(),
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build the API router. The returned `Router<()>` can be nested into any
/// parent router regardless of its own state type.
pub fn api_router<S, Q, B>(state: AppState<S, Q, B>) -> Router<()>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  Router::new()
    // Queries
    .route("/table-builder", post(query::table_builder::<S, Q, B>))
    .route("/data-sets/{id}/query", post(query::data_set_query::<S, Q, B>))
    .route("/data-sets/{id}/meta", get(query::meta::<S, Q, B>))
    .route(
      "/data-sets/{id}/footnotes",
      get(query::list_footnotes::<S, Q, B>).post(query::add_footnote::<S, Q, B>),
    )
    // Imports
    .route("/imports", post(imports::submit::<S, Q, B>))
    .route("/imports/recover", post(imports::recover::<S, Q, B>))
    .route("/imports/{id}/status", get(imports::status::<S, Q, B>))
    .route("/imports/{id}/cancel", post(imports::cancel::<S, Q, B>))
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}
