//! Handlers for the public query endpoints and footnotes.
//!
//! Every query is validated against the subject's meta before it reaches the
//! store; a query with any field-level error is rejected whole with `400`.

use axum::{
  Json,
  extract::{Path, Query, State},
  http::{HeaderMap, StatusCode, header},
  response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use strata_core::{
  blob::BlobStore,
  dimension::SubjectMeta,
  footnote::{Footnote, FootnoteScope, FootnoteTarget, NewFootnote},
  observation::ObservationRow,
  query::{DataSetQuery, ObservationQuery, Paging, QueryError, TableBuilderQuery},
  queue::MessageQueue,
  store::StatStore,
};
use tracing::debug;
use uuid::Uuid;

use crate::{AppState, QueryConfig, auth::Admin, error::ApiError, export};

// ─── Shared ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
  pub page:      Option<u32>,
  pub page_size: Option<u32>,
}

/// One page of results with the footnotes that apply to it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
  pub paging:    Paging,
  pub results:   Vec<ObservationRow>,
  pub footnotes: Vec<Footnote>,
}

pub(crate) async fn load_meta<S: StatStore>(store: &S, id: Uuid) -> Result<SubjectMeta, ApiError> {
  store
    .subject_meta(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("data set {id} not found")))
}

/// The dimensions a page of results touches, for footnote matching.
pub fn footnote_target(meta: &SubjectMeta, query: &ObservationQuery) -> FootnoteTarget {
  let filter_items = query.facets.filter_items();
  let (mut filters, mut filter_groups): (Vec<Uuid>, Vec<Uuid>) = filter_items
    .iter()
    .filter_map(|id| meta.filter_item(*id))
    .map(|(filter, item)| (filter.filter.filter_id, item.filter_group_id))
    .unzip();
  filters.sort();
  filters.dedup();
  filter_groups.sort();
  filter_groups.dedup();

  FootnoteTarget {
    subject_id: meta.subject.subject_id,
    filters,
    filter_groups,
    filter_items,
    indicators: query.indicators.clone(),
  }
}

/// Every dimension of the subject, so any footnote attached to it matches.
fn whole_subject(meta: &SubjectMeta) -> FootnoteTarget {
  FootnoteTarget {
    subject_id:    meta.subject.subject_id,
    filters:       meta.filters.iter().map(|f| f.filter.filter_id).collect(),
    filter_groups: meta
      .filters
      .iter()
      .flat_map(|f| f.groups.iter().map(|g| g.group.filter_group_id))
      .collect(),
    filter_items:  meta
      .filters
      .iter()
      .flat_map(|f| f.items().map(|i| i.filter_item_id))
      .collect(),
    indicators:    meta.indicators.iter().map(|i| i.indicator_id).collect(),
  }
}

async fn run_page<S: StatStore>(
  store: &S,
  meta: &SubjectMeta,
  query: DataSetQuery,
  params: PageParams,
  config: &QueryConfig,
) -> Result<QueryResponse, ApiError> {
  let page = params.page.unwrap_or(1);
  let page_size = params
    .page_size
    .unwrap_or(config.default_page_size.min(config.max_page_size));
  let compiled = query
    .compile(meta, page, page_size, config.max_page_size)
    .map_err(ApiError::Query)?;

  let result = store.query_observations(&compiled).await.map_err(ApiError::store)?;
  let footnotes = store
    .footnotes_for(&footnote_target(meta, &compiled))
    .await
    .map_err(ApiError::store)?;
  debug!(
    subject_id = %meta.subject.subject_id,
    page,
    rows = result.rows.len(),
    total = result.total_results,
    "query served"
  );

  Ok(QueryResponse {
    paging: Paging::new(page, page_size, result.total_results),
    results: result.rows,
    footnotes,
  })
}

fn wants_csv(headers: &HeaderMap) -> bool {
  headers
    .get(header::ACCEPT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.contains("text/csv"))
}

// ─── Table builder ────────────────────────────────────────────────────────────

/// `POST /table-builder`
pub async fn table_builder<S, Q, B>(
  State(state): State<AppState<S, Q, B>>,
  Query(params): Query<PageParams>,
  headers: HeaderMap,
  Json(body): Json<TableBuilderQuery>,
) -> Result<Response, ApiError>
where
  S: StatStore + 'static,
  Q: MessageQueue,
  B: BlobStore,
{
  let meta = load_meta(state.store.as_ref(), body.subject_id).await?;
  let query = body.into_data_set_query(&meta);

  if wants_csv(&headers) {
    let max = state.query.max_page_size;
    let compiled = query.compile(&meta, 1, max, max).map_err(ApiError::Query)?;
    return export::stream_csv(state.store.clone(), meta, compiled, &state.query);
  }

  let response = run_page(state.store.as_ref(), &meta, query, params, &state.query).await?;
  Ok(Json(response).into_response())
}

// ─── Faceted data-set query ───────────────────────────────────────────────────

/// `POST /data-sets/{id}/query[?page=&pageSize=]`
pub async fn data_set_query<S, Q, B>(
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
  Query(params): Query<PageParams>,
  Json(body): Json<DataSetQuery>,
) -> Result<Json<QueryResponse>, ApiError>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  let meta = load_meta(state.store.as_ref(), id).await?;
  let response = run_page(state.store.as_ref(), &meta, body, params, &state.query).await?;
  Ok(Json(response))
}

// ─── Meta ─────────────────────────────────────────────────────────────────────

/// `GET /data-sets/{id}/meta`
pub async fn meta<S, Q, B>(
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
) -> Result<Json<SubjectMeta>, ApiError>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  Ok(Json(load_meta(state.store.as_ref(), id).await?))
}

// ─── Footnotes ────────────────────────────────────────────────────────────────

/// `GET /data-sets/{id}/footnotes`
pub async fn list_footnotes<S, Q, B>(
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
) -> Result<Json<Vec<Footnote>>, ApiError>
where
  S: StatStore,
  Q: MessageQueue,
  B: BlobStore,
{
  let meta = load_meta(state.store.as_ref(), id).await?;
  let footnotes = state
    .store
    .footnotes_for(&whole_subject(&meta))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(footnotes))
}

/// `POST /data-sets/{id}/footnotes`: body `{"content": "...", "scopes": [...]}`.
///
/// Every scope must name the data set itself or one of its dimensions.
pub async fn add_footnote<S, Q, B>(
  _admin: Admin,
  State(state): State<AppState<S, Q, B>>,
  Path(id): Path<Uuid>,
  Json(body): Json<NewFootnote>,
) -> Result<impl IntoResponse, ApiError>
where
  S: StatStore + 'static,
  Q: MessageQueue + 'static,
  B: BlobStore + 'static,
{
  let meta = load_meta(state.store.as_ref(), id).await?;
  let subject = whole_subject(&meta);

  let mut errors = Vec::new();
  if body.content.trim().is_empty() {
    errors.push(QueryError::new("content", "must not be empty"));
  }
  if body.scopes.is_empty() {
    errors.push(QueryError::new("scopes", "must not be empty"));
  }
  for (i, scope) in body.scopes.iter().enumerate() {
    if !subject.matches(scope) {
      errors.push(QueryError::new(format!("scopes[{i}]"), scope_error(scope)));
    }
  }
  if !errors.is_empty() {
    return Err(ApiError::Query(errors));
  }

  let footnote = state.store.add_footnote(body).await.map_err(ApiError::store)?;
  Ok((StatusCode::CREATED, Json(footnote)))
}

fn scope_error(scope: &FootnoteScope) -> String {
  match scope {
    FootnoteScope::Subject(id) => format!("scope names another data set {id}"),
    FootnoteScope::Filter(id) => format!("unknown filter {id}"),
    FootnoteScope::FilterGroup(id) => format!("unknown filter group {id}"),
    FootnoteScope::FilterItem(id) => format!("unknown filter item {id}"),
    FootnoteScope::Indicator(id) => format!("unknown indicator {id}"),
  }
}
