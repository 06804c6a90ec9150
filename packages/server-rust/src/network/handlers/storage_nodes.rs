//! Storage node listing, lookup and poll handlers.
//!
//! Every request loads the installed snapshot pair once and answers from it,
//! so a refresh landing mid-request never mixes generations in one response.

use std::collections::HashMap;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::header::LINK;
use http::{HeaderValue, Method, Uri};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use storinfo_core::query::{PARAM_AFTER_ID, PARAM_LIMIT};
use storinfo_core::Tier;
use tracing::warn;

use super::AppState;
use crate::network::error::ApiError;

/// Everything but RFC 3986 unreserved characters.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

type RawParams = Result<Query<HashMap<String, String>>, QueryRejection>;

/// `GET /poll`: the whole eligible snapshot.
pub async fn poll_handler(State(state): State<AppState>) -> Response {
    let view = state.cache.current_snapshots();
    Json(view.pair().eligible.records()).into_response()
}

/// `GET /storagenodes`: paginated eligible listing.
///
/// # Errors
///
/// Returns 400 for malformed parameters and 404 for an exhausted cursor or
/// an unknown `only_id`.
pub async fn list_eligible_handler(
    State(state): State<AppState>,
    uri: Uri,
    params: RawParams,
) -> Result<Response, ApiError> {
    list_tier(&state, Tier::Eligible, &uri, params)
}

/// `GET /operator/storagenodes`: paginated operator listing.
///
/// # Errors
///
/// Same as [`list_eligible_handler`].
pub async fn list_operator_handler(
    State(state): State<AppState>,
    uri: Uri,
    params: RawParams,
) -> Result<Response, ApiError> {
    list_tier(&state, Tier::Operator, &uri, params)
}

/// `GET /storagenodes/{id}`: one eligible node.
///
/// # Errors
///
/// Returns 404 if the node is unknown or above the eligible ceiling.
pub async fn get_eligible_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    get_node(&state, Tier::Eligible, &id)
}

/// `GET /operator/storagenodes/{id}`: one operator node.
///
/// # Errors
///
/// Returns 404 if the node is unknown.
pub async fn get_operator_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    get_node(&state, Tier::Operator, &id)
}

/// JSON 404 for unmatched routes.
pub async fn not_found_handler(method: Method, uri: Uri) -> ApiError {
    ApiError::RouteNotFound {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}

fn list_tier(
    state: &AppState,
    tier: Tier,
    uri: &Uri,
    params: RawParams,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadQueryString(e.body_text()))?;

    let view = state.cache.current_snapshots();
    let service = view.query_service();
    let request = service.parse(&params)?;

    let pair = view.pair();
    let page = service.execute(pair.tier(tier), fallback(pair, tier), &request)?;

    let mut response = Json(page.records).into_response();
    if let Some(after_id) = page.next {
        match next_link(uri.path(), page.limit, after_id) {
            Some(link) => {
                response.headers_mut().insert(LINK, link);
            }
            None => warn!(after_id, "could not encode continuation link"),
        }
    }
    Ok(response)
}

fn get_node(state: &AppState, tier: Tier, id: &str) -> Result<Response, ApiError> {
    let view = state.cache.current_snapshots();
    let pair = view.pair();
    let record = view
        .query_service()
        .lookup(pair.tier(tier), fallback(pair, tier), id)?;
    Ok(Json(record).into_response())
}

/// Eligible lookups consult the operator tier to tell "filtered out" apart
/// from "unknown".
fn fallback(pair: &storinfo_core::SnapshotPair, tier: Tier) -> Option<&storinfo_core::Snapshot> {
    match tier {
        Tier::Eligible => Some(&pair.operator),
        Tier::Operator => None,
    }
}

/// Builds `<path?limit=N&after_id=ID>; rel="next"`.
fn next_link(path: &str, limit: usize, after_id: &str) -> Option<HeaderValue> {
    let after_id = utf8_percent_encode(after_id, QUERY_VALUE);
    HeaderValue::from_str(&format!(
        "<{path}?{PARAM_LIMIT}={limit}&{PARAM_AFTER_ID}={after_id}>; rel=\"next\""
    ))
    .ok()
}
