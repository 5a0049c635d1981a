//! Axum JSON API over the persisted listing snapshots.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use larentals_core::{Listing, ListingReport, Segment, ALLOWED_REPORT_OPTIONS};
use larentals_storage::{SnapshotStore, SqliteSnapshotStore};
use larentals_sync::PipelineConfig;
use scraper::Html;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub mod filters;

pub use filters::{ListingFilter, ListingQuery};

pub const CRATE_NAME: &str = "larentals-web";

const MAX_REPORT_TEXT_CHARS: usize = 2000;

#[derive(Clone)]
pub struct AppState {
    pub store: SqliteSnapshotStore,
}

impl AppState {
    pub fn new(store: SqliteSnapshotStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListingPage {
    pub segment: Segment,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
    pub listings: Vec<Listing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub segment: Segment,
    pub total: usize,
    pub reported_inactive: usize,
    pub earliest_listed_date: Option<NaiveDate>,
    pub latest_processed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportRequest {
    pub option: String,
    #[serde(default)]
    pub text: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/{segment}/listings", get(listings_handler))
        .route("/api/{segment}/listings/{id}", get(listing_detail_handler))
        .route("/api/{segment}/listings/{id}/report", post(report_handler))
        .route("/api/{segment}/summary", get(summary_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = PipelineConfig::from_env();
    let store = SqliteSnapshotStore::connect(&config.database_path).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving listings api");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(segment): AxumPath<String>,
    Query(query): Query<ListingQuery>,
) -> Response {
    let segment = match parse_segment(&segment) {
        Ok(segment) => segment,
        Err(resp) => return resp,
    };
    match state.store.read_snapshot(segment).await {
        Ok(listings) => Json(filtered_page(segment, listings, &query)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((segment, id)): AxumPath<(String, String)>,
) -> Response {
    let segment = match parse_segment(&segment) {
        Ok(segment) => segment,
        Err(resp) => return resp,
    };
    match state.store.read_snapshot(segment).await {
        Ok(listings) => match listings.into_iter().find(|l| l.listing_id == id) {
            Some(listing) => Json(listing).into_response(),
            None => not_found("listing not found"),
        },
        Err(err) => server_error(err.into()),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>, AxumPath(segment): AxumPath<String>) -> Response {
    let segment = match parse_segment(&segment) {
        Ok(segment) => segment,
        Err(resp) => return resp,
    };
    match state.store.read_snapshot(segment).await {
        Ok(listings) => Json(SegmentSummary {
            segment,
            total: listings.len(),
            reported_inactive: listings.iter().filter(|l| l.reported_as_inactive).count(),
            earliest_listed_date: listings.iter().filter_map(|l| l.listed_date.date()).min(),
            latest_processed: listings.iter().filter_map(|l| l.date_processed).max(),
        })
        .into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((segment, id)): AxumPath<(String, String)>,
    Json(request): Json<ReportRequest>,
) -> Response {
    let segment = match parse_segment(&segment) {
        Ok(segment) => segment,
        Err(resp) => return resp,
    };
    if !ALLOWED_REPORT_OPTIONS.contains(&request.option.as_str()) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": format!("unknown report option `{}`", request.option),
                "allowed": ALLOWED_REPORT_OPTIONS,
            })),
        )
            .into_response();
    }

    let report = ListingReport {
        option: request.option,
        text: request.text.as_deref().and_then(strip_tags),
    };
    match state.store.mark_reported(segment, &id, &report).await {
        Ok(true) => {
            info!(%segment, listing_id = %id, option = %report.option, "listing reported");
            Json(serde_json::json!({
                "listing_id": id,
                "option": report.option,
                "reported_as_inactive": report.marks_inactive(),
            }))
            .into_response()
        }
        Ok(false) => not_found("listing not found"),
        Err(err) => server_error(err.into()),
    }
}

/// Plain text of user-submitted markup, trimmed and length-limited.
pub fn strip_tags(raw: &str) -> Option<String> {
    let fragment = Html::parse_fragment(raw);
    let text: String = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let text: String = text.chars().take(MAX_REPORT_TEXT_CHARS).collect();
    (!text.is_empty()).then_some(text)
}

fn filtered_page(segment: Segment, listings: Vec<Listing>, query: &ListingQuery) -> ListingPage {
    let filter = ListingFilter::from_query(query);
    let filtered = listings.into_iter().filter(|l| filter.matches(l)).collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(100).max(1);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    ListingPage {
        segment,
        total,
        page,
        total_pages,
        listings: filtered.into_iter().skip(start).take(per_page).collect(),
    }
}

fn parse_segment(raw: &str) -> Result<Segment, Response> {
    raw.parse::<Segment>().map_err(|err| not_found(&err.to_string()))
}

fn not_found(message: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("{err:#}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use larentals_core::ListedDate;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn seeded_app() -> (TempDir, Router, SqliteSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSnapshotStore::connect(dir.path().join("larentals.db")).await.unwrap();

        let mut cheap = Listing::new("L1", Segment::Lease);
        cheap.list_price = Some(1800.0);
        cheap.listed_date = ListedDate::parse("2024-03-01");
        let mut pricey = Listing::new("L2", Segment::Lease);
        pricey.list_price = Some(4200.0);
        pricey.listed_date = ListedDate::parse("2024-02-01");
        let unpriced = Listing::new("L3", Segment::Lease);
        store.write_snapshot(Segment::Lease, &[cheap, pricey, unpriced]).await.unwrap();

        (dir, app(AppState::new(store.clone())), store)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn get(uri: &str) -> axum::http::Request<Body> {
        axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> axum::http::Request<Body> {
        axum::http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn listings_endpoint_applies_filters() {
        let (_dir, app, _store) = seeded_app().await;

        let all = body_json(app.clone().oneshot(get("/api/lease/listings")).await.unwrap()).await;
        assert_eq!(all["total"], 3);

        let resp = app
            .oneshot(get("/api/lease/listings?max_price=3000&include_missing=true"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = body_json(resp).await;
        let ids: Vec<&str> = page["listings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["listing_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["L1", "L3"]);
    }

    #[tokio::test]
    async fn detail_and_unknown_segment() {
        let (_dir, app, _store) = seeded_app().await;

        let found = app.clone().oneshot(get("/api/lease/listings/L2")).await.unwrap();
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(body_json(found).await["list_price"], 4200.0);

        let missing = app.clone().oneshot(get("/api/lease/listings/NOPE")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let bad_segment = app.oneshot(get("/api/rent/listings")).await.unwrap();
        assert_eq!(bad_segment.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn summary_reports_counts_and_dates() {
        let (_dir, app, _store) = seeded_app().await;
        let summary = body_json(app.oneshot(get("/api/lease/summary")).await.unwrap()).await;
        assert_eq!(summary["total"], 3);
        assert_eq!(summary["reported_inactive"], 0);
        assert_eq!(summary["earliest_listed_date"], "2024-02-01");
    }

    #[tokio::test]
    async fn inactive_report_sets_the_sticky_flag() {
        let (_dir, app, store) = seeded_app().await;

        let resp = app
            .oneshot(post_json(
                "/api/lease/listings/L1/report",
                serde_json::json!({"option": "Unavailable/Sold/Rented"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let rows = store.read_snapshot(Segment::Lease).await.unwrap();
        assert!(rows.iter().find(|l| l.listing_id == "L1").unwrap().reported_as_inactive);
    }

    #[tokio::test]
    async fn other_reports_store_stripped_text() {
        let (_dir, app, store) = seeded_app().await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/lease/listings/L2/report",
                serde_json::json!({"option": "Wrong Location", "text": "<b>pin</b> is <script>x</script>off"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let rows = store.read_snapshot(Segment::Lease).await.unwrap();
        let l2 = rows.iter().find(|l| l.listing_id == "L2").unwrap();
        assert!(!l2.reported_as_inactive);
        let report = l2.report.as_ref().unwrap();
        assert_eq!(report.option, "Wrong Location");
        assert!(!report.text.as_deref().unwrap().contains('<'));

        let rejected = app
            .oneshot(post_json(
                "/api/lease/listings/L2/report",
                serde_json::json!({"option": "Haunted"}),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn tags_are_stripped_from_report_text() {
        assert_eq!(strip_tags("<p>Sold <em>last week</em></p>").as_deref(), Some("Sold last week"));
        assert_eq!(strip_tags("   "), None);
    }
}
