//! HTTP surface: `/scene_data`, `/static/*`, `/healthz`.

use crate::config::Config;
use crate::metrics::Metrics;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dashmap::DashSet;
use prometheus::IntGauge;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skyline::{
    find_plot, generate_scene, load_footprints, load_plots, HeightRecommendation, LoadError,
    PipelineError,
};
use std::{
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tower_http::{services::ServeDir, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub metrics: Arc<Metrics>,
    /// Output directories with a generation in progress.
    pub in_flight: Arc<DashSet<PathBuf>>,
}

impl AppState {
    pub fn new(config: Config, metrics: Metrics) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(metrics),
            in_flight: Arc::new(DashSet::new()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    let metrics = state.metrics.router();
    let static_files = ServeDir::new(&state.config.static_dir);

    Router::new()
        .route("/scene_data", get(scene_data))
        .route("/scene_data/", get(scene_data))
        .nest_service("/static", static_files)
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
        .merge(metrics)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Metric label.
    fn outcome(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::PayloadTooLarge(_) => "too_large",
            ApiError::Unprocessable(_) => "unprocessable",
            ApiError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "detail": self.to_string() });
        (self.status(), Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            e if e.is_input_error() => ApiError::Unprocessable(e.to_string()),
            e @ PipelineError::EncodingOverflow(_) => ApiError::PayloadTooLarge(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<LoadError> for ApiError {
    fn from(err: LoadError) -> Self {
        match err {
            e if e.is_not_found() => ApiError::NotFound(format!("GIS data file not found: {e}")),
            e @ LoadError::Json { .. } => ApiError::Unprocessable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SceneQuery {
    #[serde(default = "default_buildings_file")]
    pub buildings_file: String,
    #[serde(default = "default_land_use_file")]
    pub land_use_file: String,
    #[serde(default = "default_height_column")]
    pub height_column: String,
    #[serde(default = "default_plot_id_column")]
    pub plot_id_column: String,
    #[serde(default = "default_target_plot_id")]
    pub target_plot_id: String,
}

fn default_buildings_file() -> String {
    "data/sample_buildings.geojson".into()
}
fn default_land_use_file() -> String {
    "data/sample_land_use.geojson".into()
}
fn default_height_column() -> String {
    "height".into()
}
fn default_plot_id_column() -> String {
    "plot_ID".into()
}
fn default_target_plot_id() -> String {
    "PlotA123".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneResponse {
    pub tileset_url: String,
    pub height_recommendation: Option<HeightRecommendation>,
}

/// Relative path without `..`; anything else is refused.
fn confined(root: &Path, requested: &str) -> Result<PathBuf, ApiError> {
    let rel = Path::new(requested);
    if rel
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ApiError::BadRequest(format!(
            "path '{requested}' must be relative and stay inside the data directory"
        )));
    }

    Ok(root.join(rel))
}

/// Output directory name for one request.
///
/// Readable prefix from the plot and height column (separators and spaces
/// become `_`), then a digest over every query parameter so requests that
/// differ anywhere never share a directory.
fn scene_name(query: &SceneQuery) -> String {
    let mut hasher = Sha256::new();
    for field in [
        &query.buildings_file,
        &query.land_use_file,
        &query.height_column,
        &query.plot_id_column,
        &query.target_plot_id,
    ] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    let digest: [u8; 32] = hasher.finalize().into();
    let tag: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();

    format!("scene_{}_{}_{tag}", query.target_plot_id, query.height_column)
        .replace([' ', '/', '\\'], "_")
}

/// Holds an output directory in the in-flight set and the running-scenes
/// gauge up for as long as its generation job exists.
struct InFlightGuard {
    set: Arc<DashSet<PathBuf>>,
    path: PathBuf,
    gauge: IntGauge,
}

impl InFlightGuard {
    /// `None` when the directory is already taken.
    fn acquire(set: &Arc<DashSet<PathBuf>>, path: PathBuf, gauge: &IntGauge) -> Option<Self> {
        if !set.insert(path.clone()) {
            return None;
        }
        gauge.inc();

        Some(Self {
            set: set.clone(),
            path,
            gauge: gauge.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.gauge.dec();
        self.set.remove(&self.path);
    }
}

pub async fn scene_data(
    State(state): State<AppState>,
    Query(query): Query<SceneQuery>,
) -> Result<Json<SceneResponse>, ApiError> {
    tracing::info!(target_plot_id = %query.target_plot_id, "Received scene_data request");

    let result = scene_data_inner(&state, query).await;

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, status = %e.status(), "scene_data failed");
            e.outcome()
        }
    };
    state
        .metrics
        .scene_requests_total
        .with_label_values(&[outcome])
        .inc();

    result.map(Json)
}

async fn scene_data_inner(state: &AppState, query: SceneQuery) -> Result<SceneResponse, ApiError> {
    let config = state.config.clone();
    let buildings_path = confined(&config.data_root, &query.buildings_file)?;
    let land_use_path = confined(&config.data_root, &query.land_use_file)?;

    let name = scene_name(&query);
    let output_dir = config.tilesets_dir().join(&name);

    let metrics = state.metrics.clone();
    let guard = InFlightGuard::acquire(
        &state.in_flight,
        output_dir.clone(),
        &metrics.scenes_in_flight,
    )
    .ok_or_else(|| ApiError::Conflict(format!("scene {name} is already being generated")))?;

    // The job owns the guard: a client that disconnects drops this future,
    // not the generation, and the directory stays claimed until it finishes.
    let job = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        let started = Instant::now();

        let result = build_scene(&config, &query, &buildings_path, &land_use_path, &output_dir);

        metrics
            .scene_generation_seconds
            .observe(started.elapsed().as_secs_f64());
        if let Ok((tile_count, recommendation)) = &result {
            metrics.tiles_written_total.inc_by(*tile_count as u64);
            if recommendation.is_some() {
                metrics.recommendations_total.inc();
            }
        }

        result
    })
    .await;

    let (tile_count, recommendation) =
        job.map_err(|e| ApiError::Internal(format!("scene task failed: {e}")))??;

    let tileset_url = format!("/static/tilesets/{name}/{}", skyline::MANIFEST_FILE);
    tracing::info!(%tileset_url, tile_count, "Tileset generated");

    Ok(SceneResponse {
        tileset_url,
        height_recommendation: recommendation,
    })
}

/// Blocking part of a request: load, clean the output directory, generate.
fn build_scene(
    config: &Config,
    query: &SceneQuery,
    buildings_path: &Path,
    land_use_path: &Path,
    output_dir: &Path,
) -> Result<(usize, Option<HeightRecommendation>), ApiError> {
    let buildings = load_footprints(buildings_path, &query.height_column, None)?;
    if buildings.is_empty() {
        return Err(ApiError::NotFound(format!(
            "Building data not found or empty at {}",
            buildings_path.display()
        )));
    }

    let plots = load_plots(land_use_path, &query.plot_id_column)?;
    if plots.is_empty() {
        return Err(ApiError::NotFound(format!(
            "Land use data not found or empty at {}",
            land_use_path.display()
        )));
    }

    let target = find_plot(&plots, &query.target_plot_id);
    if target.is_none() {
        tracing::warn!(target_plot_id = %query.target_plot_id, "Target plot not found");
    }

    if output_dir.exists() {
        tracing::info!(dir = %output_dir.display(), "Removing stale tileset directory");
        std::fs::remove_dir_all(output_dir)
            .map_err(|e| ApiError::Internal(format!("removing {}: {e}", output_dir.display())))?;
    }
    std::fs::create_dir_all(output_dir)
        .map_err(|e| ApiError::Internal(format!("creating {}: {e}", output_dir.display())))?;

    let output = generate_scene(&buildings, target, output_dir, &config.pipeline)?;

    Ok((output.tile_count, output.recommendation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use skyline::PipelineConfig;
    use std::{fs, time::Duration};
    use tower::ServiceExt;

    const BUILDINGS: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"height": 10},
         "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [10, 0], [10, 10], [0, 10], [0, 0]]]}},
        {"type": "Feature", "properties": {"height": 20},
         "geometry": {"type": "Polygon", "coordinates": [[[12, 0], [22, 0], [22, 10], [12, 10], [12, 0]]]}},
        {"type": "Feature", "properties": {"height": 30},
         "geometry": {"type": "Polygon", "coordinates": [[[0, 12], [10, 12], [10, 22], [0, 22], [0, 12]]]}}
    ]}"#;

    const PLOTS: &str = r#"{"type": "FeatureCollection", "features": [
        {"type": "Feature", "properties": {"plot_ID": "PlotA123"},
         "geometry": {"type": "Polygon", "coordinates": [[[10, 10], [12, 10], [12, 12], [10, 12], [10, 10]]]}}
    ]}"#;

    fn state(root: &Path) -> AppState {
        fs::create_dir_all(root.join("data")).unwrap();
        fs::write(root.join("data/sample_buildings.geojson"), BUILDINGS).unwrap();
        fs::write(root.join("data/sample_land_use.geojson"), PLOTS).unwrap();

        let config = Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            data_root: root.to_path_buf(),
            static_dir: root.join("static"),
            pipeline: PipelineConfig {
                proximity: 0.0,
                ..PipelineConfig::default()
            },
        };

        AppState::new(config, Metrics::new().unwrap())
    }

    fn default_scene() -> String {
        scene_name(&query(&[]).0)
    }

    async fn get_status(state: &AppState, uri: &str) -> (StatusCode, Option<String>) {
        let resp = app(state.clone())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let content_type = resp
            .headers()
            .get("content-type")
            .map(|v| v.to_str().unwrap().to_owned());

        (resp.status(), content_type)
    }

    fn query(pairs: &[(&str, &str)]) -> Query<SceneQuery> {
        let encoded: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let uri: axum::http::Uri = format!("/scene_data?{}", encoded.join("&")).parse().unwrap();
        Query::try_from_uri(&uri).unwrap()
    }

    #[tokio::test]
    async fn scene_data_generates_and_recommends() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let Json(resp) = scene_data(State(state.clone()), query(&[])).await.unwrap();
        assert_eq!(
            resp.tileset_url,
            format!("/static/tilesets/{}/tileset.json", default_scene())
        );
        assert!(default_scene().starts_with("scene_PlotA123_height_"));

        // All three buildings touch the plot's corners.
        let rec = resp.height_recommendation.unwrap();
        assert_eq!(rec.value, 20.0);
        assert_eq!(rec.position, [11.0, 11.0, 0.0]);

        let (status, content_type) = get_status(&state, &resp.tileset_url).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));

        let tile = format!("/static/tilesets/{}/tiles/tile_0.b3dm", default_scene());
        assert_eq!(get_status(&state, &tile).await.0, StatusCode::OK);

        assert!(state.in_flight.is_empty());
        assert_eq!(state.metrics.scenes_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn repeated_request_replaces_previous_output() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let out = dir.path().join("static/tilesets").join(default_scene());

        scene_data(State(state.clone()), query(&[])).await.unwrap();
        fs::write(out.join("stale.txt"), "left over").unwrap();

        scene_data(State(state.clone()), query(&[])).await.unwrap();
        assert!(!out.join("stale.txt").exists());
        assert!(out.join("tileset.json").is_file());
    }

    #[tokio::test]
    async fn unknown_plot_still_builds_tileset() {
        let dir = tempfile::tempdir().unwrap();
        let Json(resp) = scene_data(
            State(state(dir.path())),
            query(&[("target_plot_id", "Nope%201")]),
        )
        .await
        .unwrap();

        assert!(resp.tileset_url.starts_with("/static/tilesets/scene_Nope_1_height_"));
        assert!(resp.height_recommendation.is_none());
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let err = scene_data(
            State(state(dir.path())),
            query(&[("buildings_file", "data/absent.geojson")]),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn escaping_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let err = scene_data(State(state.clone()), query(&[("land_use_file", "../secret.geojson")]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        fs::create_dir_all(dir.path().join("static")).unwrap();
        let (status, _) = get_status(&state, "/static/../data/sample_buildings.geojson").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_409() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        state
            .in_flight
            .insert(state.config.tilesets_dir().join(default_scene()));

        let err = scene_data(State(state), query(&[])).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn degenerate_building_is_422() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        fs::write(
            dir.path().join("data/flat.geojson"),
            r#"{"type": "FeatureCollection", "features": [
                {"type": "Feature", "properties": {"height": 5},
                 "geometry": {"type": "Polygon", "coordinates": [[[0, 0], [1, 1], [2, 2], [0, 0]]]}}
            ]}"#,
        )
        .unwrap();

        let err = scene_data(State(state), query(&[("buildings_file", "data/flat.geojson")]))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn cancelled_request_keeps_its_directory_claimed() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());

        let features: Vec<String> = (0..5_000)
            .map(|i| {
                let (x, y) = ((i % 100) as f64 * 20.0, (i / 100) as f64 * 20.0);
                format!(
                    r#"{{"type": "Feature", "properties": {{"height": {h}}},
                       "geometry": {{"type": "Polygon", "coordinates": [[[{x}, {y}], [{x1}, {y}], [{x1}, {y1}], [{x}, {y1}], [{x}, {y}]]]}}}}"#,
                    h = 5 + i % 40,
                    x1 = x + 10.0,
                    y1 = y + 10.0,
                )
            })
            .collect();
        fs::write(
            dir.path().join("data/many.geojson"),
            format!(r#"{{"type": "FeatureCollection", "features": [{}]}}"#, features.join(",")),
        )
        .unwrap();

        let pairs = [("buildings_file", "data/many.geojson")];
        let out = state.config.tilesets_dir().join(scene_name(&query(&pairs).0));

        // The client gives up long before the job is done.
        let cancelled = tokio::time::timeout(
            Duration::from_millis(1),
            scene_data(State(state.clone()), query(&pairs)),
        )
        .await;
        assert!(cancelled.is_err());

        assert!(state.in_flight.contains(&out));
        assert_eq!(state.metrics.scenes_in_flight.get(), 1);

        let err = scene_data(State(state.clone()), query(&pairs)).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        for _ in 0..1_200 {
            if state.in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(state.in_flight.is_empty());
        assert_eq!(state.metrics.scenes_in_flight.get(), 0);
        assert!(out.join("tileset.json").is_file());
    }

    #[test]
    fn scene_names_cover_every_parameter() {
        let base = scene_name(&query(&[("target_plot_id", "a%2Fb%5Cc%20d"), ("height_column", "h")]).0);
        assert!(base.starts_with("scene_a_b_c_d_h_"));
        assert!(!base.contains('/'));

        // Same readable prefix, different inputs.
        let flattened = scene_name(&query(&[("target_plot_id", "a_b_c_d"), ("height_column", "h")]).0);
        assert_ne!(base, flattened);

        let names: Vec<String> = [
            ("buildings_file", "data/other.geojson"),
            ("land_use_file", "data/other.geojson"),
            ("height_column", "levels"),
            ("plot_id_column", "parcel"),
            ("target_plot_id", "PlotB"),
        ]
        .iter()
        .map(|pair| scene_name(&query(&[*pair]).0))
        .collect();

        for (i, name) in names.iter().enumerate() {
            assert_ne!(name, &default_scene());
            assert!(names[i + 1..].iter().all(|other| other != name));
        }

        assert_eq!(default_scene(), scene_name(&query(&[]).0));
    }
}
