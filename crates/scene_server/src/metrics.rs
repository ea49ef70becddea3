use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Prometheus collectors for the scene server, shared behind an `Arc`.
pub struct Metrics {
    pub registry: Registry,
    /// `/scene_data` requests by outcome (`ok`, `not_found`, `conflict`, ...).
    pub scene_requests_total: IntCounterVec,
    pub scene_generation_seconds: Histogram,
    pub tiles_written_total: IntCounter,
    pub recommendations_total: IntCounter,
    /// Scene generations currently running.
    pub scenes_in_flight: IntGauge,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("scene_server".into()), None)?;

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry.register(Box::new(collector.clone()))?;
                collector
            }};
        }

        Ok(Self {
            scene_requests_total: reg!(IntCounterVec::new(
                Opts::new("scene_requests_total", "Scene requests by outcome"),
                &["outcome"]
            )?),
            scene_generation_seconds: reg!(Histogram::with_opts(
                HistogramOpts::new(
                    "scene_generation_seconds",
                    "Wall time of one tileset generation"
                )
                .buckets(prometheus::exponential_buckets(0.01, 2.0, 12)?)
            )?),
            tiles_written_total: reg!(IntCounter::new(
                "tiles_written_total",
                "Total number of b3dm tiles written"
            )?),
            recommendations_total: reg!(IntCounter::new(
                "recommendations_total",
                "Total number of height recommendations returned"
            )?),
            scenes_in_flight: reg!(IntGauge::new(
                "scenes_in_flight",
                "Scene generations currently running"
            )?),
            registry,
        })
    }

    /// Creates an `axum::Router` that serves the metrics on `/metrics`.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let mut buf = Vec::new();
                    match TextEncoder::new().encode(&registry.gather(), &mut buf) {
                        Ok(()) => String::from_utf8_lossy(&buf).into_owned().into_response(),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
                    }
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collectors_are_prefixed() {
        let metrics = Metrics::new().unwrap();
        metrics.scene_requests_total.with_label_values(&["ok"]).inc();
        metrics.tiles_written_total.inc_by(3);

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|mf| mf.get_name().to_string())
            .collect();

        assert!(names.contains(&"scene_server_scene_requests_total".to_string()));
        assert!(names.contains(&"scene_server_tiles_written_total".to_string()));
    }
}
