use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use leasing::metrics::LEASING_REGISTRY;
use leasing::Shutdown;
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, Encoder,
    HistogramVec, IntCounterVec, Registry, TextEncoder,
};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

pub const DEFAULT_METRICS_PORT: u16 = 9001;

lazy_static! {
    pub static ref PLATFORM_REGISTRY: Registry =
        Registry::new_custom(Some("platform".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref HTTP_REQUESTS: IntCounterVec = register_int_counter_vec_with_registry!(
        "http_requests_total",
        "Front-end requests, labeled by route and outcome",
        &["route", "status"],
        PLATFORM_REGISTRY
    )
    .unwrap();
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec_with_registry!(
        "http_request_duration_seconds",
        "Front-end request latency",
        &["route"],
        PLATFORM_REGISTRY
    )
    .unwrap();
}

fn gather() -> Vec<prometheus::proto::MetricFamily> {
    let mut metric_families = PLATFORM_REGISTRY.gather();
    metric_families.extend(LEASING_REGISTRY.gather());
    metric_families.extend(prometheus::gather());
    metric_families
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, hyper::http::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            if let Err(e) = encoder.encode(&gather(), &mut buffer) {
                tracing::error!("Cannot encode metrics: {}", e);
                return Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty());
            }
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, encoder.format_type())
                .body(Body::from(buffer))
        }
        (&Method::GET, "/health") => {
            let health_status = json!({
                "status": "healthy",
                "timestamp": std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs(),
                "version": env!("CARGO_PKG_VERSION"),
                "metrics_count": gather().len()
            });
            Response::builder()
                .status(StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/json")
                .body(Body::from(health_status.to_string()))
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("Not Found")),
    }
}

/// Serves `/metrics` and `/health` until `shutdown` fires.
pub fn start_server(port_number: Option<u16>, shutdown: Shutdown) -> eyre::Result<JoinHandle<()>> {
    let port = port_number.unwrap_or(DEFAULT_METRICS_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, Infallible>(service_fn(handle_request))
    });
    let server = Server::try_bind(&addr)?
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        });

    Ok(tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);
        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    }))
}
