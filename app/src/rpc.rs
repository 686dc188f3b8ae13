//! HTTP front end: sticky-routing admission in front of actor dispatch.

use crate::metrics::{HTTP_REQUESTS, HTTP_REQUEST_DURATION};
use hyper::header::{HeaderValue, COOKIE, SET_COOKIE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use leasing::uniquifier::NOT_HERE;
use leasing::{
    ActorDirectory, Admission, CreateOptions, Error, NodeRegistry, SetCookie, Shutdown,
    Uniquifier, Verdict,
};
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub const CA_PREFIX: &str = "/ca/";
pub const NO_LONGER_HERE: &str = "Redirect: No longer here";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JsonRpcErrorV1 {
    pub code: i32,
    pub message: String,
    #[serde(rename = "remoteNode", default, skip_serializing_if = "Option::is_none")]
    pub remote_node: Option<String>,
}

impl JsonRpcErrorV1 {
    pub const REDIRECT: i32 = -32000;
    pub const NO_SUCH_CA: i32 = -32001;

    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remote_node: None,
        }
    }

    fn parse_error() -> Self {
        Self::new(-32700, "Parse error")
    }

    fn internal_error(message: impl Into<String>) -> Self {
        Self::new(-32603, message)
    }

    /// Recoverable: the client retries until the actor's owner creates it.
    fn no_such_ca(message: impl Into<String>) -> Self {
        Self::new(Self::NO_SUCH_CA, message)
    }

    fn redirect(message: impl Into<String>, remote_node: Option<String>) -> Self {
        Self {
            code: Self::REDIRECT,
            message: message.into(),
            remote_node,
        }
    }
}

// https://www.jsonrpc.org/specification_v1#a1.2Response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcResponseV1 {
    pub result: Option<Value>,
    pub error: Option<JsonRpcErrorV1>,
    pub id: Value,
}

impl JsonRpcResponseV1 {
    fn ok(id: Value, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            id,
        }
    }

    fn err(id: Value, error: JsonRpcErrorV1) -> Self {
        Self {
            result: None,
            error: Some(error),
            id,
        }
    }
}

impl From<JsonRpcResponseV1> for Body {
    fn from(value: JsonRpcResponseV1) -> Self {
        serde_json::to_vec(&value).unwrap_or_default().into()
    }
}

type GenericError = Box<dyn std::error::Error + Send + Sync>;
type Result<T> = std::result::Result<T, GenericError>;

/// Everything a request needs, built once at startup.
pub struct FrontEnd {
    pub uniquifier: Arc<Uniquifier>,
    pub directory: Arc<dyn ActorDirectory>,
    pub registry: Arc<NodeRegistry>,
}

/// Whether `from` may create actor `actor_id`: both must share the owner,
/// the text before the first `-`.
pub fn allow_create(from: Option<&str>, actor_id: &str) -> bool {
    fn owner(name: &str) -> &str {
        name.split_once('-').map_or(name, |(owner, _)| owner)
    }
    from.is_some_and(|from| !owner(from).is_empty() && owner(from) == owner(actor_id))
}

fn cookie_header(req: &Request<Body>) -> Option<String> {
    let values: Vec<&str> = req
        .headers()
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    (!values.is_empty()).then(|| values.join("; "))
}

fn json_response(
    status: StatusCode,
    body: JsonRpcResponseV1,
    cookies: &[SetCookie],
) -> Result<Response<Body>> {
    let mut builder = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json");
    for cookie in cookies {
        builder = builder.header(SET_COOKIE, HeaderValue::from_str(&cookie.header_value())?);
    }
    Ok(builder.body(body.into())?)
}

fn redirect_response(id: Value, admission: Admission) -> Result<Response<Body>> {
    let error = match admission.verdict {
        Verdict::Redirect {
            message,
            remote_node,
        } => JsonRpcErrorV1::redirect(message, remote_node.map(|node| node.to_string())),
        Verdict::Proceed => JsonRpcErrorV1::internal_error("Not a redirect"),
    };
    json_response(
        StatusCode::OK,
        JsonRpcResponseV1::err(id, error),
        &admission.set_cookies,
    )
}

pub async fn handle_request(req: Request<Body>, front: Arc<FrontEnd>) -> Result<Response<Body>> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let (route, outcome, response) = match (&method, path.as_str()) {
        (&Method::GET, "/ping") => (
            "ping",
            "ok",
            Response::builder()
                .status(StatusCode::OK)
                .body(Body::from("pong"))?,
        ),
        (&Method::GET, "/nodes") => {
            let body = json!({
                "version": front.registry.version(),
                "nodeToken": front.uniquifier.node_token(),
                "bindings": front.registry.bindings(),
            });
            (
                "nodes",
                "ok",
                Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))?,
            )
        }
        (&Method::POST, path) if path.len() > CA_PREFIX.len() && path.starts_with(CA_PREFIX) => {
            let actor_id = path[CA_PREFIX.len()..].to_string();
            let (outcome, response) = handle_ca(req, &actor_id, &front).await?;
            ("ca", outcome, response)
        }
        (_, path) if path.starts_with(CA_PREFIX) => (
            "ca",
            "method_not_allowed",
            Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Body::empty())?,
        ),
        _ => (
            "unknown",
            "not_found",
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("Not Found"))?,
        ),
    };

    HTTP_REQUESTS.with_label_values(&[route, outcome]).inc();
    HTTP_REQUEST_DURATION
        .with_label_values(&[route])
        .observe(started.elapsed().as_secs_f64());
    Ok(response)
}

async fn handle_ca(
    req: Request<Body>,
    actor_id: &str,
    front: &FrontEnd,
) -> Result<(&'static str, Response<Body>)> {
    let cookies = cookie_header(&req);
    let bytes = hyper::body::to_bytes(req.into_body()).await?;
    let body: Value = match serde_json::from_slice(&bytes) {
        Ok(body) => body,
        Err(e) => {
            debug!(actor_id = %actor_id, error = %e, "Unparsable request");
            let response = json_response(
                StatusCode::BAD_REQUEST,
                JsonRpcResponseV1::err(Value::Null, JsonRpcErrorV1::parse_error()),
                &[],
            )?;
            return Ok(("parse_error", response));
        }
    };
    let id = body.get("id").cloned().unwrap_or(Value::Null);

    let admission = front.uniquifier.admit(cookies.as_deref(), actor_id).await;
    if !admission.is_proceed() {
        return Ok(("redirect", redirect_response(id, admission)?));
    }

    let from = body
        .get("meta")
        .and_then(|meta| meta.get("from"))
        .and_then(Value::as_str);
    let opts = CreateOptions {
        allow_create: allow_create(from, actor_id),
    };

    let started = Instant::now();
    let result = dispatch(front.directory.as_ref(), actor_id, opts, body).await;
    let elapsed = format!("{}ms", started.elapsed().as_millis());

    let (outcome, mut response) = match result {
        Ok(value) => (
            "ok",
            json_response(
                StatusCode::OK,
                JsonRpcResponseV1::ok(id, value),
                &admission.set_cookies,
            )?,
        ),
        Err(Error::RemoteOwner { owner, .. }) => {
            let redirect = front.uniquifier.redirect_to_owner(&owner, NO_LONGER_HERE);
            ("redirect", redirect_response(id, redirect)?)
        }
        Err(err @ Error::NoSuchActor(_)) => (
            "no_such_ca",
            json_response(
                StatusCode::OK,
                JsonRpcResponseV1::err(id, JsonRpcErrorV1::no_such_ca(err.to_string())),
                &admission.set_cookies,
            )?,
        ),
        Err(err @ Error::StoreUnavailable(_)) => {
            // store internals stay on this side
            error!(actor_id = %actor_id, error = %err, "Lease store failure while dispatching");
            (
                "internal_error",
                json_response(
                    StatusCode::OK,
                    JsonRpcResponseV1::err(id, JsonRpcErrorV1::internal_error("Internal error")),
                    &admission.set_cookies,
                )?,
            )
        }
        Err(err) => {
            warn!(actor_id = %actor_id, error = %err, "Dispatch failed");
            (
                "internal_error",
                json_response(
                    StatusCode::OK,
                    JsonRpcResponseV1::err(id, JsonRpcErrorV1::internal_error(err.to_string())),
                    &admission.set_cookies,
                )?,
            )
        }
    };
    response
        .headers_mut()
        .insert("X-Response-Time", HeaderValue::from_str(&elapsed)?);
    Ok((outcome, response))
}

async fn dispatch(
    directory: &dyn ActorDirectory,
    actor_id: &str,
    opts: CreateOptions,
    body: Value,
) -> leasing::Result<Value> {
    let actor = directory.create_or_fetch(actor_id, opts).await?;
    actor.deliver(body).await
}

/// Serves the front end on `port` until `shutdown` fires.
pub fn run_server(front: Arc<FrontEnd>, port: u16, shutdown: Shutdown) -> eyre::Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let server = Server::try_bind(&addr)?
        .serve(make_service_fn(move |_conn| {
            let front = front.clone();
            async move {
                Ok::<_, GenericError>(service_fn(move |req| handle_request(req, front.clone())))
            }
        }))
        .with_graceful_shutdown(async move {
            shutdown.wait().await;
        });

    tracing::info!("Starting front end on {}", addr);
    Ok(tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("Front end error: {}", e);
        }
    }))
}
