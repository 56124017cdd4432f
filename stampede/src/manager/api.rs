//! The manager's REST surface, under `/manager/api/v1`.
//!
//! A plain hyper server with a hand-rolled router: requests are translated
//! into core types, handed to the attack service and presented back inside
//! the uniform `{status, data}` envelope.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode, body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use tokio::{net::TcpListener, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core;

use super::service::AttackService;

pub mod model;
pub mod presenters;

const API_PREFIX: &str = "/manager/api/v1";

/// Configuration of the REST server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to serve on, host:port.
    pub listen_addr: String,
}

/// Errors produced by [`Api`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The listen address could not be bound.
    #[error("failed to bind REST server to {addr}: {source}")]
    Bind {
        /// The configured address.
        addr: String,
        /// The bind error.
        #[source]
        source: std::io::Error,
    },
}

/// The REST server.
#[derive(Debug)]
pub struct Api {
    service: AttackService,
    config: Config,
}

impl Api {
    /// Create a REST server fronting `service`.
    #[must_use]
    pub fn new(service: AttackService, config: Config) -> Self {
        Self { service, config }
    }

    /// Serve until `shutdown` fires, then drain open connections.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be bound.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: self.config.listen_addr.clone(),
                source,
            })?;
        info!(addr = %self.config.listen_addr, "REST server up");

        let mut join_set = JoinSet::new();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("shutdown signal received, stopping REST server");
                    break;
                }
                incoming = listener.accept() => {
                    let (stream, peer) = match incoming {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("error accepting connection: {e}");
                            continue;
                        }
                    };
                    debug!(%peer, "accepted REST connection");

                    let service = self.service.clone();
                    join_set.spawn(async move {
                        let handler = service_fn(move |req| {
                            let service = service.clone();
                            async move { Ok::<_, hyper::Error>(route(service, req).await) }
                        });

                        let builder = auto::Builder::new(TokioExecutor::new());
                        if let Err(e) = builder
                            .serve_connection(TokioIo::new(stream), handler)
                            .await
                        {
                            error!("error serving {peer}: {e}");
                        }
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

async fn route(service: AttackService, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let Some(rest) = path.strip_prefix(API_PREFIX) else {
        return respond(StatusCode::NOT_FOUND, &model::error_empty());
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    match (method.as_str(), segments.as_slice()) {
        ("POST", ["attacks"]) => start_attack(service, req).await,
        ("GET", ["attacks"]) => {
            let attacks = service.get_attacks().await;
            respond(
                StatusCode::OK,
                &model::ok_response(presenters::present_attack_list(&attacks)),
            )
        }
        ("DELETE", ["attacks", id]) => stop_attack(service, id).await,
        ("POST", ["attacks", id, "increments"]) => start_increment(service, id, req).await,
        ("DELETE", ["attacks", attack_id, "increments", increment_id]) => {
            stop_increment(service, attack_id, increment_id).await
        }
        ("GET", ["scenarios"]) => {
            let scenarios = service.get_scenarios().await;
            respond(
                StatusCode::OK,
                &model::ok_response(presenters::present_scenario_list(&scenarios)),
            )
        }
        ("GET", ["nodes"]) => {
            let nodes = service.list_nodes().await;
            respond(
                StatusCode::OK,
                &model::ok_response(presenters::present_node_list(&nodes)),
            )
        }
        _ => respond(StatusCode::NOT_FOUND, &model::error_empty()),
    }
}

async fn start_attack(service: AttackService, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let body: model::StartAttackRequestBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let errors = model::validate_start_attack(&body);
    if !errors.is_empty() {
        return respond(
            StatusCode::UNPROCESSABLE_ENTITY,
            &model::validation_response(&errors),
        );
    }

    let start = match body.to_core() {
        Ok(start) => start,
        Err(err) => return core_error(&err),
    };

    match service.start_attack(start).await {
        Ok(details) => respond(
            StatusCode::CREATED,
            &model::ok_response(presenters::present_attack(&details)),
        ),
        Err(err) => core_error(&err),
    }
}

async fn stop_attack(service: AttackService, id: &str) -> Response<Full<Bytes>> {
    let Ok(attack_id) = id.parse::<i64>() else {
        return boundary_error(model::BoundaryError::InvalidPathParam);
    };

    match service.stop_attack(attack_id).await {
        Ok(()) => respond(StatusCode::OK, &model::ok_empty()),
        Err(err) => core_error(&err),
    }
}

async fn start_increment(
    service: AttackService,
    id: &str,
    req: Request<Incoming>,
) -> Response<Full<Bytes>> {
    let Ok(attack_id) = id.parse::<i64>() else {
        return boundary_error(model::BoundaryError::InvalidPathParam);
    };

    let body: model::StartIncrementRequestBody = match read_body(req).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    match service.start_increment(body.to_core(attack_id)).await {
        Ok(increment) => respond(
            StatusCode::CREATED,
            &model::ok_response(presenters::present_increment(&increment)),
        ),
        Err(err) => core_error(&err),
    }
}

async fn stop_increment(
    service: AttackService,
    attack_id: &str,
    increment_id: &str,
) -> Response<Full<Bytes>> {
    let Ok(attack_id) = attack_id.parse::<i64>() else {
        return boundary_error(model::BoundaryError::InvalidPathParam);
    };
    let Ok(increment_id) = increment_id.parse::<i64>() else {
        return boundary_error(model::BoundaryError::InvalidPathParam);
    };

    match service.stop_increment(attack_id, increment_id).await {
        Ok(()) => respond(StatusCode::OK, &model::ok_empty()),
        Err(err) => core_error(&err),
    }
}

/// Collect and parse a JSON request body, or produce the matching boundary
/// error response.
async fn read_body<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<Full<Bytes>>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            error!("error reading request body: {e}");
            return Err(boundary_error(model::BoundaryError::ParseBody));
        }
    };
    if bytes.is_empty() {
        return Err(boundary_error(model::BoundaryError::RequestBodyRequired));
    }

    serde_json::from_slice(&bytes).map_err(|e| {
        error!("error parsing request body: {e}");
        boundary_error(model::BoundaryError::ParseBody)
    })
}

fn core_error(err: &core::Error) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(model::core_error_status(err))
        .expect("status table yields valid codes");
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        return respond(status, &model::error_empty());
    }
    respond(status, &model::error_response(&err.to_string()))
}

fn boundary_error(err: model::BoundaryError) -> Response<Full<Bytes>> {
    respond(
        StatusCode::BAD_REQUEST,
        &model::error_response(&err.to_string()),
    )
}

fn respond(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let payload = serde_json::to_vec(body).expect("envelope always serializes");

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(payload)))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn serve() -> (String, CancellationToken, AttackService) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        let service = AttackService::new(Duration::from_secs(60));
        let api = Api::new(
            service.clone(),
            Config {
                listen_addr: addr.to_string(),
            },
        );

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { api.run(shutdown).await });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        (format!("http://{addr}{API_PREFIX}"), shutdown, service)
    }

    #[tokio::test]
    async fn get_attacks_returns_the_ok_envelope() {
        let (base, shutdown, _service) = serve().await;

        let response = reqwest::get(format!("{base}/attacks")).await.expect("get");
        assert_eq!(response.status().as_u16(), 200);

        let body: serde_json::Value = response.json().await.expect("json body");
        assert_eq!(body["status"], "OK");
        assert_eq!(body["data"], serde_json::json!([]));

        shutdown.cancel();
    }

    #[tokio::test]
    async fn invalid_bodies_get_422_with_field_errors() {
        let (base, shutdown, _service) = serve().await;

        let response = reqwest::Client::new()
            .post(format!("{base}/attacks"))
            .json(&serde_json::json!({
                "name": "a",
                "wait_time_sec": 0.01,
                "const_config": { "scenarios": { "http": 1 } },
            }))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status().as_u16(), 422);

        let body: serde_json::Value = response.json().await.expect("json body");
        assert_eq!(body["status"], "ERROR");
        assert_eq!(body["data"]["errors"][0]["field"], "wait_time_sec");

        shutdown.cancel();
    }

    #[tokio::test]
    async fn contradictory_configs_get_400_and_empty_fleets_404() {
        let (base, shutdown, _service) = serve().await;
        let client = reqwest::Client::new();

        // No config at all: bad-config.
        let response = client
            .post(format!("{base}/attacks"))
            .json(&serde_json::json!({ "name": "a", "wait_time_sec": 1.0 }))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status().as_u16(), 400);

        // Valid body but no node advertises the scenario.
        let response = client
            .post(format!("{base}/attacks"))
            .json(&serde_json::json!({
                "name": "a",
                "wait_time_sec": 1.0,
                "const_config": { "scenarios": { "http": 1 } },
            }))
            .send()
            .await
            .expect("post");
        assert_eq!(response.status().as_u16(), 404);

        // Unknown attack ids are 404 as well.
        let response = client
            .delete(format!("{base}/attacks/9"))
            .send()
            .await
            .expect("delete");
        assert_eq!(response.status().as_u16(), 404);

        // Unparsable path params are 400.
        let response = client
            .delete(format!("{base}/attacks/bogus"))
            .send()
            .await
            .expect("delete");
        assert_eq!(response.status().as_u16(), 400);

        shutdown.cancel();
    }
}
