//! Introspection HTTP endpoint: pool status, metrics and health
//!
//! Also serves the lease API used by the node's IP allocator:
//! `POST /v1/leases` leases a free address, `PUT /v1/leases/<ip>` records an
//! address already in use and `DELETE /v1/leases/<ip>` returns it.

use eni_core::{AddressLease, EngineError, InterfacePool};
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Serve introspection requests until `shutdown` flips to true
pub async fn serve(listener: TcpListener, pool: Arc<InterfacePool>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Error accepting introspection connection: {}", e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let pool = pool.clone();

                tokio::task::spawn(async move {
                    let service = service_fn(move |req| handle_request(req, pool.clone()));
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Error serving connection from {}: {}", peer_addr, e);
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("introspection server stopping");
                    return;
                }
            }
        }
    }
}

async fn handle_request<B>(
    req: Request<B>,
    pool: Arc<InterfacePool>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    debug!("{} {}", req.method(), req.uri().path());
    Ok(route(req.method(), req.uri().path(), &pool).await)
}

async fn route(method: &Method, path: &str, pool: &InterfacePool) -> Response<Full<Bytes>> {
    if let Some(rest) = path.strip_prefix("/v1/leases") {
        return lease_route(method, rest, pool).await;
    }
    if *method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n".to_string());
    }

    match path {
        "/healthz" => text(StatusCode::OK, "OK\n".to_string()),
        "/metrics" => match pool.metrics().gather() {
            Ok(body) => with_content_type(text(StatusCode::OK, body), "text/plain; version=0.0.4"),
            Err(e) => text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to gather metrics: {}\n", e),
            ),
        },
        "/v1/interfaces" => json(StatusCode::OK, &pool.status().await),
        _ => text(StatusCode::NOT_FOUND, "Not Found\n".to_string()),
    }
}

async fn lease_route(method: &Method, rest: &str, pool: &InterfacePool) -> Response<Full<Bytes>> {
    let address = match rest.trim_start_matches('/') {
        "" => None,
        raw => match raw.parse::<Ipv4Addr>() {
            Ok(address) => Some(address),
            Err(_) => return text(StatusCode::BAD_REQUEST, format!("Invalid address: {}\n", raw)),
        },
    };

    match (method, address) {
        (&Method::POST, None) => match pool.lease_address().await {
            Ok(lease) => json(StatusCode::CREATED, &lease),
            Err(e) => engine_error(e),
        },
        (&Method::PUT, Some(address)) => match pool.claim_address(address).await {
            Ok(lease) => json(StatusCode::OK, &lease),
            Err(e) => engine_error(e),
        },
        (&Method::DELETE, Some(address)) => match pool.release_address(address).await {
            Ok(()) => text(StatusCode::NO_CONTENT, String::new()),
            Err(e) => engine_error(e),
        },
        _ => text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n".to_string()),
    }
}

fn engine_error(err: EngineError) -> Response<Full<Bytes>> {
    let status = match err {
        EngineError::NoFreeAddress => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::AddressNotLeased(_) | EngineError::UnknownAddress(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    text(status, format!("{}\n", err))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            with_content_type(response, "application/json")
        }
        Err(e) => text(StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

fn with_content_type(mut response: Response<Full<Bytes>>, content_type: &'static str) -> Response<Full<Bytes>> {
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use eni_api::PoolStatus;
    use eni_core::{EngineConfig, EngineMetrics};
    use http_body_util::BodyExt;

    async fn pool() -> Arc<InterfacePool> {
        let sim = SimulationConfig::default();
        let engine = EngineConfig {
            instance_id: sim.instance_id.clone(),
            ..EngineConfig::default()
        };
        let cloud = Arc::new(sim.build_cloud(&engine).unwrap());
        let pool = InterfacePool::from_config(cloud, engine, EngineMetrics::new().unwrap());
        pool.bootstrap().await.unwrap();
        Arc::new(pool)
    }

    async fn body(response: Response<Full<Bytes>>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn test_healthz() {
        let pool = pool().await;
        let response = route(&Method::GET, "/healthz", &pool).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body(response).await, "OK\n");
    }

    #[tokio::test]
    async fn test_interfaces_returns_pool_status() {
        let pool = pool().await;
        pool.provision().await.unwrap();

        let response = route(&Method::GET, "/v1/interfaces", &pool).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let status: PoolStatus = serde_json::from_slice(&body(response).await).unwrap();
        assert_eq!(status.network_id, "vpc-sim");
        assert_eq!(status.interfaces.len(), 2);
        assert_eq!(status.capacity, 20);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let pool = pool().await;
        pool.provision().await.unwrap();

        let response = route(&Method::GET, "/metrics", &pool).await;
        let text = String::from_utf8(body(response).await.to_vec()).unwrap();
        assert!(text.contains("eni_provision_total 1"));
        assert!(text.contains("eni_address_capacity 20"));
    }

    #[tokio::test]
    async fn test_unknown_path_and_method() {
        let pool = pool().await;
        assert_eq!(
            route(&Method::GET, "/nope", &pool).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&Method::POST, "/healthz", &pool).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }

    #[tokio::test]
    async fn test_lease_claim_and_release() {
        let pool = pool().await;

        let response = route(&Method::POST, "/v1/leases", &pool).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let lease: serde_json::Value = serde_json::from_slice(&body(response).await).unwrap();
        let leased = lease["address"].as_str().unwrap().to_string();
        assert_eq!(pool.leased_count().await, 1);

        let free = pool
            .interfaces()
            .await
            .into_iter()
            .flat_map(|iface| iface.addresses)
            .find(|addr| addr.to_string() != leased)
            .unwrap();
        let response = route(&Method::PUT, &format!("/v1/leases/{}", free), &pool).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.leased_count().await, 2);

        let response = route(&Method::DELETE, &format!("/v1/leases/{}", leased), &pool).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(pool.leased_count().await, 1);
    }

    #[tokio::test]
    async fn test_lease_errors_map_to_status() {
        let pool = pool().await;
        assert_eq!(
            route(&Method::DELETE, "/v1/leases/10.9.9.9", &pool).await.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&Method::PUT, "/v1/leases/not-an-ip", &pool).await.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            route(&Method::GET, "/v1/leases", &pool).await.status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
