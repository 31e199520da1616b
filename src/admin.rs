//! Liveness and readiness endpoints.

use hyper::{Body, Method, Request, Response, StatusCode};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::info;

/// Serves `/live` (always up) and `/ready` (up once the node cache has
/// synced) until the process exits.
pub async fn serve(addr: SocketAddr, ready: watch::Receiver<bool>) -> hyper::Result<()> {
    let server = hyper::Server::bind(&addr).serve(hyper::service::make_service_fn(move |_conn| {
        let ready = ready.clone();
        futures::future::ok::<_, hyper::Error>(hyper::service::service_fn(
            move |req: Request<Body>| {
                let ready = *ready.borrow();
                async move { Ok::<_, hyper::Error>(handle(&req, ready)) }
            },
        ))
    }));
    info!(%addr, "Serving admin endpoints");
    server.await
}

fn handle(req: &Request<Body>, ready: bool) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/live") => Response::new(Body::from("alive\n")),
        (&Method::GET, "/ready") if ready => Response::new(Body::from("ready\n")),
        (&Method::GET, "/ready") => mk_status(StatusCode::SERVICE_UNAVAILABLE),
        _ => mk_status(StatusCode::NOT_FOUND),
    }
}

fn mk_status(status: StatusCode) -> Response<Body> {
    let mut rsp = Response::new(Body::empty());
    *rsp.status_mut() = status;
    rsp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request<Body> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn readiness_follows_the_cache_sync() {
        assert_eq!(handle(&get("/live"), false).status(), StatusCode::OK);
        assert_eq!(
            handle(&get("/ready"), false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(handle(&get("/ready"), true).status(), StatusCode::OK);
        assert_eq!(handle(&get("/nope"), true).status(), StatusCode::NOT_FOUND);
    }
}
