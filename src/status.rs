//! HTTP status endpoint.
//!
//! Serves the live system snapshot at `GET /status` as indented JSON. The
//! responder is deliberately unable to take the pipeline down: bind failures
//! are logged and the task exits, per-request problems answer with a client
//! error.

use crate::monitor::StatusState;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn serve(addr: SocketAddr, state: StatusState, cancel: CancellationToken) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, %addr, "failed to bind status server");
            return;
        }
    };

    info!("status server listening on http://{addr}/status");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("status server shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept status connection");
                        continue;
                    }
                };

                let state = state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let state = state.clone();
                        async move { Ok::<_, hyper::Error>(respond(&req, &state)) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %err, "error serving status connection");
                    }
                });
            }
        }
    }
}

fn respond<B>(req: &Request<B>, state: &StatusState) -> Response<Full<Bytes>> {
    if req.method() != Method::GET {
        return Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::from("Method Not Allowed")))
            .unwrap();
    }
    if req.uri().path() != "/status" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .unwrap();
    }

    let snapshot = state.snapshot();
    let body = serde_json::to_vec_pretty(&snapshot).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
