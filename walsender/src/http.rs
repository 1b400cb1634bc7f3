//! A minimal monitoring surface: one GET endpoint serving the slot table's
//! current state as JSON, trimmed from the teacher's JWT-authenticated,
//! routerify-based HTTP API down to the single unauthenticated read this
//! crate's monitoring contract needs (see DESIGN.md for what was left
//! behind and why).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};

use crate::lifecycle::monitoring_rows;
use crate::slot::SlotTable;

pub async fn serve(addr: SocketAddr, slot_table: Arc<SlotTable>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let slot_table = Arc::clone(&slot_table);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let slot_table = Arc::clone(&slot_table);
                async move { Ok::<_, Infallible>(handle(req, &slot_table)) }
            }))
        }
    });

    tracing::info!(%addr, "starting monitoring http endpoint");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

fn handle(req: Request<Body>, slot_table: &SlotTable) -> Response<Body> {
    match (req.method(), req.uri().path()) {
        (&hyper::Method::GET, "/status") => {
            let rows = monitoring_rows(slot_table);
            let body = serde_json::to_vec(&rows).unwrap_or_else(|_| b"[]".to_vec());
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_path_is_404() {
        let table = SlotTable::new(1);
        let req = Request::builder()
            .method("GET")
            .uri("/nope")
            .body(Body::empty())
            .unwrap();
        let resp = handle(req, &table);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn status_path_returns_json() {
        let table = SlotTable::new(1);
        let req = Request::builder()
            .method("GET")
            .uri("/status")
            .body(Body::empty())
            .unwrap();
        let resp = handle(req, &table);
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
