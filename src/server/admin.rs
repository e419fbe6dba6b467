use super::GatewayState;
use crate::proxy::context::{full_body, BoxBody};
use crate::routing::RouteTarget;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::{SystemTime, UNIX_EPOCH};

/// The admin surface (§6): metrics, liveness/readiness, a config snapshot,
/// version, and a small dashboard. Served on a separate port from the
/// public proxy listener.
pub fn handle_admin(req: Request<Incoming>, state: GatewayState) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => {
            let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
            Ok(json_response(200, &format!(r#"{{"status":"ok","timestamp":{now}}}"#)))
        }

        "/ready" | "/readyz" => {
            let cfg = state.config.load();
            Ok(json_response(
                200,
                &format!(r#"{{"status":"ready","total_routes":{}}}"#, cfg.total_route_count()),
            ))
        }

        "/metrics" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),

        "/config" => {
            let cfg = state.config.load();
            let body = serde_json::to_string_pretty(&**cfg).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/version" => Ok(json_response(200, &format!(r#"{{"version":"{}"}}"#, env!("CARGO_PKG_VERSION")))),

        "/routes" => {
            let table = state.routing.load();
            let routes: Vec<serde_json::Value> = table
                .all_routes()
                .iter()
                .map(|r| {
                    let kind = match &r.target {
                        RouteTarget::Upstream => "upstream",
                        RouteTarget::FileServer(_) => "file_server",
                        RouteTarget::TcpProxy(_) => "tcp_proxy",
                    };
                    serde_json::json!({"path": r.path, "target": kind})
                })
                .collect();
            let body = serde_json::to_string_pretty(&routes).unwrap_or_default();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }

        "/dashboard" | "/" => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/html; charset=utf-8")
            .body(full_body(dashboard_html(&state)))
            .unwrap()),

        _ => Ok(json_response(404, r#"{"error":"not found"}"#)),
    }
}

fn json_response(status: u16, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

fn dashboard_html(state: &GatewayState) -> String {
    let cfg = state.config.load();
    format!(
        "<!doctype html><html><head><title>gateway</title></head><body>\
         <h1>edge gateway</h1>\
         <p>routes: {}</p>\
         <ul>\
         <li><a href=\"/metrics\">/metrics</a></li>\
         <li><a href=\"/health\">/health</a></li>\
         <li><a href=\"/ready\">/ready</a></li>\
         <li><a href=\"/config\">/config</a></li>\
         <li><a href=\"/routes\">/routes</a></li>\
         <li><a href=\"/version\">/version</a></li>\
         </ul></body></html>",
        cfg.total_route_count(),
    )
}
