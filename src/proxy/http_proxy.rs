use crate::cache::{CacheEntry, CacheKey};
use crate::proxy::context::{empty_body, full_body, BoxBody, RequestContext};
use crate::routing::{CompiledRoute, RouteTarget};
use crate::server::GatewayState;
use crate::upstream::{BreakerCheck, Cluster};
use bytes::Bytes;
use http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, TRANSFER_ENCODING, VARY,
};
use http::{HeaderName, HeaderValue, StatusCode};
use http_body_util::BodyExt;
use http_body_util::StreamBody;
use hyper::body::{Frame, Incoming};
use hyper::Request;
use hyper::Response;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Handle an incoming HTTP request through a phased lifecycle:
///
/// 1. ROUTE_MATCH     — longest-prefix path match
/// 2. DISPATCH        — upstream proxy, file proxy, or 404
/// 3. UPSTREAM        — select a healthy node, forward the request
/// 4. ON_RESPONSE      — compression
/// 5. LOG             — access log + metrics
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let uri_path = req.uri().path().to_string();
    let method = req.method().as_str().to_string();
    let mut req_headers = req.headers().clone();

    let client_ip = req_headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    inject_forwarded_headers(&mut req_headers, peer_addr, &host);

    let mut ctx = RequestContext::new(host, uri_path, method, client_ip);

    let route = {
        let table = state.routing.load();
        table.match_route(&ctx.uri_path)
    };

    let route = match route {
        Some(r) => r,
        None => {
            debug!(host = %ctx.host, path = %ctx.uri_path, "no route matched");
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("content-type", "application/json")
                .body(full_body(r#"{"error":"not found"}"#))
                .unwrap());
        }
    };

    ctx.route_path = route.path.clone();
    ctx.route = Some(route.clone());

    metrics::gauge!(
        "gateway_http_requests_in_flight",
        "route" => ctx.route_path.clone(),
    )
    .increment(1.0);

    match &route.target {
        RouteTarget::FileServer(fs) => {
            let resp = crate::proxy::file_proxy::serve(&req, fs).await;
            ctx.finalize_metrics(resp.status().as_u16());
            log_access(&ctx, &resp, std::time::Duration::ZERO);
            Ok(resp)
        }
        RouteTarget::TcpProxy(_) => {
            // TCP routes are dispatched at the acceptor, before HTTP parsing
            // even begins — reaching here means a route is misconfigured as
            // both an HTTP listener target and a raw TCP target.
            ctx.finalize_metrics(StatusCode::BAD_GATEWAY.as_u16());
            Ok(ctx.error_response(StatusCode::BAD_GATEWAY, "route is not HTTP-addressable"))
        }
        RouteTarget::Upstream => {
            let cluster = match state.upstream.get(&route.path) {
                Some(c) => c,
                None => {
                    warn!(route = %ctx.route_path, "route has no backing cluster");
                    return Ok(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable"));
                }
            };

            let cacheable_request = state
                .cache
                .should_cache_request(&ctx.method, &ctx.uri_path, &req_headers);
            let mut revalidating: Option<(CacheKey, CacheEntry)> = None;

            if cacheable_request {
                let cache_key = cacheable_key(&state, &ctx, &req_headers).await;
                if let Some(entry) = state.cache.get(&cache_key).await {
                    if state.cache.needs_revalidation(&entry, &req_headers) {
                        inject_conditional_headers(&mut req_headers, &entry);
                        revalidating = Some((cache_key, entry));
                    } else {
                        metrics::counter!("gateway_cache_hits_total").increment(1);
                        let resp = response_from_cache_entry(&entry);
                        ctx.finalize_metrics(resp.status().as_u16());
                        log_access(&ctx, &resp, std::time::Duration::ZERO);
                        return Ok(resp);
                    }
                } else {
                    metrics::counter!("gateway_cache_misses_total").increment(1);
                }
            }

            let accept_encoding = req_headers
                .get(ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_owned());

            let (upstream_resp, upstream_elapsed) =
                match phase_upstream(req, &mut ctx, &cluster, &req_headers, &state).await {
                    Ok(result) => result,
                    Err(resp) => return Ok(resp),
                };

            if let Some((key, mut cached)) = revalidating {
                if upstream_resp.status() == StatusCode::NOT_MODIFIED {
                    let ttl = state.cache.ttl_for_response(&ctx.uri_path, upstream_resp.headers());
                    cached.created_at = Instant::now();
                    cached.expires_at = Instant::now() + ttl;
                    cached.hit_count += 1;
                    state.cache.put(key, cached.clone()).await;
                    let resp = response_from_cache_entry(&cached);
                    log_access(&ctx, &resp, upstream_elapsed);
                    ctx.finalize_metrics(resp.status().as_u16());
                    return Ok(resp);
                }
            }

            let mut final_resp = build_downstream_response(upstream_resp);

            if let Some(ref ae) = accept_encoding {
                if !final_resp.headers().contains_key(CONTENT_ENCODING) {
                    final_resp = try_compress_response(final_resp, ae);
                }
            }

            maybe_store_in_cache(&state, &ctx, &req_headers, cacheable_request, &mut final_resp).await;

            log_access(&ctx, &final_resp, upstream_elapsed);
            ctx.finalize_metrics(final_resp.status().as_u16());
            Ok(final_resp)
        }
    }
}

fn log_access(ctx: &RequestContext, resp: &Response<BoxBody>, upstream_elapsed: std::time::Duration) {
    let resp_status = resp.status().as_u16();
    let total_ms = ctx.start.elapsed().as_millis();
    let upstream_ms = upstream_elapsed.as_millis();

    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        host = %ctx.host,
        path = %ctx.uri_path,
        status = resp_status,
        route = %ctx.route_path,
        upstream = %ctx.upstream_addr,
        latency_ms = %total_ms,
        upstream_ms = %upstream_ms,
        "access"
    );
}

/// The key a request should be looked up under: the header names a prior
/// response for this resource named in its `Vary` header, read off the
/// *current* request (empty signature if nothing has ever varied here).
async fn cacheable_key(state: &GatewayState, ctx: &RequestContext, headers: &http::HeaderMap) -> CacheKey {
    let vary_signature = state
        .cache
        .vary_signature(&ctx.method, &ctx.uri_path, headers)
        .await;
    CacheKey::new(&ctx.method, &ctx.uri_path, "", vary_signature)
}

/// Attach `If-None-Match`/`If-Modified-Since` so a stale-but-present entry
/// can be revalidated with a conditional request instead of refetched.
fn inject_conditional_headers(headers: &mut http::HeaderMap, entry: &CacheEntry) {
    if let Some(etag) = entry.etag.as_deref() {
        if let Ok(v) = HeaderValue::from_str(etag) {
            headers.insert(IF_NONE_MATCH, v);
        }
    }
    if let Some(last_modified) = entry.last_modified.as_deref() {
        if let Ok(v) = HeaderValue::from_str(last_modified) {
            headers.insert(IF_MODIFIED_SINCE, v);
        }
    }
}

fn response_from_cache_entry(entry: &CacheEntry) -> Response<BoxBody> {
    let mut builder = Response::builder().status(entry.status);
    for (name, value) in &entry.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder.body(full_body(entry.body.clone())).unwrap()
}

async fn maybe_store_in_cache(
    state: &GatewayState,
    ctx: &RequestContext,
    req_headers: &http::HeaderMap,
    cacheable_request: bool,
    resp: &mut Response<BoxBody>,
) {
    if !cacheable_request {
        return;
    }
    let status = resp.status().as_u16();

    let (parts, body) = std::mem::replace(resp, Response::new(empty_body())).into_parts();
    let collected = match body.collect().await {
        Ok(c) => c.to_bytes(),
        Err(_) => {
            *resp = Response::from_parts(parts, empty_body());
            return;
        }
    };

    if !state.cache.should_cache_response(status, &parts.headers, collected.len()) {
        *resp = Response::from_parts(parts, full_body(collected));
        return;
    }

    // A response that names `Vary: *` can never be looked up reliably;
    // `record_vary` reports that back rather than remembering it.
    if let Some(vary) = parts.headers.get(VARY).and_then(|v| v.to_str().ok()) {
        let cacheable = state.cache.record_vary(&ctx.method, &ctx.uri_path, vary).await;
        if !cacheable {
            *resp = Response::from_parts(parts, full_body(collected));
            return;
        }
    }

    let headers: Vec<(String, String)> = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    let directives = parts
        .headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(crate::cache::parse_cache_control)
        .unwrap_or_default();

    let key = cacheable_key(state, ctx, req_headers).await;
    let ttl = state.cache.ttl_for_response(&ctx.uri_path, &parts.headers);
    let entry = state
        .cache
        .make_entry(status, headers, collected.clone(), ttl, &directives);
    state.cache.put(key, entry).await;

    metrics::gauge!("gateway_cache_entries").set(state.cache.len().await as f64);

    *resp = Response::from_parts(parts, full_body(collected));
}

/// Upstream phase: select a healthy node (skipping circuit-open / unhealthy
/// nodes), forward the request, record the outcome, return the response.
async fn phase_upstream(
    req: Request<Incoming>,
    ctx: &mut RequestContext,
    cluster: &Cluster,
    transformed_headers: &http::HeaderMap,
    state: &GatewayState,
) -> Result<(Response<Incoming>, std::time::Duration), Response<BoxBody>> {
    let cb_cfg = &state.config.load().circuit_breaker;
    let cb_enabled = cb_cfg.enabled;

    let req_method = req.method().clone();
    let req_uri_pq: String = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| "/".to_owned());
    let req_headers = transformed_headers.clone();
    let (_, body) = req.into_parts();

    let client_ip_str = ctx.client_ip.to_string();
    let (target, mut guard) = match cluster.select_upstream(Some(&client_ip_str)) {
        Some(v) => v,
        None => {
            warn!(route = %ctx.route_path, "no upstream available");
            return Err(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable"));
        }
    };

    let upstream_addr = target.instance.endpoint().to_owned();

    if !cluster.is_node_healthy(&upstream_addr) {
        warn!(route = %ctx.route_path, upstream = %upstream_addr, "node marked unhealthy by active health check");
        return Err(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable"));
    }

    if cb_enabled {
        if let BreakerCheck::Rejected = cluster.circuit_breakers().check(&upstream_addr, cb_cfg) {
            debug!(route = %ctx.route_path, upstream = %upstream_addr, "circuit breaker open, rejecting");
            metrics::counter!(
                "gateway_circuit_breaker_rejected_total",
                "route" => ctx.route_path.clone(),
                "upstream_addr" => upstream_addr.clone(),
            )
            .increment(1);
            return Err(ctx.error_response(StatusCode::SERVICE_UNAVAILABLE, "circuit open"));
        }
    }

    ctx.upstream_addr = upstream_addr.clone();

    let upstream_uri = format!("http://{upstream_addr}{req_uri_pq}");

    let mut headers = req_headers.clone();
    headers.insert(
        HOST,
        HeaderValue::from_str(&upstream_addr).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    remove_hop_headers(&mut headers);

    let mut builder = Request::builder().method(req_method).uri(&upstream_uri);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }

    let upstream_req = match builder.body(body.boxed()) {
        Ok(r) => r,
        Err(e) => {
            warn!(route = %ctx.route_path, error = %e, "failed to build upstream request");
            return Err(ctx.error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal server error"));
        }
    };

    let client = cluster.http_client();
    let timeout = std::time::Duration::from_secs(cb_cfg.timeout.max(1));

    let upstream_start = Instant::now();
    ctx.upstream_start = Some(upstream_start);

    let result = tokio::time::timeout(timeout, client.request(upstream_req)).await;

    match result {
        Ok(Ok(resp)) => {
            let elapsed = upstream_start.elapsed();
            let status = resp.status().as_u16();
            if cb_enabled {
                cluster
                    .circuit_breakers()
                    .record_outcome(&upstream_addr, cb_cfg, Some(status));
            }
            if is_server_error(status) {
                guard.mark_failed();
            }
            drop(guard);
            Ok((resp, elapsed))
        }
        Ok(Err(e)) => {
            if cb_enabled {
                cluster.circuit_breakers().record_failure(&upstream_addr, cb_cfg);
            }
            guard.mark_failed();
            warn!(route = %ctx.route_path, upstream = %upstream_addr, error = %e, "upstream error");
            Err(ctx.error_response(StatusCode::BAD_GATEWAY, "bad gateway"))
        }
        Err(_) => {
            if cb_enabled {
                cluster.circuit_breakers().record_timeout(&upstream_addr, cb_cfg);
            }
            guard.mark_failed();
            warn!(route = %ctx.route_path, upstream = %upstream_addr, "upstream timeout");
            Err(ctx.error_response(StatusCode::GATEWAY_TIMEOUT, "gateway timeout"))
        }
    }
}

fn is_server_error(status: u16) -> bool {
    (500..600).contains(&status)
}

fn build_downstream_response(upstream_resp: Response<Incoming>) -> Response<BoxBody> {
    let (parts, body) = upstream_resp.into_parts();
    let mut builder = Response::builder().status(parts.status);
    for (name, value) in &parts.headers {
        builder = builder.header(name, value);
    }
    builder.body(body.boxed()).unwrap()
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in hop_headers {
        headers.remove(h);
    }
}

/// Inject standard `X-Forwarded-*` and `X-Real-IP` headers so upstream
/// services can identify the original client and protocol.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, peer_addr: SocketAddr, original_host: &str) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = peer_addr.ip().to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !original_host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(original_host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

/// Negotiate the best encoding from the client's `Accept-Encoding` header.
/// Returns `"br"` (brotli) or `"gzip"` if accepted (q > 0), otherwise `None`.
fn negotiate_encoding(accept_encoding: &str) -> Option<&'static str> {
    let mut br_ok = false;
    let mut gzip_ok = false;

    for part in accept_encoding.split(',') {
        let part = part.trim();
        let mut tokens = part.splitn(2, ';');
        let encoding = tokens.next().unwrap_or("").trim().to_ascii_lowercase();

        let q: f32 = tokens
            .next()
            .and_then(|params| {
                params.split(';').find_map(|p| {
                    let p = p.trim();
                    p.strip_prefix("q=").and_then(|v| v.trim().parse::<f32>().ok())
                })
            })
            .unwrap_or(1.0);

        if q <= 0.0 {
            continue;
        }

        match encoding.as_str() {
            "br" => br_ok = true,
            "gzip" => gzip_ok = true,
            "*" => {
                br_ok = true;
                gzip_ok = true;
            }
            _ => {}
        }
    }

    if br_ok {
        Some("br")
    } else if gzip_ok {
        Some("gzip")
    } else {
        None
    }
}

/// Attempt to compress the response body using streaming compression.
fn try_compress_response(resp: Response<BoxBody>, accept_encoding: &str) -> Response<BoxBody> {
    let encoding = match negotiate_encoding(accept_encoding) {
        Some(e) => e,
        None => return resp,
    };

    let version = resp.version();
    let (mut parts, body) = resp.into_parts();

    let body_reader = tokio_util::io::StreamReader::new(BodyStream(body));
    let buf_reader = tokio::io::BufReader::new(body_reader);

    let compressed_body: BoxBody = match encoding {
        "gzip" => {
            let encoder = async_compression::tokio::bufread::GzipEncoder::new(buf_reader);
            wrap_encoder_as_body(encoder)
        }
        "br" => {
            let encoder = async_compression::tokio::bufread::BrotliEncoder::with_quality(
                buf_reader,
                async_compression::Level::Fastest,
            );
            wrap_encoder_as_body(encoder)
        }
        _ => unreachable!(),
    };

    parts.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
    parts.headers.remove(CONTENT_LENGTH);
    if version == http::Version::HTTP_11 || version == http::Version::HTTP_10 {
        parts
            .headers
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    }

    Response::from_parts(parts, compressed_body)
}

fn wrap_encoder_as_body<R>(encoder: R) -> BoxBody
where
    R: tokio::io::AsyncRead + Send + Sync + 'static,
{
    use tokio::io::AsyncReadExt;

    let encoder = Box::pin(encoder);
    let stream = futures_util::stream::unfold(encoder, |mut enc| async move {
        let mut buf = vec![0u8; 8192];
        match enc.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                let frame: Result<Frame<Bytes>, hyper::Error> = Ok(Frame::data(Bytes::from(buf)));
                Some((frame, enc))
            }
            Err(_) => None,
        }
    });
    BodyExt::boxed(StreamBody::new(stream))
}

/// Adapter that converts a `BoxBody` into a `Stream<Item = io::Result<Bytes>>`
/// suitable for `tokio_util::io::StreamReader`.
struct BodyStream(BoxBody);

impl futures_util::Stream for BodyStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use hyper::body::Body;

        loop {
            match std::pin::Pin::new(&mut self.0).poll_frame(cx) {
                std::task::Poll::Ready(Some(Ok(frame))) => {
                    if let Ok(data) = frame.into_data() {
                        return std::task::Poll::Ready(Some(Ok(data)));
                    }
                    continue;
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    return std::task::Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))));
                }
                std::task::Poll::Ready(None) => return std::task::Poll::Ready(None),
                std::task::Poll::Pending => return std::task::Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate_prefers_brotli() {
        assert_eq!(negotiate_encoding("gzip, br"), Some("br"));
        assert_eq!(negotiate_encoding("gzip;q=1, br;q=0"), Some("gzip"));
        assert_eq!(negotiate_encoding("identity"), None);
    }

    #[test]
    fn test_remove_hop_headers_strips_connection() {
        let mut headers = http::HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        remove_hop_headers(&mut headers);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_inject_forwarded_headers_appends_xff() {
        let mut headers = http::HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        let peer: SocketAddr = "10.0.0.2:1234".parse().unwrap();
        inject_forwarded_headers(&mut headers, peer, "example.com");
        let xff = headers.get("x-forwarded-for").unwrap().to_str().unwrap();
        assert_eq!(xff, "10.0.0.1, 10.0.0.2");
    }
}
