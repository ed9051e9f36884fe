//! Port workers: one HTTP server per proxy port
//!
//! A port worker binds one mesh listener and runs either an
//! identity-injecting reverse proxy or a permanent-redirect handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{StreamExt, TryStreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, BodyStream, Full, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use url::{Position, Url};
use uuid::Uuid;

use crate::mesh::{MeshEndpoint, MeshListener};
use crate::model::{
    Identity, PortConfig, HEADER_DISPLAY_NAME, HEADER_PROFILE_PIC_URL, HEADER_USERNAME,
};

/// Limit for clients that are slow to send request headers
const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Hop-by-hop headers that must not be forwarded upstream
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

type PortBody = BoxBody<Bytes, std::io::Error>;

/// One port worker, created with its proxy and owned by it for the proxy's
/// lifetime
pub struct PortWorker {
    key: String,
    config: PortConfig,
    access_log: bool,
    client: Option<reqwest::Client>,
    shutdown_tx: watch::Sender<bool>,
}

impl PortWorker {
    /// Build a worker from its port config. No network work happens here.
    pub fn new(key: &str, config: PortConfig, access_log: bool) -> anyhow::Result<Self> {
        let client = if config.is_redirect {
            None
        } else {
            let client = reqwest::Client::builder()
                .danger_accept_invalid_certs(!config.tls_validate)
                .redirect(reqwest::redirect::Policy::none())
                .build()?;
            Some(client)
        };

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            key: key.to_string(),
            config,
            access_log,
            client,
            shutdown_tx,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &PortConfig {
        &self.config
    }

    /// Stop accepting connections and drain in-flight requests
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Serve connections from `listener` until closed. Returns `Ok` on
    /// graceful shutdown; any other exit is an error the owning proxy
    /// reacts to.
    pub async fn serve(
        &self,
        listener: MeshListener,
        endpoint: Arc<dyn MeshEndpoint>,
    ) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A close that raced this subscription won't trigger changed()
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        let graceful = GracefulShutdown::new();

        let ctx = Arc::new(RequestContext {
            port: self.key.clone(),
            config: self.config.clone(),
            client: self.client.clone(),
            access_log: self.access_log,
        });

        info!(port = %self.config, redirect = self.config.is_redirect, "Port worker listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            self.spawn_connection(stream, remote, Arc::clone(&ctx), Arc::clone(&endpoint), &graceful);
                        }
                        Err(e) if is_connection_error(&e) => {
                            // TLS handshake or client-side failure; keep accepting
                            debug!(port = %self.config, error = %e, "Connection setup failed");
                        }
                        Err(e) => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                            error!(port = %self.config, error = %e, "Listener failed");
                            return Err(e.into());
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        // Drop the listener before draining so no new connections land
        drop(listener);
        graceful.shutdown().await;
        info!(port = %self.config, "Port worker terminated");

        Ok(())
    }

    fn spawn_connection(
        &self,
        stream: Box<dyn crate::mesh::MeshStream>,
        remote: SocketAddr,
        ctx: Arc<RequestContext>,
        endpoint: Arc<dyn MeshEndpoint>,
        graceful: &GracefulShutdown,
    ) {
        let io = TokioIo::new(stream);

        let service = service_fn(move |req: Request<Incoming>| {
            let ctx = Arc::clone(&ctx);
            let endpoint = Arc::clone(&endpoint);
            async move { handle_request(req, remote, ctx, endpoint).await }
        });

        let mut builder = AutoBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_HEADER_TIMEOUT)
            .preserve_header_case(true);

        let conn = builder.serve_connection_with_upgrades(io, service);
        let watched = graceful.watch(conn.into_owned());

        tokio::spawn(async move {
            if let Err(e) = watched.await {
                debug!(remote = %remote, error = %e, "Connection error");
            }
        });
    }
}

struct RequestContext {
    port: String,
    config: PortConfig,
    client: Option<reqwest::Client>,
    access_log: bool,
}

async fn handle_request(
    req: Request<Incoming>,
    remote: SocketAddr,
    ctx: Arc<RequestContext>,
    endpoint: Arc<dyn MeshEndpoint>,
) -> Result<Response<PortBody>, hyper::Error> {
    let started = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let request_id = Uuid::new_v4().to_string();

    let response = if ctx.config.is_redirect {
        redirect_response(&ctx.config)
    } else {
        let who = endpoint.whois(remote).await;
        forward_request(req, remote, &ctx, who).await
    };

    if ctx.access_log {
        info!(
            target: "access",
            port = %ctx.port,
            method = %method,
            uri = %uri,
            status = response.status().as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            remote = %remote,
            request_id,
            "request"
        );
    }

    Ok(response)
}

/// Forward one request to the first configured target
async fn forward_request(
    req: Request<Incoming>,
    remote: SocketAddr,
    ctx: &RequestContext,
    who: Identity,
) -> Response<PortBody> {
    let client = match &ctx.client {
        Some(client) => client,
        None => return error_response(StatusCode::INTERNAL_SERVER_ERROR, "no upstream client"),
    };

    let target = match ctx.config.first_target() {
        Some(target) => target,
        None => return error_response(StatusCode::BAD_GATEWAY, "no upstream configured"),
    };

    let upstream_url = build_upstream_url(target, &req);
    let is_tls = ctx.config.proxy_protocol == crate::model::Protocol::Https;
    let headers = build_upstream_headers(req.headers(), remote, is_tls, &who);

    let (parts, body) = req.into_parts();
    let body_stream = BodyStream::new(body)
        .map(|frame| frame.map(|f| f.into_data().unwrap_or_default()));

    let result = client
        .request(parts.method, &upstream_url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body_stream))
        .send()
        .await;

    let upstream = match result {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(url = %upstream_url, error = %e, "Upstream request failed");
            return error_response(StatusCode::BAD_GATEWAY, "upstream unreachable");
        }
    };

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream.headers() {
            if HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }

    let body = BodyExt::boxed(StreamBody::new(
        upstream
            .bytes_stream()
            .map_err(std::io::Error::other)
            .map_ok(Frame::data),
    ));

    builder
        .body(body)
        .unwrap_or_else(|_| error_response(StatusCode::BAD_GATEWAY, "invalid upstream response"))
}

/// Headers for the outbound request: inbound headers minus hop-by-hop, the
/// preserved Host, standard forwarded headers, and the caller's mesh
/// identity when present
fn build_upstream_headers(
    inbound: &HeaderMap,
    remote: SocketAddr,
    is_tls: bool,
    who: &Identity,
) -> HeaderMap {
    let mut headers = HeaderMap::new();

    for (name, value) in inbound {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // The inbound Host is preserved so virtual-hosted upstreams keep working
    if let Some(host) = inbound.get(hyper::header::HOST) {
        headers.insert(hyper::header::HOST, host.clone());
        headers.insert(X_FORWARDED_HOST, host.clone());
    }

    // Append the peer address to any X-Forwarded-For carried on the inbound
    // request
    let forwarded_for = match inbound.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{}, {}", existing, remote.ip()),
        _ => remote.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if !who.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&who.username) {
            headers.insert(HEADER_USERNAME, value);
        }
        if let Ok(value) = HeaderValue::from_str(&who.display_name) {
            headers.insert(HEADER_DISPLAY_NAME, value);
        }
        if let Ok(value) = HeaderValue::from_str(&who.profile_pic_url) {
            headers.insert(HEADER_PROFILE_PIC_URL, value);
        }
    }

    headers
}

/// Target URL for the outbound request: the configured upstream's scheme and
/// authority with the inbound path and query
fn build_upstream_url(target: &Url, req: &Request<Incoming>) -> String {
    let base = &target[..Position::BeforePath];
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{}{}", base, path_and_query)
}

/// Permanent redirect to the first configured target
fn redirect_response(config: &PortConfig) -> Response<PortBody> {
    let location = config
        .first_target()
        .map(|t| t.to_string())
        .unwrap_or_default();

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Moved Permanently"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

fn error_response(status: StatusCode, message: &'static str) -> Response<PortBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(message))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Errors that belong to one client connection rather than the listener
fn is_connection_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::parse_short_port_spec;

    fn identity() -> Identity {
        Identity {
            username: "u@example.com".into(),
            display_name: "U Name".into(),
            profile_pic_url: "https://pic.example.com/u.png".into(),
        }
    }

    #[test]
    fn test_build_upstream_headers_injects_identity() {
        let mut inbound = HeaderMap::new();
        inbound.insert(hyper::header::HOST, HeaderValue::from_static("web"));
        let remote: SocketAddr = "100.64.0.5:51234".parse().unwrap();

        let headers = build_upstream_headers(&inbound, remote, false, &identity());
        assert_eq!(headers.get(HEADER_USERNAME).unwrap(), "u@example.com");
        assert_eq!(headers.get(HEADER_DISPLAY_NAME).unwrap(), "U Name");
        assert_eq!(
            headers.get(HEADER_PROFILE_PIC_URL).unwrap(),
            "https://pic.example.com/u.png"
        );
    }

    #[test]
    fn test_build_upstream_headers_empty_identity() {
        let inbound = HeaderMap::new();
        let remote: SocketAddr = "100.64.0.5:51234".parse().unwrap();

        let headers = build_upstream_headers(&inbound, remote, false, &Identity::default());
        assert!(headers.get(HEADER_USERNAME).is_none());
        assert!(headers.get(HEADER_DISPLAY_NAME).is_none());
        assert!(headers.get(HEADER_PROFILE_PIC_URL).is_none());
    }

    #[test]
    fn test_build_upstream_headers_preserves_host_and_appends_xff() {
        let mut inbound = HeaderMap::new();
        inbound.insert(hyper::header::HOST, HeaderValue::from_static("web"));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        let remote: SocketAddr = "100.64.0.5:51234".parse().unwrap();

        let headers = build_upstream_headers(&inbound, remote, true, &Identity::default());
        assert_eq!(headers.get(hyper::header::HOST).unwrap(), "web");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "web");
        assert_eq!(
            headers.get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.9, 100.64.0.5"
        );
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "https");
        assert!(headers.get("connection").is_none());
    }

    #[test]
    fn test_redirect_response() {
        let mut config = parse_short_port_spec("80/http").unwrap();
        config.is_redirect = true;
        config.targets.push(Url::parse("https://example.com/").unwrap());

        let response = redirect_response(&config);
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_worker_construction() {
        let mut config = parse_short_port_spec("443/https").unwrap();
        config.targets.push(Url::parse("http://10.0.0.1:8080").unwrap());
        let worker = PortWorker::new("443/https", config, true).unwrap();
        assert_eq!(worker.key(), "443/https");
        assert!(worker.client.is_some());

        let mut redirect = parse_short_port_spec("80/http").unwrap();
        redirect.is_redirect = true;
        redirect.targets.push(Url::parse("https://example.com/").unwrap());
        let worker = PortWorker::new("80/http", redirect, false).unwrap();
        assert!(worker.client.is_none());
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(is_connection_error(&std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        )));
        assert!(!is_connection_error(&std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "in use"
        )));
    }
}
