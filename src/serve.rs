//! The HTTP serving path.
//!
//! One handler serves every route: method gate, route resolution against
//! the tree database, encoding negotiation, conditional requests, then
//! streaming the selected blob with range support. Each request gets a
//! time-ordered id and structured request/response logs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, Method, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use ipnet::IpNet;
use tokio::net::TcpListener;
use tracing::{Instrument, info, warn};

mod error;
mod file;
mod realip;
mod resolver;

pub use error::ServeError;
pub use resolver::{Route, RouteError};

use crate::db::TreeDb;
use crate::id::Snowflake;
use crate::store::{BlobStore, StoreError};

use file::RangeOutcome;
use resolver::RouteTable;

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Suffix appended to every request id; distinguishes instances behind
    /// a balancer.
    pub instance: String,
    /// Trusted proxy networks for X-Forwarded-For resolution.
    pub proxies: Vec<IpNet>,
}

/// Connection handling limits, surfaced from configuration. The serve loop
/// applies the graceful-shutdown grace period; the per-connection limits
/// are carried for the process supervisor wiring the listener.
#[derive(Debug, Clone)]
pub struct ServeOpts {
    pub read_timeout: Duration,
    pub read_header_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_header_bytes: usize,
    pub graceful_shutdown: Duration,
}

impl Default for ServeOpts {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            read_header_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(5),
            max_header_bytes: 1 << 20,
            graceful_shutdown: Duration::from_secs(5),
        }
    }
}

struct ServerState<S, D> {
    store: S,
    db: D,
    routes: RouteTable,
    proxies: Vec<IpNet>,
    instance: String,
    ids: Snowflake,
}

/// The static file server over a blob store and a tree database.
pub struct Server<S, D> {
    state: Arc<ServerState<S, D>>,
}

impl<S, D> Clone for Server<S, D> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: BlobStore, D: TreeDb> Server<S, D> {
    pub fn new(
        store: S,
        db: D,
        routes: Vec<Route>,
        config: ServerConfig,
    ) -> Result<Self, RouteError> {
        for route in &routes {
            info!(
                prefix = %route.prefix,
                path = %route.path,
                dir = route.dir,
                "mounting route"
            );
        }
        Ok(Self {
            state: Arc::new(ServerState {
                store,
                db,
                routes: RouteTable::new(routes)?,
                proxies: config.proxies,
                instance: config.instance,
                ids: Snowflake::new(),
            }),
        })
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle::<S, D>)
            .with_state(Arc::clone(&self.state))
    }

    /// Run the server until `shutdown` resolves, then drain in-flight
    /// requests for at most the configured grace period.
    pub async fn serve<F>(
        &self,
        listener: TcpListener,
        opts: ServeOpts,
        shutdown: F,
    ) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "http server listening");
        }
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let (notify_tx, notify_rx) = tokio::sync::oneshot::channel::<()>();
        let graceful = axum::serve(listener, app).with_graceful_shutdown(async move {
            shutdown.await;
            let _ = notify_tx.send(());
        });

        tokio::select! {
            res = graceful => res,
            _ = async {
                let _ = notify_rx.await;
                tokio::time::sleep(opts.graceful_shutdown).await;
            } => {
                warn!("graceful shutdown period expired, aborting in-flight requests");
                Ok(())
            }
        }
    }
}

async fn handle<S: BlobStore, D: TreeDb>(
    State(state): State<Arc<ServerState<S, D>>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let reqid = state.ids.next_request_id(&state.instance);
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let realip = realip::real_ip(peer, forwarded, &state.proxies);

    let span = tracing::info_span!(
        "http",
        lreqid = %reqid,
        method = %req.method(),
        path = %req.uri().path(),
        remote = %peer,
        realip = %realip,
    );
    async move {
        info!("http request");
        let start = Instant::now();
        let res = respond(&state, req)
            .await
            .unwrap_or_else(|e| e.into_response());
        info!(
            status = res.status().as_u16(),
            latency_us = start.elapsed().as_micros() as u64,
            "http response"
        );
        res
    }
    .instrument(span)
    .await
}

async fn respond<S: BlobStore, D: TreeDb>(
    state: &ServerState<S, D>,
    req: Request<Body>,
) -> Result<Response, ServeError> {
    let head_only = if req.method() == Method::GET {
        false
    } else if req.method() == Method::HEAD {
        true
    } else {
        return Ok(error::status_response(StatusCode::METHOD_NOT_ALLOWED));
    };

    let Some((matched, storage_path)) = state.routes.resolve(req.uri().path()) else {
        return Err(ServeError::NotFound);
    };
    let route = &matched.route;

    let record = state.db.get(&storage_path)?;

    let accept = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let (hash, encoding) = resolver::negotiate_encoding(&record, accept, &route.encodings);
    let content_type = resolver::content_type(&record, &storage_path, route);

    let (reader, meta, hash, encoding) = match state.store.open(hash).await {
        Ok((reader, meta)) => (reader, meta, hash, encoding),
        Err(StoreError::NotFound) if encoding.is_some() => {
            // a vanished alternate is recoverable: serve the primary
            warn!(blob = %hash, "encoded blob missing, falling back to primary");
            let (reader, meta) = state.store.open(&record.hash).await?;
            (reader, meta, &record.hash, None)
        }
        Err(e) => return Err(e.into()),
    };

    let strong = resolver::strong_etag(hash);
    let weak = resolver::weak_etag(&meta);

    if let Some(inm) = req
        .headers()
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        && resolver::if_none_match(inm, &strong, &weak)
    {
        // RFC 7232 §4.1: same Cache-Control, ETag, and Vary as a 200,
        // content headers omitted
        let mut res = Response::new(Body::empty());
        *res.status_mut() = StatusCode::NOT_MODIFIED;
        let headers = res.headers_mut();
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        if !route.cache_control.is_empty() {
            headers.insert(header::CACHE_CONTROL, header_value(&route.cache_control)?);
        }
        headers.insert(header::ETAG, header_value(&strong)?);
        return Ok(res);
    }

    let range = match req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
    {
        Some(r) => file::parse_range(r, meta.size),
        None => RangeOutcome::Full,
    };

    if matches!(range, RangeOutcome::Unsatisfiable) {
        let mut res = error::status_response(StatusCode::RANGE_NOT_SATISFIABLE);
        res.headers_mut().insert(
            header::CONTENT_RANGE,
            header_value(&format!("bytes */{}", meta.size))?,
        );
        return Ok(res);
    }

    let (status, start, len) = match range {
        RangeOutcome::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end - start),
        _ => (StatusCode::OK, 0, meta.size),
    };

    let mut res = Response::new(Body::empty());
    *res.status_mut() = status;
    {
        let headers = res.headers_mut();
        headers.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        if !route.cache_control.is_empty() {
            headers.insert(header::CACHE_CONTROL, header_value(&route.cache_control)?);
        }
        headers.insert(header::ETAG, header_value(&strong)?);
        if let Some(encoding) = encoding {
            headers.insert(header::CONTENT_ENCODING, header_value(encoding)?);
        }
        headers.insert(header::CONTENT_TYPE, header_value(&content_type)?);
        headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(
            header::LAST_MODIFIED,
            header_value(&httpdate::fmt_http_date(meta.modified))?,
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        if status == StatusCode::PARTIAL_CONTENT {
            headers.insert(
                header::CONTENT_RANGE,
                header_value(&format!("bytes {}-{}/{}", start, start + len - 1, meta.size))?,
            );
        }
    }

    if !head_only {
        *res.body_mut() = file::body_from(reader, start, len).await?;
    }
    Ok(res)
}

fn header_value(s: &str) -> Result<HeaderValue, ServeError> {
    HeaderValue::from_str(s)
        .map_err(|e| ServeError::Io(std::io::Error::other(format!("invalid header value: {e}"))))
}
