//! HTTP content listener
//!
//! Serves whole content items and byte ranges at `/{content_id}/{name}`.
//! Bodies stream from the store in fixed-size chunks, and every chunk that
//! reaches the socket becomes one usage record. A mid-stream read failure
//! terminates the connection rather than padding the body.

use super::{ListenerLifecycle, TransportEvent, UsageSink, STREAM_CHUNK_BYTES};
use crate::config::HttpTransportSettings;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use edgemesh_core::{
    normalize_client_ip, ContentHandle, ContentStore, EdgeMeshError, Result, TransportKind,
    UsageRecord,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

pub struct HttpListener {
    settings: HttpTransportSettings,
    store: Arc<dyn ContentStore>,
    sink: UsageSink,
    lifecycle: ListenerLifecycle,
}

#[derive(Clone)]
struct HttpState {
    store: Arc<dyn ContentStore>,
    sink: UsageSink,
}

impl HttpListener {
    pub fn new(
        settings: HttpTransportSettings,
        store: Arc<dyn ContentStore>,
        sink: UsageSink,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self {
            settings,
            store,
            sink,
            lifecycle: ListenerLifecycle::new(TransportKind::Http, events),
        }
    }

    pub async fn listen(&self) -> Result<()> {
        self.lifecycle.begin_starting()?;

        let addr = format!("{}:{}", self.settings.bind_ip, self.settings.port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.lifecycle.abort_starting();
                return Err(EdgeMeshError::BindFailed { addr, source: e });
            }
        };
        let local_addr = listener.local_addr()?;

        let app = router(HttpState {
            store: self.store.clone(),
            sink: self.sink.clone(),
        });
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            {
                error!(error = %e, "HTTP listener terminated");
            }
        });

        self.lifecycle.mark_listening(local_addr, vec![task]);
        Ok(())
    }

    pub async fn close(&self) -> bool {
        self.lifecycle.close().await
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.lifecycle.local_addr().map(|addr| addr.port())
    }
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/:content_id", get(serve_bare))
        .route("/:content_id/:name", get(serve_named))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn serve_bare(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(content_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    serve(state, peer, content_id, headers).await
}

async fn serve_named(
    State(state): State<HttpState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path((content_id, _name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    serve(state, peer, content_id, headers).await
}

async fn serve(state: HttpState, peer: SocketAddr, content_id: String, headers: HeaderMap) -> Response {
    let handle = match state.store.get(&content_id).await {
        Some(handle) => handle,
        None => {
            return (
                StatusCode::NOT_FOUND,
                format!("Content {content_id} not found"),
            )
                .into_response();
        }
    };

    let total = handle.total_length();
    let range_header = headers.get(RANGE).and_then(|v| v.to_str().ok());
    let range = match range_header {
        Some(raw) => match parse_range(raw, total) {
            Some(range) => Some(range),
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(CONTENT_RANGE, format!("bytes */{total}"))
                    .body(Body::empty())
                    .unwrap_or_else(|_| StatusCode::RANGE_NOT_SATISFIABLE.into_response());
            }
        },
        None => None,
    };

    let (start, end) = range.unwrap_or((0, total.saturating_sub(1)));
    let length = if total == 0 { 0 } else { end - start + 1 };
    let mime = mime_guess::from_path(handle.source_name()).first_or_octet_stream();
    let client_ip = normalize_client_ip(&peer.ip().to_string());

    let body = if length == 0 {
        Body::empty()
    } else {
        Body::from_stream(chunk_stream(
            handle,
            start,
            end,
            content_id.clone(),
            client_ip,
            state.sink,
        ))
    };

    let mut builder = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(CONTENT_TYPE, mime.as_ref())
        .header(CACHE_CONTROL, "no-cache")
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_LENGTH, length);
    if range.is_some() {
        builder = builder.header(CONTENT_RANGE, format!("bytes {start}-{end}/{total}"));
    }

    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Stream `start..=end` in fixed chunks, accounting each chunk as it is
/// handed to the socket. A failed read ends the stream with an error so the
/// client sees a truncated connection, never silent corruption.
fn chunk_stream(
    handle: Arc<dyn ContentHandle>,
    start: u64,
    end: u64,
    content_id: String,
    client_ip: String,
    sink: UsageSink,
) -> impl futures::Stream<Item = std::result::Result<bytes::Bytes, std::io::Error>> {
    futures::stream::unfold(start, move |pos| {
        let handle = handle.clone();
        let content_id = content_id.clone();
        let client_ip = client_ip.clone();
        let sink = sink.clone();
        async move {
            if pos > end {
                return None;
            }
            let chunk_end = (pos + STREAM_CHUNK_BYTES - 1).min(end);
            match handle.read_absolute(pos, chunk_end).await {
                Ok(bytes) => {
                    sink.record(UsageRecord::uploaded(
                        TransportKind::Http,
                        client_ip,
                        content_id,
                        bytes.len() as u64,
                    ));
                    Some((Ok(bytes), chunk_end + 1))
                }
                Err(e) => {
                    warn!(content_id = %content_id, error = %e, "Dropping response, store read failed");
                    Some((
                        Err(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                        end + 1,
                    ))
                }
            }
        }
    })
}

/// Parse a `bytes=start-end` range header against the content length.
/// Returns an inclusive pair, or `None` if the header is malformed or the
/// start lies past the end of the content.
fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let spec = raw.strip_prefix("bytes=")?;
    let (start_raw, end_raw) = spec.split_once('-')?;
    let start: u64 = start_raw.trim().parse().ok()?;
    if start >= total {
        return None;
    }
    let end = match end_raw.trim() {
        "" => total - 1,
        raw => raw.parse::<u64>().ok()?.min(total - 1),
    };
    if end < start {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::UsageAggregator;
    use edgemesh_core::MemoryContentStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=100-199", 1024), Some((100, 199)));
        assert_eq!(parse_range("bytes=100-", 1024), Some((100, 1023)));
        assert_eq!(parse_range("bytes=0-9999", 1024), Some((0, 1023)));
        assert_eq!(parse_range("bytes=2000-", 1024), None);
        assert_eq!(parse_range("bytes=50-20", 1024), None);
        assert_eq!(parse_range("items=1-2", 1024), None);
        assert_eq!(parse_range("garbage", 1024), None);
    }

    fn listener_with(
        content_id: &str,
        bytes: Vec<u8>,
    ) -> (HttpListener, Arc<UsageAggregator>) {
        let store = Arc::new(MemoryContentStore::new());
        store.insert(content_id, "video.mp4", bytes::Bytes::from(bytes));
        let aggregator = Arc::new(UsageAggregator::new());
        let (events, _) = broadcast::channel(64);
        let sink = UsageSink::new(aggregator.clone(), events.clone());
        let settings = HttpTransportSettings {
            enabled: true,
            bind_ip: "127.0.0.1".to_string(),
            port: 0,
        };
        (
            HttpListener::new(settings, store, sink, events),
            aggregator,
        )
    }

    async fn raw_get(port: u16, path: &str, range: Option<&str>) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let range_line = range
            .map(|r| format!("Range: {r}\r\n"))
            .unwrap_or_default();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n{range_line}Connection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).to_string()
    }

    #[tokio::test]
    async fn serves_partial_content_for_range_requests() {
        let (listener, aggregator) = listener_with("abc123", vec![9u8; 1024]);
        listener.listen().await.unwrap();
        let port = listener.bound_port().unwrap();

        let response = raw_get(port, "/abc123/video.mp4", Some("bytes=100-199")).await;
        assert!(response.starts_with("HTTP/1.1 206"));
        assert!(response.contains("content-range: bytes 100-199/1024"));
        assert!(response.contains("content-length: 100"));
        assert!(response.contains("content-type: video/mp4"));
        assert!(response.contains("cache-control: no-cache"));

        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert_eq!(body.len(), 100);

        let flushed = aggregator.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].byte_count, 100);
        assert_eq!(flushed[0].client_ip, "127.0.0.1");

        listener.close().await;
    }

    #[tokio::test]
    async fn serves_whole_content_without_range() {
        let (listener, aggregator) = listener_with("abc123", vec![1u8; 512]);
        listener.listen().await.unwrap();
        let port = listener.bound_port().unwrap();

        let response = raw_get(port, "/abc123/video.mp4", None).await;
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("content-length: 512"));
        assert!(response.contains("accept-ranges: bytes"));

        let flushed = aggregator.flush();
        assert_eq!(flushed[0].byte_count, 512);

        listener.close().await;
    }

    #[tokio::test]
    async fn unknown_content_is_404_with_no_usage() {
        let (listener, aggregator) = listener_with("abc123", vec![1u8; 16]);
        listener.listen().await.unwrap();
        let port = listener.bound_port().unwrap();

        let response = raw_get(port, "/nope/file.bin", None).await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(aggregator.flush().is_empty());

        listener.close().await;
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_416() {
        let (listener, _aggregator) = listener_with("abc123", vec![1u8; 16]);
        listener.listen().await.unwrap();
        let port = listener.bound_port().unwrap();

        let response = raw_get(port, "/abc123/file.bin", Some("bytes=500-")).await;
        assert!(response.starts_with("HTTP/1.1 416"));
        assert!(response.contains("content-range: bytes */16"));

        listener.close().await;
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let (listener, _aggregator) = listener_with("abc123", vec![1u8; 16]);
        listener.listen().await.unwrap();
        assert!(listener.listen().await.is_err());
        listener.close().await;
    }
}
