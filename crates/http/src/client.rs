//! HTTP implementation of [`UploadTransport`].
//!
//! Async client using `reqwest` with Bearer token authentication. Every
//! response is decoded as an [`ApiEnvelope`]; failures are classified into
//! transient, protocol and unauthorized errors for the retry policy.

use std::sync::Arc;
use std::time::Duration;

use chunkup_protocol::constants::{
    DEFAULT_BASE_URL, FIELD_CHUNK, FIELD_CHUNK_INDEX, FIELD_FILE, FIELD_FILE_ID, FIELD_MD5,
    PATH_CHUNK, PATH_CHUNK_INIT, PATH_CHUNK_MERGE, PATH_CONFIG, PATH_PROGRESS, PATH_SIMPLE,
};
use chunkup_protocol::{
    ApiEnvelope, ChunkUploadResponse, FileMetadata, InitChunkedRequest, InitChunkedResponse,
    MergeRequest, ServerProgress, UploadConfig,
};
use chunkup_uploader::{
    ChunkPayload, ProgressSender, SimplePayload, TransportError, TransportFuture, UploadTransport,
};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::session::SessionStore;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes handed to the connection per body frame; progress is reported
/// at this granularity.
const STREAM_PIECE: usize = 64 * 1024;

/// Characters escaped in a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.');

/// Errors building the client.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid base URL: {0}")]
    InvalidUrl(String),
}

/// Upload server client.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    session: Arc<dyn SessionStore>,
}

impl HttpTransport {
    /// Creates a client for `base_url` (for example
    /// `http://localhost:9000/api/v1`).
    pub fn new(base_url: &str, session: Arc<dyn SessionStore>) -> Result<Self, HttpError> {
        Self::with_timeout(base_url, session, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a custom per-request timeout.
    pub fn with_timeout(
        base_url: &str,
        session: Arc<dyn SessionStore>,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(HttpError::InvalidUrl(base_url.to_string()));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            session,
        })
    }

    /// Client for [`DEFAULT_BASE_URL`].
    pub fn localhost(session: Arc<dyn SessionStore>) -> Result<Self, HttpError> {
        Self::new(DEFAULT_BASE_URL, session)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends `request` with the session token and decodes the envelope.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, TransportError> {
        let request = match self.session.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let resp = request
            .send()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        self.read_envelope(resp).await
    }

    async fn read_envelope<T: DeserializeOwned>(
        &self,
        resp: Response,
    ) -> Result<T, TransportError> {
        let status = resp.status();
        debug!(url = %resp.url(), status = status.as_u16(), "response received");
        if status == StatusCode::UNAUTHORIZED {
            return Err(self.unauthorized());
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Transient(e.to_string()))?;
        let envelope: ApiEnvelope<T> = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(_) if status.is_server_error() => {
                return Err(TransportError::Transient(format!("HTTP {status}")));
            }
            Err(e) => {
                return Err(TransportError::Protocol {
                    code: i32::from(status.as_u16()),
                    message: format!("malformed response: {e}"),
                });
            }
        };

        match envelope.into_data().map_err(TransportError::from) {
            Err(TransportError::Unauthorized) => Err(self.unauthorized()),
            other => other,
        }
    }

    fn unauthorized(&self) -> TransportError {
        warn!("session rejected by server, clearing token");
        self.session.invalidate();
        TransportError::Unauthorized
    }
}

/// Wraps `data` in a streaming body that reports bytes handed to the
/// connection.
fn progress_body(data: Vec<u8>, progress: ProgressSender) -> reqwest::Body {
    let total = data.len() as u64;
    let stream = futures_util::stream::unfold((data, 0usize), move |(data, offset)| {
        let progress = progress.clone();
        async move {
            if offset >= data.len() {
                return None;
            }
            let end = data.len().min(offset + STREAM_PIECE);
            let piece = data[offset..end].to_vec();
            progress.report(end as u64, total);
            Some((Ok::<_, std::io::Error>(piece), (data, end)))
        }
    });
    reqwest::Body::wrap_stream(stream)
}

fn streamed_part(data: Vec<u8>, progress: ProgressSender) -> Part {
    let len = data.len() as u64;
    Part::stream_with_length(progress_body(data, progress), len)
}

impl UploadTransport for HttpTransport {
    fn fetch_config(&self) -> TransportFuture<'_, UploadConfig> {
        Box::pin(async move { self.send(self.http.get(self.url(PATH_CONFIG))).await })
    }

    fn init_chunked_upload(
        &self,
        request: InitChunkedRequest,
    ) -> TransportFuture<'_, InitChunkedResponse> {
        Box::pin(async move {
            self.send(self.http.post(self.url(PATH_CHUNK_INIT)).json(&request))
                .await
        })
    }

    fn upload_chunk(
        &self,
        chunk: ChunkPayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, ChunkUploadResponse> {
        Box::pin(async move {
            let index = chunk.index;
            let part = streamed_part(chunk.data, progress).file_name(format!("chunk_{index}"));
            let form = Form::new()
                .text(FIELD_FILE_ID, chunk.file_id)
                .text(FIELD_CHUNK_INDEX, index.to_string())
                .text(FIELD_MD5, chunk.digest)
                .part(FIELD_CHUNK, part);
            self.send(self.http.post(self.url(PATH_CHUNK)).multipart(form))
                .await
        })
    }

    fn merge_chunks(&self, file_id: String) -> TransportFuture<'_, FileMetadata> {
        Box::pin(async move {
            let body = MergeRequest { file_id };
            self.send(self.http.post(self.url(PATH_CHUNK_MERGE)).json(&body))
                .await
        })
    }

    fn simple_upload(
        &self,
        file: SimplePayload,
        progress: ProgressSender,
    ) -> TransportFuture<'_, FileMetadata> {
        Box::pin(async move {
            let part = streamed_part(file.data, progress)
                .file_name(file.filename)
                .mime_str(&file.mime_type)
                .map_err(|e| TransportError::Protocol {
                    code: 400,
                    message: format!("invalid MIME type {}: {e}", file.mime_type),
                })?;
            let form = Form::new().part(FIELD_FILE, part);
            self.send(self.http.post(self.url(PATH_SIMPLE)).multipart(form))
                .await
        })
    }

    fn get_progress(&self, file_id: String) -> TransportFuture<'_, ServerProgress> {
        Box::pin(async move {
            let segment = utf8_percent_encode(&file_id, PATH_SEGMENT);
            let url = format!("{}/{segment}", self.url(PATH_PROGRESS));
            self.send(self.http.get(url)).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySession;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    /// Reads one request: headers plus `Content-Length` body bytes.
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
                let length = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if headers.contains("transfer-encoding: chunked") {
                    if buf.ends_with(b"0\r\n\r\n") {
                        break;
                    }
                } else if buf.len() >= header_end + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Starts a mock HTTP server that answers one request with `status`
    /// and `body`, and hands back the raw request it received.
    async fn mock_server(
        status: u16,
        body: &str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = format!("http://127.0.0.1:{port}/api/v1");
        let body = body.to_string();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;

            let resp = format!(
                "HTTP/1.1 {status} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = stream.write_all(resp.as_bytes()).await;
            let _ = stream.shutdown().await;
            request
        });

        (url, handle)
    }

    fn client(url: &str, session: Arc<MemorySession>) -> HttpTransport {
        HttpTransport::new(url, session).unwrap()
    }

    fn session() -> Arc<MemorySession> {
        Arc::new(MemorySession::new(Some("tok-123".into())))
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(matches!(
            HttpTransport::new("ftp://example.com", session()),
            Err(HttpError::InvalidUrl(_))
        ));
        let t = HttpTransport::new("http://example.com/api/v1/", session()).unwrap();
        assert_eq!(t.base_url(), "http://example.com/api/v1");
    }

    #[tokio::test]
    async fn fetch_config_sends_token_and_parses_envelope() {
        let json = r#"{"code":200,"message":"ok","data":{
            "maxFileSize":1048576,"allowedMimeTypes":{"image/png":true},"chunkSize":512}}"#;
        let (url, handle) = mock_server(200, json).await;

        let config = client(&url, session()).fetch_config().await.unwrap();
        assert_eq!(config.chunk_size, 512);
        assert!(config.allows_mime("image/png"));

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/v1/upload/config "));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("authorization: bearer tok-123")
        );
    }

    #[tokio::test]
    async fn no_token_means_no_authorization_header() {
        let json = r#"{"code":200,"message":"ok","data":{"maxFileSize":1,"chunkSize":1}}"#;
        let (url, handle) = mock_server(200, json).await;

        client(&url, Arc::new(MemorySession::new(None)))
            .fetch_config()
            .await
            .unwrap();
        let request = handle.await.unwrap();
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn init_posts_json_body() {
        let json = r#"{"code":200,"message":"ok","data":{
            "fileID":"f-1","chunkSize":4,"chunkTotal":3}}"#;
        let (url, handle) = mock_server(200, json).await;

        let response = client(&url, session())
            .init_chunked_upload(InitChunkedRequest {
                filename: "a.mp4".into(),
                file_size: 10,
                md5_hash: "abc".into(),
                chunk_size: 4,
            })
            .await
            .unwrap();
        assert_eq!(response.file_id, "f-1");
        assert_eq!(response.chunk_total, 3);
        assert!(response.upload_token().is_none());

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /api/v1/upload/chunk/init "));
        assert!(request.contains(r#""md5Hash":"abc""#));
        assert!(request.contains(r#""fileSize":10"#));
    }

    #[tokio::test]
    async fn upload_chunk_sends_multipart_and_reports_bytes() {
        let json = r#"{"code":200,"message":"ok","data":{
            "fileID":"f-1","chunkIndex":2,"chunkUploaded":3,"chunkTotal":5,"isCompleted":false}}"#;
        let (url, handle) = mock_server(200, json).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let ack = client(&url, session())
            .upload_chunk(
                ChunkPayload {
                    file_id: "f-1".into(),
                    index: 2,
                    digest: "d41d".into(),
                    data: b"chunk-bytes".to_vec(),
                },
                ProgressSender::new(tx, Some(2)),
            )
            .await
            .unwrap();
        assert_eq!(ack.chunk_index, 2);
        assert_eq!(ack.chunk_uploaded, 3);

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /api/v1/upload/chunk "));
        for field in ["fileID", "chunkIndex", "md5Hash", "chunk"] {
            assert!(
                request.contains(&format!("name=\"{field}\"")),
                "missing field {field}"
            );
        }
        assert!(request.contains("chunk-bytes"));

        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        let last = last.unwrap();
        assert_eq!(last.chunk_index, Some(2));
        assert_eq!(last.bytes_sent, 11);
        assert_eq!(last.bytes_total, 11);
    }

    #[tokio::test]
    async fn simple_upload_sends_file_part() {
        let json = r#"{"code":200,"message":"ok","data":{
            "fileID":"f-9","filename":"notes.txt","storedName":"x.txt","fileSize":5,
            "mimeType":"text/plain","extension":".txt","md5Hash":"5d41402abc4b2a76b9719d911017c592",
            "filePath":"uploads/x.txt","uploadedAt":"2024-05-01T02:20:30Z"}}"#;
        let (url, handle) = mock_server(200, json).await;

        let meta = client(&url, session())
            .simple_upload(
                SimplePayload {
                    filename: "notes.txt".into(),
                    mime_type: "text/plain".into(),
                    data: b"hello".to_vec(),
                },
                ProgressSender::detached(),
            )
            .await
            .unwrap();
        assert_eq!(meta.file_id, "f-9");
        assert_eq!(meta.extension, ".txt");

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /api/v1/upload/simple "));
        assert!(request.contains(r#"name="file"; filename="notes.txt""#));
        assert!(request.contains("text/plain"));
    }

    #[tokio::test]
    async fn merge_posts_file_id() {
        let json = r#"{"code":200,"message":"ok","data":{
            "fileID":"f-1","filename":"a.mp4","storedName":"y.mp4","fileSize":10,
            "mimeType":"video/mp4","extension":".mp4","md5Hash":"abc",
            "filePath":"uploads/y.mp4","uploadedAt":"2024-05-01T02:20:30Z"}}"#;
        let (url, handle) = mock_server(200, json).await;

        let meta = client(&url, session())
            .merge_chunks("f-1".into())
            .await
            .unwrap();
        assert_eq!(meta.stored_name, "y.mp4");

        let request = handle.await.unwrap();
        assert!(request.starts_with("POST /api/v1/upload/chunk/merge "));
        assert!(request.contains(r#"{"fileID":"f-1"}"#));
    }

    #[tokio::test]
    async fn progress_path_is_escaped() {
        let json = r#"{"code":200,"message":"ok","data":{
            "fileID":"a b","filename":"a.mp4","fileSize":10,"chunkTotal":3,
            "chunkUploaded":1,"progress":33.3,"status":1}}"#;
        let (url, handle) = mock_server(200, json).await;

        let progress = client(&url, session())
            .get_progress("a b".into())
            .await
            .unwrap();
        assert_eq!(progress.chunk_uploaded, 1);

        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/v1/upload/progress/a%20b "));
    }

    #[tokio::test]
    async fn business_failure_is_protocol_error() {
        let (url, handle) = mock_server(200, r#"{"code":400,"message":"chunk index out of range"}"#).await;

        let err = client(&url, session())
            .merge_chunks("f-1".into())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Protocol {
                code: 400,
                message: "chunk index out of range".into()
            }
        );
        handle.abort();
    }

    #[tokio::test]
    async fn server_faults_are_transient() {
        let (url, handle) = mock_server(502, "<html>bad gateway</html>").await;
        let err = client(&url, session()).fetch_config().await.unwrap_err();
        assert!(err.is_retryable());
        handle.abort();

        let (url, handle) = mock_server(500, r#"{"code":500,"message":"disk full"}"#).await;
        let err = client(&url, session()).fetch_config().await.unwrap_err();
        assert!(err.is_retryable());
        handle.abort();
    }

    #[tokio::test]
    async fn malformed_success_body_is_protocol_error() {
        let (url, handle) = mock_server(200, "not json").await;
        let err = client(&url, session()).fetch_config().await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol { code: 200, .. }));
        handle.abort();
    }

    #[tokio::test]
    async fn unauthorized_invalidates_session() {
        let (url, handle) = mock_server(401, r#"{"code":401,"message":"token expired"}"#).await;
        let store = session();

        let err = client(&url, store.clone()).fetch_config().await.unwrap_err();
        assert_eq!(err, TransportError::Unauthorized);
        assert!(!store.is_authenticated());
        handle.abort();
    }

    #[tokio::test]
    async fn envelope_unauthorized_invalidates_session() {
        let (url, handle) = mock_server(200, r#"{"code":401,"message":"login required"}"#).await;
        let store = session();

        let err = client(&url, store.clone()).fetch_config().await.unwrap_err();
        assert_eq!(err, TransportError::Unauthorized);
        assert!(!store.is_authenticated());
        handle.abort();
    }

    #[tokio::test]
    async fn connection_refused_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("http://127.0.0.1:{port}/api/v1");
        let err = client(&url, session()).fetch_config().await.unwrap_err();
        assert!(matches!(err, TransportError::Transient(_)));
    }
}
