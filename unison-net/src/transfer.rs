//! Track distribution over plain LAN HTTP.
//!
//! The host serves its source file at `/tracks/{id}`; clients download to
//! their cache and verify the announced content digest before reporting
//! ready. Hashing runs on the blocking pool so a large file never stalls
//! the engine loop.

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use unison_sync::ReadyErrorCode;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
    #[error("server returned status {0}")]
    Http4xx(u16),
    #[error("download timed out")]
    Timeout,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Wire error code for `client_ready_error`.
    pub fn error_code(&self) -> ReadyErrorCode {
        match self {
            TransferError::DownloadFailed(_) => ReadyErrorCode::DownloadFailed,
            TransferError::HashMismatch { .. } => ReadyErrorCode::HashMismatch,
            TransferError::Http4xx(_) => ReadyErrorCode::Http4xx,
            TransferError::Timeout => ReadyErrorCode::Timeout,
            TransferError::Io(_) => ReadyErrorCode::Unknown,
        }
    }
}

/// Serves one track file until dropped.
pub struct TrackServer {
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl TrackServer {
    pub async fn serve(
        addr: &str,
        track_id: &str,
        file_path: &Path,
    ) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let route = Arc::new((format!("/tracks/{track_id}"), file_path.to_owned()));

        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        log::error!("track server accept failed: {err}");
                        break;
                    }
                };
                let route = Arc::clone(&route);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| serve_track(req, Arc::clone(&route)));
                    if let Err(err) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await
                    {
                        log::debug!("track connection ended: {err}");
                    }
                });
            }
        });

        Ok(Self { local_addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Download URL as announced to peers.
    pub fn url_for(&self, host_ip: &str, track_id: &str) -> String {
        format!("http://{host_ip}:{}/tracks/{track_id}", self.local_addr.port())
    }
}

impl Drop for TrackServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_track(
    req: Request<Incoming>,
    route: Arc<(String, PathBuf)>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let (path, file) = (&route.0, &route.1);
    if req.method() != Method::GET || req.uri().path() != path {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .expect("static response"));
    }
    match tokio::fs::read(file).await {
        Ok(data) => Ok(Response::new(Full::new(Bytes::from(data)))),
        Err(err) => {
            log::error!("serving {} failed: {err}", file.display());
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Full::new(Bytes::new()))
                .expect("static response"))
        }
    }
}

/// Download a track to `dest_path` and verify its digest.
pub async fn download_track(
    url: &str,
    dest_path: &Path,
    expected_hash: &str,
    timeout: Duration,
) -> Result<PathBuf, TransferError> {
    let uri: hyper::Uri = url
        .parse()
        .map_err(|_| TransferError::DownloadFailed(format!("bad url {url}")))?;
    let client: Client<_, Empty<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Empty::new())
        .map_err(|err| TransferError::DownloadFailed(err.to_string()))?;

    let response = tokio::time::timeout(timeout, client.request(request))
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(|err| TransferError::DownloadFailed(err.to_string()))?;

    let status = response.status();
    if status.is_client_error() {
        return Err(TransferError::Http4xx(status.as_u16()));
    }
    if !status.is_success() {
        return Err(TransferError::DownloadFailed(format!("status {status}")));
    }

    let body = tokio::time::timeout(timeout, response.into_body().collect())
        .await
        .map_err(|_| TransferError::Timeout)?
        .map_err(|err| TransferError::DownloadFailed(err.to_string()))?
        .to_bytes();

    let actual = {
        let body = body.clone();
        tokio::task::spawn_blocking(move || hash_bytes(&body))
            .await
            .map_err(|err| TransferError::DownloadFailed(err.to_string()))?
    };
    if actual != expected_hash {
        return Err(TransferError::HashMismatch {
            expected: expected_hash.to_owned(),
            actual,
        });
    }

    tokio::fs::write(dest_path, &body).await?;
    Ok(dest_path.to_owned())
}

/// SHA-256 of a byte slice, lowercase hex.
pub fn hash_bytes(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// SHA-256 of a file, streamed on the blocking pool.
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect())
    })
    .await
    .expect("hash task never panics")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("unison-{}-{name}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn sha256_matches_known_vector() {
        assert_eq!(
            hash_bytes(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn error_codes_map_to_wire_values() {
        assert_eq!(
            TransferError::DownloadFailed("x".into()).error_code(),
            ReadyErrorCode::DownloadFailed
        );
        assert_eq!(
            TransferError::HashMismatch {
                expected: "a".into(),
                actual: "b".into()
            }
            .error_code(),
            ReadyErrorCode::HashMismatch
        );
        assert_eq!(
            TransferError::Http4xx(404).error_code(),
            ReadyErrorCode::Http4xx
        );
        assert_eq!(TransferError::Timeout.error_code(), ReadyErrorCode::Timeout);
    }

    #[tokio::test]
    async fn serve_and_download_verifies_the_digest() {
        let contents = b"not actually an mp3, but it hashes fine";
        let source = temp_file("src.mp3", contents);
        let expected = hash_file(&source).await.unwrap();

        let server = TrackServer::serve("127.0.0.1:0", "t1", &source)
            .await
            .unwrap();
        let url = server.url_for("127.0.0.1", "t1");

        let dest = std::env::temp_dir().join(format!("unison-{}-dl.mp3", std::process::id()));
        let out = download_track(&url, &dest, &expected, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(std::fs::read(out).unwrap(), contents);

        // A wrong digest is rejected before the file is reported ready.
        let err = download_track(&url, &dest, "deadbeef", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { .. }));

        // An unknown track id maps to the 4xx error code.
        let bad_url = server.url_for("127.0.0.1", "nope");
        let err = download_track(&bad_url, &dest, &expected, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ReadyErrorCode::Http4xx);

        let _ = std::fs::remove_file(source);
        let _ = std::fs::remove_file(dest);
    }
}
