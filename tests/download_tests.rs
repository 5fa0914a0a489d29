// HttpDownloader against a local HTTP server
use kegbrew::download::{DownloadError, sha256_hex};
use kegbrew::{Downloader, HttpDownloader};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Range offsets of every request the server saw, in arrival order
type RequestLog = Arc<Mutex<Vec<Option<u64>>>>;

fn range_offset(request: &str) -> Option<u64> {
    request.lines().find_map(|line| {
        let line = line.to_ascii_lowercase();
        line.strip_prefix("range: bytes=")
            .and_then(|range| range.trim().trim_end_matches('-').parse().ok())
    })
}

/// Serve `respond(range offset) -> (status, body)` on an ephemeral port
async fn serve<F>(respond: F) -> (String, RequestLog)
where
    F: Fn(Option<u64>) -> (u16, Vec<u8>) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    let respond = Arc::new(respond);

    let requests = Arc::clone(&log);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let respond = Arc::clone(&respond);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let offset = range_offset(&String::from_utf8_lossy(&request));
                requests.lock().unwrap().push(offset);
                let (status, body) = respond(offset);
                let reason = match status {
                    200 => "OK",
                    206 => "Partial Content",
                    416 => "Range Not Satisfiable",
                    _ => "Error",
                };
                let head = format!(
                    "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status,
                    reason,
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (format!("http://{}/wget-1.24.5.tar.gz", addr), log)
}

fn partial_file(cache: &Path, url: &str) -> PathBuf {
    cache
        .join("partial")
        .join(format!("{}.part", sha256_hex(url.as_bytes())))
}

fn bottle_bytes() -> Vec<u8> {
    (0..=255u8).cycle().take(4096).collect()
}

#[tokio::test]
async fn test_resumes_partial_download_with_range() {
    let dir = TempDir::new().unwrap();
    let body = bottle_bytes();
    let served = body.clone();
    let (url, log) = serve(move |offset| match offset {
        Some(start) => (206, served[start as usize..].to_vec()),
        None => (200, served.clone()),
    })
    .await;

    let partial = partial_file(dir.path(), &url);
    fs::create_dir_all(partial.parent().unwrap()).unwrap();
    fs::write(&partial, &body[..1000]).unwrap();

    let downloader = HttpDownloader::new(dir.path(), 0).unwrap();
    let bytes = downloader.fetch(&url, &sha256_hex(&body)).await.unwrap();

    assert_eq!(bytes, body);
    assert_eq!(*log.lock().unwrap(), vec![Some(1000)]);
    assert!(!partial.exists());
}

#[tokio::test]
async fn test_unsatisfiable_range_restarts_from_scratch() {
    let dir = TempDir::new().unwrap();
    let body = bottle_bytes();
    let served = body.clone();
    let (url, log) = serve(move |offset| match offset {
        Some(_) => (416, Vec::new()),
        None => (200, served.clone()),
    })
    .await;

    let partial = partial_file(dir.path(), &url);
    fs::create_dir_all(partial.parent().unwrap()).unwrap();
    fs::write(&partial, &body).unwrap();

    let downloader = HttpDownloader::new(dir.path(), 1).unwrap();
    let bytes = downloader.fetch(&url, &sha256_hex(&body)).await.unwrap();

    assert_eq!(bytes, body);
    assert_eq!(*log.lock().unwrap(), vec![Some(4096), None]);
}

#[tokio::test]
async fn test_server_errors_retried_a_bounded_number_of_times() {
    let dir = TempDir::new().unwrap();
    let (url, log) = serve(|_| (500, b"unavailable".to_vec())).await;

    let downloader = HttpDownloader::new(dir.path(), 2).unwrap();
    let err = downloader
        .fetch(&url, &sha256_hex(b"anything"))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::Status { status: 500, .. }));
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_checksum_mismatch_reported_after_retries() {
    let dir = TempDir::new().unwrap();
    let (url, log) = serve(|_| (200, b"tampered".to_vec())).await;

    let downloader = HttpDownloader::new(dir.path(), 1).unwrap();
    let err = downloader
        .fetch(&url, &sha256_hex(&bottle_bytes()))
        .await
        .unwrap_err();

    assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
    assert_eq!(*log.lock().unwrap(), vec![None, None]);
    assert!(!partial_file(dir.path(), &url).exists());
}
