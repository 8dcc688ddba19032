//! Minimal client for the hypervisor's HTTP API socket.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Budget for one API round trip.
pub const API_TIMEOUT: Duration = Duration::from_secs(2);

/// Send `PUT <path>` with a JSON body and require a 2xx status line.
pub async fn put(socket: &Path, path: &str, body: &serde_json::Value) -> Result<()> {
    let body = body.to_string();
    let request = format!(
        "PUT {} HTTP/1.1\r\nHost: localhost\r\nAccept: application/json\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );

    let exchange = async {
        let mut stream = UnixStream::connect(socket).await?;
        stream.write_all(request.as_bytes()).await?;
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    };

    let status_line = timeout(API_TIMEOUT, exchange)
        .await
        .map_err(|_| Error::process("api", format!("PUT {}: timed out", path)))?
        .map_err(|e| Error::process("api", format!("PUT {} via {}: {}", path, socket.display(), e)))?;

    match status_code(&status_line) {
        Some(code) if (200..300).contains(&code) => Ok(()),
        _ => Err(Error::process(
            "api",
            format!("PUT {}: unexpected response {:?}", path, status_line.trim_end()),
        )),
    }
}

/// Ask the guest to shut down via an emulated Ctrl+Alt+Del.
pub async fn send_ctrl_alt_del(socket: &Path) -> Result<()> {
    put(
        socket,
        "/actions",
        &serde_json::json!({ "action_type": "SendCtrlAltDel" }),
    )
    .await
}

fn status_code(status_line: &str) -> Option<u16> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixListener;

    async fn serve_once(listener: UnixListener, response: &'static str) -> String {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(response.as_bytes()).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn test_status_code() {
        assert_eq!(status_code("HTTP/1.1 204 No Content\r\n"), Some(204));
        assert_eq!(status_code("HTTP/1.1 400 Bad Request"), Some(400));
        assert_eq!(status_code("garbage"), None);
        assert_eq!(status_code(""), None);
    }

    #[tokio::test]
    async fn test_ctrl_alt_del_request() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let server = tokio::spawn(serve_once(listener, "HTTP/1.1 204 No Content\r\n\r\n"));

        send_ctrl_alt_del(&socket).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("PUT /actions HTTP/1.1\r\n"));
        assert!(request.ends_with(r#"{"action_type":"SendCtrlAltDel"}"#));
    }

    #[tokio::test]
    async fn test_error_status_rejected() {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("api.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(serve_once(
            listener,
            "HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n",
        ));

        let err = send_ctrl_alt_del(&socket).await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let dir = TempDir::new().unwrap();
        let err = send_ctrl_alt_del(&dir.path().join("gone")).await.unwrap_err();
        assert!(matches!(err, Error::Process { .. }));
    }
}
