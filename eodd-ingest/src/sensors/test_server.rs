//! Local HTTP responder for sensor tests
//!
//! Accepts connections until the test ends and answers each request with
//! whatever the handler returns. Requests are recorded for assertions.

use crate::models::{SceneRecord, SceneState};
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    /// Path and query, as sent
    pub target: String,
    pub authorization: Option<String>,
    pub body: String,
}

pub struct Reply {
    status: u16,
    body: Vec<u8>,
}

impl Reply {
    pub fn json(value: serde_json::Value) -> Self {
        Self {
            status: 200,
            body: value.to_string().into_bytes(),
        }
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

pub struct TestServer {
    base: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl TestServer {
    /// Start serving; `handler` gets the server's base URL and the request
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&str, &Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handler = Arc::new(handler);
        let log = requests.clone();
        let server_base = base.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let handler = handler.clone();
                let log = log.clone();
                let base = server_base.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(socket, |request| {
                        log.lock().unwrap().push(request.clone());
                        handler(&base, request)
                    })
                    .await;
                });
            }
        });

        Self { base, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }
}

/// A claimed scene as the scheduler hands it to `download`
pub fn scene(remote_id: &str, remote_url: Option<String>) -> SceneRecord {
    let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    SceneRecord {
        id: 1,
        sensor_id: "test".into(),
        remote_id: remote_id.into(),
        discovery_time: t,
        acquisition_time: t,
        bbox: None,
        cloud_cover: None,
        remote_url,
        expected_checksum: None,
        expected_size: None,
        metadata: serde_json::json!({}),
        state: SceneState::Downloading,
        local_path: None,
        retry_count: 0,
        last_error: None,
        failed_pass: 0,
        checksum: None,
        size: None,
        claimed_at: Some(t),
        updated_at: t,
    }
}

async fn handle_connection<F>(mut socket: TcpStream, respond: F) -> Option<()>
where
    F: FnOnce(&Request) -> Reply,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();

    let mut content_length = 0usize;
    let mut authorization = None;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.trim().parse().unwrap_or(0),
                "authorization" => authorization = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    let request = Request {
        method,
        target,
        authorization,
        body: String::from_utf8_lossy(&body).to_string(),
    };
    let reply = respond(&request);

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        reply.status,
        reason(reply.status),
        reply.body.len()
    );
    socket.write_all(head.as_bytes()).await.ok()?;
    socket.write_all(&reply.body).await.ok()?;
    socket.shutdown().await.ok()?;
    Some(())
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
