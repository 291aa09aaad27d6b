//! In-process HTTP server that replays scripted responses

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Request as seen by the server
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub body: String,
}

impl RecordedRequest {
    pub fn json_body(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or(serde_json::Value::Null)
    }

    /// `module` from the JSON body or the query string
    pub fn module(&self) -> String {
        if let Some(module) = self.json_body().get("module").and_then(|m| m.as_str()) {
            return module.to_string();
        }
        self.target
            .split_once("module=")
            .map(|(_, module)| module.to_string())
            .unwrap_or_default()
    }
}

/// One step of a scripted response
#[derive(Debug, Clone)]
pub enum Step {
    Write(Vec<u8>),
    Pause(Duration),
}

pub type Script = Vec<Step>;

/// Complete response with a fixed body
pub fn full_response(status: u16, reason: &str, content_type: &str, body: &str) -> Script {
    vec![Step::Write(
        format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            reason,
            content_type,
            body.len(),
            body
        )
        .into_bytes(),
    )]
}

pub fn json_response(status: u16, reason: &str, body: &serde_json::Value) -> Script {
    full_response(status, reason, "application/json", &body.to_string())
}

fn sse_head() -> Step {
    Step::Write(
        b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n"
            .to_vec(),
    )
}

fn http_chunk(data: &[u8]) -> Step {
    let mut framed = format!("{:x}\r\n", data.len()).into_bytes();
    framed.extend_from_slice(data);
    framed.extend_from_slice(b"\r\n");
    Step::Write(framed)
}

/// SSE stream sending each chunk separately, with a short pause between them
pub fn sse_response(chunks: &[&str]) -> Script {
    let mut script = vec![sse_head()];
    for chunk in chunks.iter().filter(|c| !c.is_empty()) {
        script.push(http_chunk(chunk.as_bytes()));
        script.push(Step::Pause(Duration::from_millis(20)));
    }
    script.push(Step::Write(b"0\r\n\r\n".to_vec()));
    script
}

/// SSE stream that sends `chunks` and then stalls for `stall`
pub fn stalled_sse_response(chunks: &[&str], stall: Duration) -> Script {
    let mut script = vec![sse_head()];
    for chunk in chunks {
        script.push(http_chunk(chunk.as_bytes()));
    }
    script.push(Step::Pause(stall));
    script.push(Step::Write(b"0\r\n\r\n".to_vec()));
    script
}

/// SSE stream whose connection closes before the body is complete
pub fn dropped_sse_response(chunks: &[&str]) -> Script {
    let mut script = vec![sse_head()];
    for chunk in chunks {
        script.push(http_chunk(chunk.as_bytes()));
    }
    script.push(Step::Pause(Duration::from_millis(20)));
    script
}

/// `data:` line for a message event
pub fn event(message: &str, sent_at: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({
            "requestId": "ab12cd34",
            "data": {"message": message, "sentAt": sent_at},
        })
    )
}

pub struct FakeServer {
    pub base_url: String,
    requests: mpsc::UnboundedReceiver<RecordedRequest>,
    handle: JoinHandle<()>,
}

impl FakeServer {
    /// Serve every connection with the script chosen by `respond`
    pub async fn start<F>(respond: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Script + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, requests) = mpsc::unbounded_channel();
        let respond = Arc::new(respond);

        let handle = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let tx = tx.clone();
                let respond = respond.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(socket, tx, respond).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            requests,
            handle,
        }
    }

    pub async fn next_request(&mut self) -> RecordedRequest {
        tokio::time::timeout(Duration::from_secs(5), self.requests.recv())
            .await
            .expect("no request arrived")
            .expect("server stopped")
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_connection<F>(
    mut socket: TcpStream,
    tx: mpsc::UnboundedSender<RecordedRequest>,
    respond: Arc<F>,
) -> std::io::Result<()>
where
    F: Fn(&RecordedRequest) -> Script + Send + Sync + 'static,
{
    let request = read_request(&mut socket).await?;
    let script = (*respond)(&request);
    let _ = tx.send(request);

    for step in script {
        match step {
            Step::Write(bytes) => {
                socket.write_all(&bytes).await?;
                socket.flush().await?;
            }
            Step::Pause(duration) => tokio::time::sleep(duration).await,
        }
    }
    socket.shutdown().await
}

async fn read_request(socket: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let body_end = (header_end + content_length).min(buf.len());
    let body = String::from_utf8_lossy(&buf[header_end..body_end]).to_string();

    Ok(RecordedRequest {
        method,
        target,
        body,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
