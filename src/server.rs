//! HTTP front-end: the question page plus a small JSON API, served straight
//! from tokio sockets.

use crate::error::{KyrkError, Result};
use crate::prompt::Variant;
use crate::render::{Rendered, DOWNLOAD_NAME};
use crate::session::{AppSession, Answer};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

const INDEX_HTML: &str = include_str!("../ui/index.html");
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_UPLOAD_NAME: &str = "upload.csv";

pub async fn serve(session: Arc<AppSession>) -> Result<()> {
    let addr = session.config().listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| KyrkError::Http(format!("Failed to bind {}: {}", addr, e)))?;
    info!("Kyrk Q&A listening on http://{}", addr);
    run(listener, session).await
}

/// Accept loop; one task per connection.
pub async fn run(listener: TcpListener, session: Arc<AppSession>) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let request_id = Uuid::new_v4();
        debug!("[{}] New connection from {}", request_id, peer);
        tokio::spawn(handle_connection(stream, Arc::clone(&session), request_id));
    }
}

async fn handle_connection(mut stream: TcpStream, session: Arc<AppSession>, request_id: Uuid) {
    let limit = session.config().max_request_bytes;

    let response = match timeout(READ_TIMEOUT, read_request(&mut stream, limit)).await {
        Err(_) => {
            warn!("[{}] Request read timeout", request_id);
            return;
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
            HttpResponse::json(413, &json!({"status": "error", "error": e.to_string()}))
        }
        Ok(Err(e)) => {
            warn!("[{}] Failed to read from stream: {}", request_id, e);
            return;
        }
        Ok(Ok(raw)) if raw.is_empty() => return,
        Ok(Ok(raw)) => match HttpRequest::parse(&raw) {
            Some(request) => {
                debug!("[{}] {} {}", request_id, request.method, request.path);
                handle_request(&session, &request).await
            }
            None => HttpResponse::json(400, &json!({"status": "error", "error": "Bad Request"})),
        },
    };

    if let Err(e) = stream.write_all(&response.to_bytes()).await {
        warn!("[{}] Failed to write response: {}", request_id, e);
    }
}

/// Read until the headers and the announced body are in.
async fn read_request(stream: &mut TcpStream, limit: usize) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        if let Some(header_end) = find_header_end(&buffer) {
            let expected = content_length(&buffer[..header_end]).unwrap_or(0);
            if expected > limit {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "Request too large"));
            }
            if buffer.len() >= header_end + 4 + expected {
                break;
            }
        }
        if buffer.len() > limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "Request too large"));
        }
    }
    Ok(buffer)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(head: &[u8]) -> Option<usize> {
    let head = std::str::from_utf8(head).ok()?;
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let header_end = find_header_end(raw)?;
        let head = std::str::from_utf8(&raw[..header_end]).ok()?;
        let mut lines = head.lines();

        let mut parts = lines.next()?.split_whitespace();
        let method = parts.next()?.to_string();
        let target = parts.next()?;

        // Query strings are not used by any route
        let path = target.split('?').next().unwrap_or("/");
        let mut path = path.trim_end_matches('/').to_string();
        if path.is_empty() {
            path = "/".to_string();
        }

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let mut body = raw[header_end + 4..].to_vec();
        if let Some(len) = headers.get("content-length").and_then(|v| v.parse::<usize>().ok()) {
            body.truncate(len);
        }

        Some(Self {
            method,
            path,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, content_type: &'static str, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            headers: Vec::new(),
            body,
        }
    }

    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self::new(status, "application/json", body.to_string().into_bytes())
    }

    pub fn html(body: String) -> Self {
        Self::new(200, "text/html; charset=utf-8", body.into_bytes())
    }

    pub fn csv_download(body: String, file_name: &str) -> Self {
        let mut response = Self::new(200, "text/csv; charset=utf-8", body.into_bytes());
        response.headers.push((
            "Content-Disposition".to_string(),
            format!("attachment; filename=\"{}\"", file_name),
        ));
        response
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: {}\r\n\
             Access-Control-Allow-Origin: *\r\n\
             Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
             Access-Control-Allow-Headers: Content-Type, X-Filename\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n",
            self.status,
            status_text(self.status),
            self.content_type,
            self.body.len()
        );
        for (key, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", key, value));
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        413 => "Payload Too Large",
        422 => "Unprocessable Entity",
        _ => "Internal Server Error",
    }
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

pub async fn handle_request(session: &AppSession, request: &HttpRequest) -> HttpResponse {
    match (request.method.as_str(), request.path.as_str()) {
        ("OPTIONS", _) => HttpResponse::new(204, "text/plain", Vec::new()),
        ("GET", "/") => HttpResponse::html(index_page(session.config().variant)),
        ("GET", "/api/health") => {
            HttpResponse::json(200, &json!({"status": "ok", "service": "kyrk-qa"}))
        }
        ("GET", "/api/dataset") => handle_dataset(session).await,
        ("POST", "/api/upload") => handle_upload(session, request).await,
        ("POST", "/api/ask") => handle_ask(session, request, false).await,
        ("POST", "/api/ask.csv") => handle_ask(session, request, true).await,
        ("GET", _) | ("POST", _) => {
            HttpResponse::json(404, &json!({"status": "error", "error": "Not Found"}))
        }
        _ => HttpResponse::json(405, &json!({"status": "error", "error": "Method Not Allowed"})),
    }
}

fn index_page(variant: Variant) -> String {
    INDEX_HTML
        .replace("{{PLACEHOLDER}}", variant.placeholder())
        .replace("{{VARIANT}}", &variant.to_string())
}

async fn handle_dataset(session: &AppSession) -> HttpResponse {
    match session.summary().await {
        Ok(summary) => {
            let mut body = json!({"status": "ready"});
            if let (Some(obj), Ok(serde_json::Value::Object(fields))) =
                (body.as_object_mut(), serde_json::to_value(&summary))
            {
                obj.extend(fields);
            }
            HttpResponse::json(200, &body)
        }
        Err(e) if e.is_startup_fatal() => HttpResponse::json(
            200,
            &json!({"status": "needs_upload", "message": e.to_string()}),
        ),
        Err(e) => HttpResponse::json(500, &json!({"status": "error", "error": e.to_string()})),
    }
}

async fn handle_upload(session: &AppSession, request: &HttpRequest) -> HttpResponse {
    let name = request.header("x-filename").unwrap_or(DEFAULT_UPLOAD_NAME);
    match session.upload(name, request.body.clone()).await {
        Ok(summary) => {
            let mut body = serde_json::to_value(&summary).unwrap_or_else(|_| json!({}));
            body["status"] = json!("ready");
            HttpResponse::json(200, &body)
        }
        Err(e @ KyrkError::DataSourcePresent(_)) => {
            HttpResponse::json(409, &json!({"status": "error", "error": e.to_string()}))
        }
        Err(e) => HttpResponse::json(400, &json!({"status": "error", "error": e.to_string()})),
    }
}

/// `/api/ask` answers with JSON that already carries the CSV the page
/// downloads. `/api/ask.csv` is for scripted clients: it asks the engine
/// again, so its table can differ from an earlier `/api/ask` answer.
async fn handle_ask(session: &AppSession, request: &HttpRequest, as_csv: bool) -> HttpResponse {
    let question = match serde_json::from_slice::<AskRequest>(&request.body) {
        Ok(req) if !req.question.trim().is_empty() => req.question,
        Ok(_) => {
            return HttpResponse::json(
                400,
                &json!({"status": "error", "error": "Question is required"}),
            )
        }
        Err(e) => {
            return HttpResponse::json(
                400,
                &json!({"status": "error", "error": format!("Invalid request body: {}", e)}),
            )
        }
    };

    let answer = match session.ask(&question).await {
        Ok(answer) => answer,
        Err(e) if e.is_startup_fatal() => {
            return HttpResponse::json(
                409,
                &json!({"status": "needs_upload", "message": e.to_string()}),
            )
        }
        Err(e) => {
            return HttpResponse::json(500, &json!({"status": "error", "error": e.to_string()}))
        }
    };

    if !as_csv {
        return match serde_json::to_value(&answer) {
            Ok(body) => HttpResponse::json(200, &body),
            Err(e) => HttpResponse::json(500, &json!({"status": "error", "error": e.to_string()})),
        };
    }

    match answer {
        Answer::Ok {
            rendered: Rendered::Table { csv, .. },
        } => HttpResponse::csv_download(csv, DOWNLOAD_NAME),
        Answer::Ok { .. } => HttpResponse::json(
            422,
            &json!({"status": "error", "error": "The answer is not a table"}),
        ),
        Answer::Error { error } => {
            HttpResponse::json(422, &json!({"status": "error", "error": error}))
        }
    }
}
