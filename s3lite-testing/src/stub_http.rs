//! A scripted HTTP server for exercising the real HTTP stack without a real S3.
//!
//! The server answers each request with the next response in its script, and records what it
//! received so tests can assert on the exact method, path and headers that went over the wire.
//! Every connection serves exactly one request and is then closed.
use crate::Result;
use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, warn};
use url::Url;

/// One scripted answer
#[derive(Clone, Debug)]
pub struct StubResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,

    /// Wait this long before answering
    pub delay: Option<Duration>,

    /// Close the connection without sending anything, after any delay
    pub drop_connection: bool,
}

impl StubResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
            delay: None,
            drop_connection: false,
        }
    }

    /// Hang up instead of responding
    pub fn hang_up() -> Self {
        Self {
            drop_connection: true,
            ..Self::new(0)
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// A request as the server saw it
#[derive(Clone, Debug)]
pub struct RecordedRequest {
    pub method: String,

    /// Path and query, exactly as sent
    pub target: String,

    /// Header names are lowercased
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

#[derive(Default)]
struct StubState {
    script: VecDeque<StubResponse>,
    requests: Vec<RecordedRequest>,
}

pub struct StubServer {
    addr: SocketAddr,
    state: Arc<Mutex<StubState>>,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Start listening on a random localhost port.
    ///
    /// Once the script runs out every request gets a 500 with a plain text body.
    pub async fn start(script: impl IntoIterator<Item = StubResponse>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(Mutex::new(StubState {
            script: script.into_iter().collect(),
            requests: Vec::new(),
        }));

        let task = {
            let state = state.clone();

            tokio::spawn(async move {
                loop {
                    let (stream, peer) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(err = %e, "Stub server accept failed");
                            continue;
                        }
                    };

                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, state).await {
                            debug!(%peer, err = %e, "Stub server connection error");
                        }
                    });
                }
            })
        };

        debug!(%addr, "Stub HTTP server started");

        Ok(Self { addr, state, task })
    }

    /// `http://127.0.0.1:{port}/`
    pub fn endpoint_url(&self) -> Url {
        format!("http://{}/", self.addr).parse().unwrap()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Add a response to the end of the script
    pub fn push_response(&self, response: StubResponse) {
        self.state.lock().unwrap().script.push_back(response);
    }

    /// Every request received so far, in order of arrival
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection(mut stream: TcpStream, state: Arc<Mutex<StubState>>) -> Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            // Client went away without sending a full request
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next().unwrap_or_default().split(' ');
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();

    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect::<HashMap<_, _>>();

    let content_length = headers
        .get("content-length")
        .and_then(|len| len.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    debug!(%method, %target, body_len = body.len(), "Stub server received request");

    let response = {
        let mut state = state.lock().unwrap();
        state.requests.push(RecordedRequest {
            method: method.clone(),
            target,
            headers,
            body,
        });

        state.script.pop_front().unwrap_or_else(|| {
            StubResponse::new(500).with_body("the stub server has no more scripted responses")
        })
    };

    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }

    if response.drop_connection {
        return Ok(());
    }

    let mut out = format!("HTTP/1.1 {} Stub\r\n", response.status);
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("content-length: {}\r\n", response.body.len()));
    out.push_str("connection: close\r\n\r\n");

    stream.write_all(out.as_bytes()).await?;
    if method != "HEAD" {
        stream.write_all(&response.body).await?;
    }
    stream.flush().await?;
    stream.shutdown().await?;

    Ok(())
}
