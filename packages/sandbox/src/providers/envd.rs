// ABOUTME: Client for the in-sandbox daemon that serves processes and files
// ABOUTME: Speaks Connect server-streaming JSON for processes and multipart HTTP for files

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use super::{ExecResult, OutputChunk, ProviderError, Result, StreamType};

const SANDBOX_USER: &str = "user";
const WORKDIR: &str = "/home/user";
const CONNECT_CONTENT_TYPE: &str = "application/connect+json";
const FLAG_END_STREAM: u8 = 0x02;
const ENVELOPE_HEADER_LEN: usize = 5;

/// One decoded Connect envelope
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

/// Wrap a JSON message in a Connect envelope: flags byte, big-endian length, payload
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ENVELOPE_HEADER_LEN + payload.len());
    buf.push(0);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Drain every complete envelope from the front of `buf`, leaving a partial tail
pub fn drain_frames(buf: &mut Vec<u8>) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= ENVELOPE_HEADER_LEN {
        let flags = buf[offset];
        let len_bytes = [
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
            buf[offset + 4],
        ];
        let len = u32::from_be_bytes(len_bytes) as usize;
        let start = offset + ENVELOPE_HEADER_LEN;
        if buf.len() - start < len {
            break;
        }
        frames.push(Frame {
            flags,
            payload: buf[start..start + len].to_vec(),
        });
        offset = start + len;
    }

    buf.drain(..offset);
    frames
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    event: Option<ProcessEvent>,
}

#[derive(Debug, Deserialize)]
struct ProcessEvent {
    data: Option<DataEvent>,
    end: Option<EndEvent>,
}

#[derive(Debug, Deserialize)]
struct DataEvent {
    stdout: Option<String>,
    stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndEvent {
    #[serde(default)]
    exit_code: i64,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndStream {
    error: Option<ConnectError>,
}

#[derive(Debug, Deserialize)]
struct ConnectError {
    code: String,
    message: Option<String>,
}

/// Process and filesystem client bound to one sandbox daemon
#[derive(Debug, Clone)]
pub struct EnvdClient {
    http: Client,
    base_url: String,
    access_token: Option<String>,
}

impl EnvdClient {
    pub fn new(http: Client, base_url: String, access_token: Option<String>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let basic = BASE64.encode(format!("{}:", SANDBOX_USER));
        let request = request.header("Authorization", format!("Basic {}", basic));
        match &self.access_token {
            Some(token) => request.header("X-Access-Token", token),
            None => request,
        }
    }

    /// Run `command` under bash, forwarding output chunks until the process ends
    pub async fn run(
        &self,
        command: &str,
        output: UnboundedSender<OutputChunk>,
    ) -> Result<ExecResult> {
        let body = json!({
            "process": {
                "cmd": "/bin/bash",
                "args": ["-l", "-c", command],
                "envs": {},
                "cwd": WORKDIR,
            }
        });
        let payload = serde_json::to_vec(&body)
            .map_err(|e| ProviderError::InternalError(e.to_string()))?;

        let url = format!("{}/process.Process/Start", self.base_url);
        debug!("Starting process via {}", url);

        let resp = self
            .authorize(self.http.post(&url))
            .header("Content-Type", CONNECT_CONTENT_TYPE)
            .header("Connect-Protocol-Version", "1")
            .body(encode_frame(&payload))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::ProcessError(format!(
                "process start failed ({}): {}",
                status, text
            )));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = Vec::new();
        let mut result: Option<ExecResult> = None;

        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);

            for frame in drain_frames(&mut buf) {
                if frame.is_end_stream() {
                    if let Ok(end) = serde_json::from_slice::<EndStream>(&frame.payload) {
                        if let Some(err) = end.error {
                            return Err(ProviderError::ProcessError(format!(
                                "{}: {}",
                                err.code,
                                err.message.unwrap_or_default()
                            )));
                        }
                    }
                    continue;
                }

                let message: StartResponse = match serde_json::from_slice(&frame.payload) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Skipping undecodable process event: {}", e);
                        continue;
                    }
                };
                let Some(event) = message.event else { continue };

                if let Some(data) = event.data {
                    forward(&output, StreamType::Stdout, data.stdout);
                    forward(&output, StreamType::Stderr, data.stderr);
                }
                if let Some(end) = event.end {
                    result = Some(ExecResult {
                        exit_code: end.exit_code,
                        error: end.error,
                    });
                }
            }
        }

        result.ok_or_else(|| {
            ProviderError::ProcessError("process stream ended without an end event".to_string())
        })
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let url = format!("{}/files", self.base_url);
        let part = Part::bytes(content.as_bytes().to_vec()).file_name(path.to_string());
        let form = Form::new().part("file", part);

        let resp = self
            .authorize(self.http.post(&url))
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .multipart(form)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::FileError(format!(
                "write {} failed ({}): {}",
                path, status, text
            )));
        }
        Ok(())
    }

    pub async fn read_file(&self, path: &str) -> Result<String> {
        let url = format!("{}/files", self.base_url);

        let resp = self
            .authorize(self.http.get(&url))
            .query(&[("path", path), ("username", SANDBOX_USER)])
            .send()
            .await?;

        match resp.status() {
            status if status.is_success() => Ok(resp.text().await?),
            StatusCode::NOT_FOUND => Err(ProviderError::FileError(format!(
                "file not found: {}",
                path
            ))),
            status => {
                let text = resp.text().await.unwrap_or_default();
                Err(ProviderError::FileError(format!(
                    "read {} failed ({}): {}",
                    path, status, text
                )))
            }
        }
    }
}

fn forward(output: &UnboundedSender<OutputChunk>, stream: StreamType, data: Option<String>) {
    let Some(encoded) = data else { return };
    match BASE64.decode(encoded.as_bytes()) {
        Ok(bytes) => {
            // Receiver may have gone away; output is then simply dropped
            let _ = output.send(OutputChunk::new(stream, bytes));
        }
        Err(e) => warn!("Dropping undecodable {:?} chunk: {}", stream, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_frames_keeps_partial_tail() {
        let mut buf = encode_frame(br#"{"a":1}"#);
        let second = encode_frame(br#"{"b":2}"#);
        buf.extend_from_slice(&second[..4]);

        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, br#"{"a":1}"#.to_vec());
        assert_eq!(buf, second[..4].to_vec());

        buf.extend_from_slice(&second[4..]);
        let frames = drain_frames(&mut buf);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, br#"{"b":2}"#.to_vec());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_end_stream_flag() {
        let mut raw = vec![FLAG_END_STREAM, 0, 0, 0, 2];
        raw.extend_from_slice(b"{}");

        let frames = drain_frames(&mut raw);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_end_stream());
    }
}
