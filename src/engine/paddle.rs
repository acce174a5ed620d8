//! PaddleOCR-style subprocess engine
//!
//! Drives one long-lived OCR worker process over line-delimited JSON:
//! requests carry the image base64-encoded on stdin, responses come back
//! as one JSON object per line on stdout. The process stays resident
//! across requests; the pool decides when to recycle it.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use base64::Engine as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use super::{EngineError, EngineFactory, EngineResult, OcrEngine};

pub struct PaddleEngine {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl PaddleEngine {
    /// Spawn the worker executable with piped stdio.
    pub async fn spawn(exe_path: &str) -> Result<Self, EngineError> {
        let mut child = Command::new(exe_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(EngineError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Protocol("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| EngineError::Protocol("worker stdout unavailable".to_string()))?;

        Ok(Self {
            child,
            stdin,
            stdout,
        })
    }
}

#[async_trait]
impl OcrEngine for PaddleEngine {
    async fn ocr(&mut self, image: &[u8]) -> Result<EngineResult, EngineError> {
        let payload = serde_json::json!({
            "image_base64": base64::engine::general_purpose::STANDARD.encode(image),
        });
        let mut line = payload.to_string();
        line.push('\n');

        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;

        let mut response = String::new();
        let read = self.stdout.read_line(&mut response).await?;
        if read == 0 {
            return Err(EngineError::Closed);
        }

        debug!(response_len = response.len(), "received engine response");
        serde_json::from_str(response.trim())
            .map_err(|e| EngineError::Protocol(format!("unparseable engine response: {}", e)))
    }

    async fn shutdown(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "failed to signal OCR worker process");
        }
        let _ = self.child.wait().await;
    }
}

/// Creates [`PaddleEngine`] instances from the configured executable path.
pub struct PaddleEngineFactory {
    exe_path: String,
}

impl PaddleEngineFactory {
    pub fn new(exe_path: String) -> Self {
        Self { exe_path }
    }
}

#[async_trait]
impl EngineFactory for PaddleEngineFactory {
    async fn create(&self) -> Result<Box<dyn OcrEngine>, EngineError> {
        let started = Instant::now();
        let engine = PaddleEngine::spawn(&self.exe_path).await?;
        info!(
            exe = %self.exe_path,
            startup = ?started.elapsed(),
            "OCR engine created"
        );
        Ok(Box::new(engine))
    }
}
