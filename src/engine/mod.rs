//! OCR engine interface
//!
//! The server consumes a long-lived OCR worker subprocess but does not own
//! its implementation. This module defines the thin seam: an engine accepts
//! image bytes and returns a parsed result, and a factory creates engines.
//! The production implementation lives in [`paddle`]; tests substitute
//! scriptable mocks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod paddle;

pub use paddle::{PaddleEngine, PaddleEngineFactory};

/// Result code signalling a successful recognition.
pub const CODE_SUCCESS: i64 = 100;

/// Parsed engine response.
///
/// A non-success `code` is an application-level failure reported by a live
/// worker; transport failures surface as [`EngineError`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineResult {
    pub code: i64,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EngineResult {
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }
}

/// Transport-level engine failures. These mark the subprocess as suspect
/// and trigger in-place reinitialisation by the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to spawn OCR engine: {0}")]
    Spawn(std::io::Error),

    #[error("engine i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine protocol error: {0}")]
    Protocol(String),

    #[error("engine process closed its output")]
    Closed,
}

/// One resident OCR subprocess.
///
/// `&mut self` on both operations: callers serialise access (the pool wraps
/// every engine in a mutex), and the engine itself needs no interior locks.
#[async_trait]
pub trait OcrEngine: Send {
    /// Run recognition over one image.
    async fn ocr(&mut self, image: &[u8]) -> Result<EngineResult, EngineError>;

    /// Terminate the subprocess and release its handles.
    async fn shutdown(&mut self);
}

/// Creates engines, both at startup and for in-place reinitialisation.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn OcrEngine>, EngineError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_success_follows_code() {
        let ok = EngineResult {
            code: CODE_SUCCESS,
            msg: String::new(),
            data: serde_json::Value::Null,
        };
        assert!(ok.is_success());

        let err = EngineResult {
            code: 101,
            msg: "no text".to_string(),
            data: serde_json::Value::Null,
        };
        assert!(!err.is_success());
    }

    #[test]
    fn result_parses_with_missing_optional_fields() {
        let parsed: EngineResult = serde_json::from_str(r#"{"code":100}"#).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.msg.is_empty());
        assert!(parsed.data.is_null());
    }
}
