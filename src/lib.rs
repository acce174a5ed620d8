//! OCR Server Library
//!
//! An HTTP OCR service backed by a pool of resident OCR worker subprocesses.
//! This crate exposes the building blocks so integration tests can compose
//! the server with a mock engine. The server binary is in main.rs.
//!
//! # Modules
//!
//! - `pool`: the worker pool (admission, elastic sizing, health maintenance)
//! - `dispatch`: the intake queue and per-task execution with retry
//! - `engine`: the thin interface to the OCR worker subprocess
//! - `imgproc`: image binarization ahead of OCR
//! - `routes`: the HTTP surface

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod imgproc;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod retry;
pub mod routes;
pub mod server;
pub mod state;
pub mod stats;
