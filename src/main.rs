//! OCR Server
//!
//! HTTP OCR service backed by an elastic pool of resident OCR worker
//! subprocesses. Configuration comes from `~/.ocr-server/config.yaml`
//! (generated on first run) with command-line overrides.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use ocr_server::config::{CliArgs, Config};
use ocr_server::engine::PaddleEngineFactory;
use ocr_server::logging;
use ocr_server::server::Server;

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let mut config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    config.apply_overrides(&cli);

    let _logging_guard = match logging::init(&config.log_dir, &config.log_file) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };

    // A panic anywhere must not leave a half-alive server behind.
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        error!("fatal panic: {}\n{}", info, backtrace);
        std::process::exit(1);
    }));

    for warning in config.validate() {
        warn!("config validation: {}", warning);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.bind_addr(),
        min_processors = config.min_processors,
        max_processors = config.max_processors,
        "starting OCR server"
    );

    let factory = Arc::new(PaddleEngineFactory::new(config.ocr_exe_path.clone()));
    let server = Server::new(config, factory);

    if let Err(e) = server.initialize().await {
        error!(error = %e, "failed to initialize processor pool");
        std::process::exit(1);
    }

    if let Err(e) = server.run().await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
