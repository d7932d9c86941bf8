//! Runs the proxy from a YAML config file.
//!
//! Run with:
//!   cargo run --example serve -- demos/wiretap.yaml
//!
//! Try (with something listening on the configured upstream):
//!   curl http://localhost:8080/orders/42
//!   curl -X POST http://localhost:8080/orders \
//!        -H 'content-type: application/json' \
//!        -d '{"item":"book","card":"4111111111111111"}'

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use wiretap::ProxyConfig;

#[tokio::main]
async fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| "demos/wiretap.yaml".to_owned());
    let config = ProxyConfig::from_path(&path).expect("cannot load config");

    // RUST_LOG wins over the file's logLevel.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));
    let writer = match &config.logging.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .expect("cannot open log file");
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };
    tracing_subscriber::fmt()
        .json()
        .with_writer(writer)
        .with_env_filter(filter)
        .init();

    let router = config.build_router().expect("invalid tap configuration");

    config
        .server()
        .expect("invalid listen address")
        .serve(router)
        .await
        .expect("server error");
}
