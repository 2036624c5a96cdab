use std::path::PathBuf;

use ::tracing::{error, info_span};
use clap::Parser;
use service::Service;

mod config;
mod context;
mod http_objects;
mod routes;
mod service;
mod tracing;
use tracing::setup_tracing;

#[cfg(test)]
mod testing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => config::ServerConfig::from_path(&path.to_string_lossy()),
        None => {
            let config = config::ServerConfig::default();
            config.validate().map(|_| config)
        }
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {:?}", err);
            std::process::exit(1);
        }
    };

    let tracing_provider = match setup_tracing(&config) {
        Ok(provider) => provider,
        Err(err) => {
            eprintln!("error setting up tracing: {:?}", err);
            std::process::exit(1);
        }
    };

    let root_span = info_span!("sparkpilot", listen_addr = config.listen_addr.as_str());
    let _guard = root_span.enter();

    match Service::new(config).await {
        Ok(service) => {
            if let Err(err) = service.start().await {
                error!("Error starting service: {:?}", err);
            }
        }
        Err(err) => error!("Error creating service: {:?}", err),
    }

    // export traces before shutdown
    if let Some(tracer_provider) = tracing_provider {
        if let Err(err) = tracer_provider.force_flush() {
            error!("Error flushing traces: {:?}", err);
        }
        if let Err(err) = tracer_provider.shutdown() {
            error!("Error shutting down tracer provider: {:?}", err);
        }
    }
}
