//! HTTP review server command (`stagegate serve`).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use stagegate::config::{StagegateToml, config_dir};
use stagegate::generate::CommandGenerator;
use stagegate::pipeline::Pipeline;
use stagegate::server::{ServerConfig, start_server};

pub async fn cmd_serve(
    project_dir: &Path,
    host: Option<String>,
    port: Option<u16>,
    cors: bool,
) -> Result<()> {
    let mut toml = StagegateToml::load_or_default(&config_dir(project_dir))?;
    toml.apply_env();

    for warning in toml.validate() {
        warn!(%warning, "Configuration warning");
    }

    let generator = CommandGenerator::new(toml.to_generator_config(project_dir));
    info!(
        command = %generator.config().command,
        project_dir = %project_dir.display(),
        "Using generator"
    );

    // One pipeline for the whole process: every request shares its store.
    let pipeline = Arc::new(Pipeline::new(
        toml.to_review_config(),
        toml.to_context_config(),
        Arc::new(generator),
    ));

    let config = ServerConfig {
        host: host.unwrap_or(toml.server.host),
        port: port.unwrap_or(toml.server.port),
        cors,
    };

    start_server(config, pipeline).await
}
