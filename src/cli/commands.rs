use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::service::ProxyService;

use super::config::{check_config, check_config_file_permissions, expand_path};
use super::template;

/// Execute CLI commands
pub async fn execute_command(cli: &super::Cli) -> Result<()> {
    use super::Commands;

    match &cli.command {
        Commands::Check { config, format } => {
            let config_path = expand_path(config)?;
            check_config(&config_path, format)?;
        }
        Commands::Template { output } => {
            template::generate_config_template(output.as_deref())?;
        }
        Commands::Run { config } => {
            run_proxy(config).await?;
        }
    }

    Ok(())
}

/// Run the proxy service until Ctrl+C
async fn run_proxy(config: &str) -> Result<()> {
    let config_path = expand_path(config)?;

    // 检查配置文件权限
    check_config_file_permissions(&config_path)?;

    info!("Loading configuration from: {}", config_path);
    let app_config = AppConfig::from_file(&config_path)?;

    ProxyService::new(app_config)?.run().await
}
