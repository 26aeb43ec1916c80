//! 策略引擎命令行入口
//!
//! 加载配置、初始化可观测性后分派子命令。

use clap::Parser;
use policy_engine::cli::runner::CheckOptions;
use policy_engine::cli::{Cli, CommandRunner, Commands};
use policy_shared::config::AppConfig;
use policy_shared::observability;
use tracing::warn;

const SERVICE_NAME: &str = "policy-engine";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (config, config_error) = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };

    let mut observability_config = config.observability.clone().with_service_name(SERVICE_NAME);
    if let Some(level) = &cli.log_level {
        observability_config = observability_config.with_log_level(level);
    }
    let _guard = observability::init(&observability_config).await?;

    if let Some(e) = config_error {
        warn!(error = %e, "加载配置失败, 使用默认配置");
    }

    let runner = CommandRunner::new(config);

    match cli.command {
        Commands::Check {
            fixture,
            target,
            principal,
            no_cache,
            debug,
            context,
            session,
        } => {
            runner
                .run_check(CheckOptions {
                    fixture,
                    target,
                    principal,
                    no_cache,
                    debug,
                    context,
                    session,
                })
                .await?;
        }
        Commands::TestRule {
            fixture,
            rule,
            principal,
            context,
            request,
        } => {
            runner
                .run_test_rule(
                    &fixture,
                    rule,
                    principal,
                    context.as_deref(),
                    request.as_deref(),
                )
                .await?;
        }
        Commands::Kinds => runner.run_kinds()?,
        Commands::CacheInfo => runner.run_cache_info().await?,
        Commands::CacheClear => runner.run_cache_clear().await?,
        Commands::Migrate => runner.run_migrate().await?,
    }

    Ok(())
}
