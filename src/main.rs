use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use bamshard::{Config, engine, storage::DataSource};

fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let plan = DataSource::open(config.inputs.clone(), config.engine_config()?)
        .map(Arc::new)
        .and_then(|source| engine::plan(&source, &config.intervals));

    let plan = match plan {
        Ok(plan) => plan,
        Err(e) => {
            tracing::error!(error_type = e.error_type(), user_error = e.is_user_error(), "{}", e);
            return Err(e.into());
        }
    };

    tracing::info!("planned {} shards", plan.shards.len());
    let json = if config.pretty {
        serde_json::to_string_pretty(&plan)?
    } else {
        serde_json::to_string(&plan)?
    };
    println!("{}", json);

    Ok(())
}
