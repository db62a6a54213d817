use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sawmill::config::Config;
use sawmill::instance::{Instance, RawFilter};

/// One-shot query runner against a configured instance. The HTTP layer that
/// consumes the library in production lives in the hub process; this binary
/// exists for operating and debugging log sources directly.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sawmill=debug")),
        )
        .init();

    let config_path =
        std::env::var("SAWMILL_CONFIG").unwrap_or_else(|_| "./sawmill.toml".to_string());
    let config = Config::load(&config_path)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [instance_name, query] = args.as_slice() else {
        anyhow::bail!("usage: sawmill <instance> <sql>");
    };

    let Some(instance_config) = config
        .instances
        .iter()
        .find(|instance| &instance.name == instance_name)
    else {
        anyhow::bail!("unknown instance {instance_name}");
    };

    let instance = Instance::new(instance_config, Arc::new(RawFilter))?;
    let (rows, columns) = instance.get_raw_query_results(query).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "columns": columns,
            "rows": rows,
        }))?
    );

    Ok(())
}
