// Canopy Directory Service
// ------------------------
// Boots the entry repository: connects the Postgres pool, ensures the
// `entry` table and the super-root sentinel exist, warms the in-memory
// index from the full table, and starts the `entry_update` notification
// listener. The LDAP front end (wire codec, accept loop, request handlers)
// runs as a separate layer and drives the repository through its public
// operations; this binary owns the shared process-wide state and the
// metrics endpoint.
use canopy_directory::repo::Repository;
use canopy_directory::{config, observability};
use canopy_schema::SchemaRegistry;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let metrics_handle = observability::init_observability();

    let config = config::DirectoryConfig::from_env_or_yaml()?;
    let schema_config = config.schema.to_schema_config()?;
    let schema = SchemaRegistry::new(schema_config)
        .map_err(|err| anyhow::anyhow!("invalid schema configuration: {err}"))?;
    let schema = Arc::new(schema);

    let repo = Repository::connect(config.repository.clone(), schema.clone()).await?;
    tracing::info!(
        server_id = repo.server_id(),
        suffix = %schema.suffix_dn.dn_norm_str(),
        "entry repository ready"
    );

    tokio::spawn(observability::serve_metrics(
        metrics_handle,
        config.metrics_bind,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
