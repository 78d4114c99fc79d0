//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand: store connection, job dispatch, the
//! repeat schedule and the offline partition preview.

use anyhow::{Context, Result};
use crowdmap::config::Config;
use crowdmap::create::ProjectCreator;
use crowdmap::db::{Database, RelationalStore};
use crowdmap::delete::DeletionCoordinator;
use crowdmap::geometry::aoi::Aoi;
use crowdmap::geometry::geojson::polygon_to_geojson;
use crowdmap::geometry::grid::GridPartitioner;
use crowdmap::geometry::Partitioner;
use crowdmap::live::firebase::FirebaseLiveStore;
use crowdmap::live::LiveStore;
use crowdmap::sync::SyncPipeline;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};

use super::{Cli, Commands};

// ── Store Connections ───────────────────────────────────────────

struct Stores {
    database: Database,
    db: Arc<dyn RelationalStore>,
    live: Arc<dyn LiveStore>,
}

async fn connect(config: &Config) -> Result<Stores> {
    let database = Database::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to the relational store")?;
    let live = FirebaseLiveStore::new(
        &config.live_store_url,
        &config.live_store_root,
        config.live_store_auth_token.clone(),
        config.live_store_timeout,
    )
    .context("building the live-store client")?;
    Ok(Stores {
        db: Arc::new(database.clone()),
        database,
        live: Arc::new(live),
    })
}

fn ids_or_all(ids: &[String]) -> Option<&[String]> {
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

// ── Job Dispatch ────────────────────────────────────────────────

/// Load configuration, connect, and run the selected job once or on the
/// repeat schedule.
pub async fn run_job(cli: &Cli) -> Result<()> {
    let config = Config::load(cli.environment, cli.config.as_deref())?;
    info!(environment = %config.environment, live_store = %config.live_store_url, "crowdmap starting");
    let stores = connect(&config).await?;

    let Some(schedule) = cli.schedule else {
        return run_once(cli, &config, &stores).await;
    };

    let interval = schedule.interval();
    info!(interval_secs = interval.as_secs(), "running on schedule");
    loop {
        let started = std::time::Instant::now();
        if let Err(e) = run_once(cli, &config, &stores).await {
            error!(error = %e, "scheduled run failed");
        }
        let wait = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping schedule");
                return Ok(());
            }
        }
    }
}

async fn run_once(cli: &Cli, config: &Config, stores: &Stores) -> Result<()> {
    match &cli.command {
        Commands::CreateProjects { project_ids } => {
            let creator = ProjectCreator::new(
                Arc::clone(&stores.db),
                Arc::clone(&stores.live),
                config.tileserver_keys.clone(),
            );
            let report = creator.create_projects(ids_or_all(project_ids)).await?;
            for failure in &report.failed {
                warn!(project_id = %failure.id, kind = %failure.kind, "{}", failure.message);
            }
            Ok(())
        }
        Commands::Synchronize {
            project_ids,
            workers,
            skip_user_data,
            skip_project_data,
        } => {
            let pipeline = SyncPipeline::new(Arc::clone(&stores.db), Arc::clone(&stores.live))
                .with_workers(workers.unwrap_or(config.sync_workers));
            let ids = ids_or_all(project_ids);
            pipeline
                .transfer_results(ids)
                .instrument(info_span!("synchronize"))
                .await?;
            if !skip_user_data {
                pipeline.update_user_data().await?;
            }
            if !skip_project_data {
                pipeline.update_project_data(ids).await?;
            }
            Ok(())
        }
        Commands::Delete { project_ids } => {
            let coordinator = DeletionCoordinator::new(Arc::clone(&stores.db), Arc::clone(&stores.live));
            let report = coordinator.delete_projects(project_ids).await;
            info!(deleted = report.done.len(), failed = report.failed.len(), "delete finished");
            Ok(())
        }
        Commands::Archive { project_ids } => {
            let coordinator = DeletionCoordinator::new(Arc::clone(&stores.db), Arc::clone(&stores.live));
            let report = coordinator.archive_projects(project_ids).await;
            info!(archived = report.done.len(), failed = report.failed.len(), "archive finished");
            Ok(())
        }
        Commands::InitDb => {
            stores.database.apply_schema().await?;
            info!("schema applied");
            Ok(())
        }
        Commands::Partition { .. } => anyhow::bail!("partition runs without stores"),
    }
}

// ── Partition Preview ───────────────────────────────────────────

/// Partition a GeoJSON AOI offline and write the groups as a GeoJSON
/// FeatureCollection.
pub fn run_partition(file: &Path, zoom: i64, group_width: u32, output: Option<&Path>) -> Result<()> {
    let source = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let value: Value = serde_json::from_str(&source).with_context(|| format!("parsing {}", file.display()))?;

    let aoi = Aoi::from_geojson(&value, zoom)?;
    let plans = GridPartitioner::new(aoi.zoom(), group_width).partition(&aoi)?;

    let features: Vec<Value> = plans
        .iter()
        .filter_map(|plan| {
            let tile_box = plan.tile_box()?;
            Some(json!({
                "type": "Feature",
                "geometry": polygon_to_geojson(&tile_box.polygon(aoi.zoom())),
                "properties": {
                    "groupId": plan.group_id,
                    "numberOfTasks": plan.number_of_tasks(),
                    "xMin": tile_box.x_min,
                    "xMax": tile_box.x_max,
                    "yMin": tile_box.y_min,
                    "yMax": tile_box.y_max,
                },
            }))
        })
        .collect();
    let tasks: u64 = plans.iter().map(|p| p.number_of_tasks()).sum();
    info!(
        area_km2 = aoi.area_km2(),
        zoom = aoi.zoom(),
        groups = plans.len(),
        tasks,
        "partition complete"
    );

    let collection = json!({"type": "FeatureCollection", "features": features});
    let text = serde_json::to_string_pretty(&collection)?;
    match output {
        Some(path) => std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", text),
    }
    Ok(())
}
