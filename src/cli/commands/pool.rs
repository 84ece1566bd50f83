//! Pool command - keep warm sandbox pools running

use super::AuditTrail;
use crate::cli::args::{OutputFormat, PoolAction, PoolArgs};
use crate::config::{Config, PoolConfig, PoolsConfig};
use crate::error::{StrataError, StrataResult};
use crate::pool::{PodmanProvisioner, PoolManager};
use crate::ui::{self, PoolMonitor, TaskSpinner, UiContext};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Execute the pool command
pub async fn execute(args: PoolArgs, config: &Config) -> StrataResult<()> {
    match args.action {
        PoolAction::Run {
            categories,
            interval,
        } => run(config, categories, interval).await,
        PoolAction::Show { format } => show(&config.pool, format),
    }
}

/// Restrict `pools` to `selected`, or keep every configured category when
/// nothing was selected
fn selected_pools(pools: &PoolsConfig, selected: &[String]) -> (PoolsConfig, Vec<String>) {
    let mut scoped = pools.clone();
    if selected.is_empty() {
        let all = scoped.categories.keys().cloned().collect();
        return (scoped, all);
    }
    scoped.categories.retain(|name, _| selected.contains(name));
    let mut names = selected.to_vec();
    names.sort();
    names.dedup();
    (scoped, names)
}

async fn run(config: &Config, selected: Vec<String>, interval: Option<u64>) -> StrataResult<()> {
    let ctx = UiContext::detect();

    let (pools, categories) = selected_pools(&config.pool, &selected);
    if categories.is_empty() {
        ui::step_warn_hint(
            &ctx,
            "No pool categories configured",
            "Pass --category <name> or add [pool.categories.<name>] to the config",
        );
        return Ok(());
    }

    if !PodmanProvisioner::is_available().await {
        return Err(StrataError::command_failed(
            "podman --version",
            std::io::Error::new(std::io::ErrorKind::NotFound, "podman not found"),
        ));
    }

    let interval = interval
        .map(|secs| Duration::from_secs(secs.max(1)))
        .unwrap_or_else(|| pools.maintenance_interval());

    let trail = AuditTrail::start(config);
    let manager = PoolManager::new(
        Arc::new(PodmanProvisioner::new(pools.clone())),
        pools,
        trail.sink(),
    );
    for category in &categories {
        manager.register(category);
    }

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start(&format!("Warming {}...", categories.join(", ")));
    let ready = manager.warm_up().await;
    if ready == 0 {
        spinner.stop_error("No sandboxes could be provisioned");
    } else {
        spinner.stop(&format!("{} sandboxes ready", ready));
    }

    info!("Maintaining pools every {:?}", interval);
    let maintenance = manager.spawn_maintenance(interval);
    let mut monitor = PoolMonitor::new(&ctx);
    let mut refresh = tokio::time::interval(Duration::from_secs(1));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            _ = refresh.tick() => monitor.update(&manager.all_stats().await),
            signal = &mut interrupted => {
                signal.map_err(|e| StrataError::io("waiting for Ctrl-C", e))?;
                break;
            }
        }
    }
    monitor.finish();

    maintenance.shutdown().await;
    let destroyed = manager.shutdown().await;
    drop(manager);
    trail.finish().await;

    ui::step_ok_detail(
        &ctx,
        "Pools stopped",
        &format!("{} idle sandboxes removed", destroyed),
    );
    Ok(())
}

#[derive(Serialize)]
struct PoolRow<'a> {
    category: &'a str,
    #[serde(flatten)]
    settings: &'a PoolConfig,
}

fn show(pools: &PoolsConfig, format: OutputFormat) -> StrataResult<()> {
    let rows: Vec<PoolRow<'_>> = std::iter::once(("(default)", &pools.default))
        .chain(pools.categories.iter().map(|(name, c)| (name.as_str(), c)))
        .map(|(category, settings)| PoolRow { category, settings })
        .collect();

    match format {
        OutputFormat::Table => {
            println!(
                "{:<16} {:>4} {:>7} {:>4} {:>8}  {}",
                "CATEGORY", "MIN", "TARGET", "MAX", "TTL", "IMAGE"
            );
            println!("{}", "-".repeat(70));
            for row in &rows {
                let s = row.settings;
                println!(
                    "{:<16} {:>4} {:>7} {:>4} {:>7}s  {}",
                    row.category, s.min_size, s.target_size, s.max_size, s.ttl_secs, s.image
                );
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}", row.category);
            }
        }
    }
    Ok(())
}
