//! Cache command - store and inspect entries in the node-local tier

use super::{format_bytes, AuditTrail};
use crate::cache::{BlobStore, CacheKey, DiskStore, Lookup, Tier, TieredCache};
use crate::cli::args::{CacheAction, CacheArgs, NamespaceArgs, OutputFormat};
use crate::config::{Config, ConfigManager};
use crate::error::{StrataError, StrataResult};
use crate::events::{NullSink, SharedSink};
use crate::scope::{Content, ContentKind, ScopeClassifier};
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

const MB: u64 = 1024 * 1024;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let store = DiskStore::new(ConfigManager::tier_dir(config));

    match args.action {
        CacheAction::Put {
            identity,
            file,
            distributable,
            namespace,
        } => {
            let trail = AuditTrail::start(config);
            let result = {
                let cache = node_cache(config, &store, trail.sink()).await?;
                put(&ctx, &cache, &identity, &file, distributable, &namespace).await
            };
            trail.finish().await;
            result
        }
        CacheAction::Get {
            identity,
            output,
            namespace,
        } => {
            let trail = AuditTrail::start(config);
            let result = {
                let cache = node_cache(config, &store, trail.sink()).await?;
                get(&ctx, &cache, &identity, output.as_deref(), &namespace).await
            };
            trail.finish().await;
            result
        }
        CacheAction::Rm {
            identity,
            namespace,
        } => {
            let cache = node_cache(config, &store, Arc::new(NullSink)).await?;
            remove(&ctx, &cache, &identity, &namespace).await
        }
        CacheAction::List { format } => list(&store, format).await,
        CacheAction::Purge { yes } => purge(&ctx, &store, yes).await,
    }
}

/// A cache over just the node-local disk tier, loaded from what earlier
/// runs left behind
async fn node_cache(
    config: &Config,
    store: &DiskStore,
    sink: SharedSink,
) -> StrataResult<TieredCache> {
    let classifier = ScopeClassifier::from_config(&config.scope)?;
    let tier = Tier::new(
        "disk",
        config.cache.disk_capacity_mb * MB,
        Arc::new(store.clone()),
    )
    .with_sink(Arc::clone(&sink))
    .load()
    .await?;

    Ok(TieredCache::builder(classifier)
        .tier(tier)
        .default_ttl(config.cache.default_ttl())
        .sink(sink)
        .build())
}

async fn put(
    ctx: &UiContext,
    cache: &TieredCache,
    identity: &str,
    file: &Path,
    distributable: bool,
    namespace: &NamespaceArgs,
) -> StrataResult<()> {
    let payload = fs::read(file)
        .await
        .map_err(|e| StrataError::io(format!("reading {}", file.display()), e))?;

    let kind = match (&namespace.group, distributable) {
        (_, true) => ContentKind::Distributable,
        (Some(group), false) => ContentKind::GroupShared {
            group: group.clone(),
        },
        (None, false) => ContentKind::Private,
    };
    let name = file.to_string_lossy().into_owned();
    let content = Content::new(name, kind, payload);
    let key = CacheKey::new(namespace.namespace()?, identity);

    let outcome = cache.put(&namespace.caller(), &key, &content).await?;
    if !outcome.is_stored() {
        let reason = outcome
            .skipped
            .first()
            .map(|skip| skip.reason.clone())
            .unwrap_or_else(|| "no tier accepts this scope".to_string());
        return Err(StrataError::backend("disk", reason));
    }

    ui::step_ok_detail(
        ctx,
        &format!("Stored {}", identity),
        &format!("{}, {}", key, format_bytes(content.payload.len() as u64)),
    );
    Ok(())
}

async fn get(
    ctx: &UiContext,
    cache: &TieredCache,
    identity: &str,
    output: Option<&Path>,
    namespace: &NamespaceArgs,
) -> StrataResult<()> {
    let key = CacheKey::new(namespace.namespace()?, identity);

    // The node tier is the only source here, so a miss means not found
    let Lookup::Hit { payload, .. } = cache.get(&namespace.caller(), &key).await? else {
        return Err(StrataError::OriginNotFound {
            identity: identity.to_string(),
        });
    };

    match output {
        Some(path) => {
            fs::write(path, &payload)
                .await
                .map_err(|e| StrataError::io(format!("writing {}", path.display()), e))?;
            ui::step_ok_detail(
                ctx,
                &format!("Wrote {}", path.display()),
                &format_bytes(payload.len() as u64),
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&payload)
                .and_then(|()| stdout.flush())
                .map_err(|e| StrataError::io("writing payload to stdout", e))?;
        }
    }
    Ok(())
}

async fn remove(
    ctx: &UiContext,
    cache: &TieredCache,
    identity: &str,
    namespace: &NamespaceArgs,
) -> StrataResult<()> {
    let caller = namespace.caller();
    let key = CacheKey::new(namespace.namespace()?, identity);

    let present = cache.get(&caller, &key).await?.is_hit();
    cache.invalidate(&caller, &key).await?;

    if present {
        ui::step_ok(ctx, &format!("Removed {}", identity));
    } else {
        ui::step_info(ctx, &format!("No entry for {}", identity));
    }
    Ok(())
}

#[derive(Serialize)]
struct ListedEntry {
    key: String,
    scope: String,
    size: u64,
}

impl ListedEntry {
    fn new(key: String, size: u64) -> Self {
        let scope = key.split('/').next().unwrap_or_default().to_string();
        Self { key, scope, size }
    }
}

async fn list(store: &DiskStore, format: OutputFormat) -> StrataResult<()> {
    let entries: Vec<ListedEntry> = store
        .list()
        .await?
        .into_iter()
        .map(|(key, size)| ListedEntry::new(key, size))
        .collect();

    match format {
        OutputFormat::Table => print_table(store.root(), &entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{}", entry.key);
            }
        }
    }
    Ok(())
}

fn print_table(root: &Path, entries: &[ListedEntry]) {
    if entries.is_empty() {
        println!("No entries in {}", root.display());
        return;
    }

    println!("{:<84} {:<8} {:>10}", "KEY", "SCOPE", "SIZE");
    println!("{}", "-".repeat(104));

    for entry in entries {
        let scope = match entry.scope.as_str() {
            "global" => style("global").green().to_string(),
            "group" => style("group").cyan().to_string(),
            other => style(other).yellow().to_string(),
        };
        println!(
            "{:<84} {:<8} {:>10}",
            entry.key,
            scope,
            format_bytes(entry.size)
        );
    }

    let total: u64 = entries.iter().map(|e| e.size).sum();
    println!();
    println!(
        "Total: {} entr{}, {}",
        entries.len(),
        if entries.len() == 1 { "y" } else { "ies" },
        format_bytes(total)
    );
}

async fn purge(ctx: &UiContext, store: &DiskStore, yes: bool) -> StrataResult<()> {
    let entries = store.list().await?;
    if entries.is_empty() {
        ui::step_info(ctx, "Cache tier is already empty");
        return Ok(());
    }

    let ctx = ctx.with_auto_yes(yes);
    let prompt = format!("Remove all {} entries from {}?", entries.len(), store.root().display());
    if !ui::confirm(&ctx, &prompt, false).await? {
        ui::step_warn_hint(&ctx, "Nothing removed", "Use --yes to skip confirmation");
        return Ok(());
    }

    let mut freed = 0;
    for (key, size) in &entries {
        store.delete(key).await?;
        freed += size;
    }

    ui::step_ok_detail(
        &ctx,
        &format!("Removed {} entries", entries.len()),
        &format!("{} freed", format_bytes(freed)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> (Config, DiskStore) {
        let mut config = Config::default();
        config.general.audit_log = false;
        config.cache.disk_dir = Some(dir.path().join("tier"));
        let store = DiskStore::new(ConfigManager::tier_dir(&config));
        (config, store)
    }

    fn owner(id: &str) -> NamespaceArgs {
        NamespaceArgs {
            owner: Some(id.to_string()),
            group: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_through_disk() {
        let dir = TempDir::new().unwrap();
        let (config, store) = config_in(&dir);
        let ctx = UiContext::non_interactive();
        let src = dir.path().join("react.tgz");
        std::fs::write(&src, b"react-18.2.0").unwrap();

        let cache = node_cache(&config, &store, Arc::new(NullSink)).await.unwrap();
        put(&ctx, &cache, "pkg/react/18.2.0", &src, true, &NamespaceArgs::default())
            .await
            .unwrap();

        // A fresh cache sees the entry through the disk backend
        let cache = node_cache(&config, &store, Arc::new(NullSink)).await.unwrap();
        let out = dir.path().join("out.tgz");
        get(&ctx, &cache, "pkg/react/18.2.0", Some(&out), &NamespaceArgs::default())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"react-18.2.0");
    }

    #[tokio::test]
    async fn private_file_refused_globally() {
        let dir = TempDir::new().unwrap();
        let (config, store) = config_in(&dir);
        let src = dir.path().join(".env");
        std::fs::write(&src, b"API_KEY=abc").unwrap();

        let cache = node_cache(&config, &store, Arc::new(NullSink)).await.unwrap();
        let err = put(
            &UiContext::non_interactive(),
            &cache,
            "project/env",
            &src,
            false,
            &NamespaceArgs::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, StrataError::SensitiveContent { .. }));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_entry_is_not_available() {
        let dir = TempDir::new().unwrap();
        let (config, store) = config_in(&dir);
        let cache = node_cache(&config, &store, Arc::new(NullSink)).await.unwrap();

        let err = get(&UiContext::non_interactive(), &cache, "nope", None, &owner("alice"))
            .await
            .unwrap_err();
        assert!(err.is_not_available());
    }

    #[tokio::test]
    async fn remove_then_purge() {
        let dir = TempDir::new().unwrap();
        let (config, store) = config_in(&dir);
        let ctx = UiContext::non_interactive();
        let src = dir.path().join("notes.txt");
        std::fs::write(&src, b"private notes").unwrap();

        let cache = node_cache(&config, &store, Arc::new(NullSink)).await.unwrap();
        put(&ctx, &cache, "a", &src, false, &owner("alice")).await.unwrap();
        put(&ctx, &cache, "b", &src, false, &owner("alice")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);

        remove(&ctx, &cache, "a", &owner("alice")).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        // Without --yes and without a terminal nothing is removed
        purge(&ctx, &store, false).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);

        purge(&ctx, &store, true).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn listed_entry_takes_scope_from_key() {
        let entry = ListedEntry::new("owner/alice/abcd".to_string(), 3);
        assert_eq!(entry.scope, "owner");
    }
}
