//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{StrataError, StrataResult};
use crate::ui::{self, UiContext};

/// Keys that serialize to nothing while unset
const OPTIONAL_KEYS: &[&str] = &["cache.disk_dir"];

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager) -> StrataResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(&manager.load().await?)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let config = manager.load().await?;
            let updated = set_value(&config, &key, &value)?;
            manager.save(&updated).await?;
            ui::step_ok(&UiContext::detect(), &format!("Set {} = {}", key, value));
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> StrataResult<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        ui::step_warn_hint(
            &ctx,
            &format!("Config already exists at {}", path.display()),
            "Use --force to overwrite",
        );
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Configuration initialized", &path.display().to_string());
    Ok(())
}

/// Return `config` with the dotted `key` set to `value`
///
/// The value is parsed as the type the key already has, so `true`,
/// `5000`, `0.75` and comma-separated lists land as the right TOML type.
/// The result is validated as a whole before it is returned.
fn set_value(config: &Config, key: &str, value: &str) -> StrataResult<Config> {
    let mut doc = toml::Value::try_from(config)?;
    let defaults = toml::Value::try_from(Config::default())?;

    let parsed = match lookup(&doc, key).or_else(|| category_template(&defaults, key)) {
        Some(existing) => parse_like(existing, key, value)?,
        None if OPTIONAL_KEYS.contains(&key) => toml::Value::String(value.to_string()),
        None => {
            return Err(StrataError::ConfigValue {
                key: key.to_string(),
                reason: "unknown configuration key".to_string(),
            })
        }
    };

    set_toml_value(&mut doc, key, parsed)?;
    let updated: Config = doc.try_into()?;
    updated.validate()?;
    Ok(updated)
}

fn lookup<'a>(doc: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    key.split('.').try_fold(doc, |node, part| node.get(part))
}

/// `pool.categories.<name>.<field>` takes its type from `pool.default.<field>`
fn category_template<'a>(defaults: &'a toml::Value, key: &str) -> Option<&'a toml::Value> {
    match key.split('.').collect::<Vec<_>>().as_slice() {
        ["pool", "categories", _, field] => lookup(defaults, &format!("pool.default.{}", field)),
        _ => None,
    }
}

fn parse_like(existing: &toml::Value, key: &str, value: &str) -> StrataResult<toml::Value> {
    let invalid = |expected: &str| StrataError::ConfigValue {
        key: key.to_string(),
        reason: format!("expected {}, got {:?}", expected, value),
    };

    Ok(match existing {
        toml::Value::Boolean(_) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" => toml::Value::Boolean(true),
            "false" | "0" | "no" => toml::Value::Boolean(false),
            _ => return Err(invalid("a boolean")),
        },
        toml::Value::Integer(_) => {
            toml::Value::Integer(value.parse().map_err(|_| invalid("an integer"))?)
        }
        toml::Value::Float(_) => toml::Value::Float(value.parse().map_err(|_| invalid("a number"))?),
        toml::Value::Array(_) => toml::Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        ),
        toml::Value::Table(_) => return Err(invalid("a single value, not a table")),
        _ => toml::Value::String(value.to_string()),
    })
}

/// Set a dot-separated key in a TOML value tree, creating intermediate tables as needed
fn set_toml_value(doc: &mut toml::Value, key: &str, value: toml::Value) -> StrataResult<()> {
    let not_table = |part: &str| StrataError::ConfigValue {
        key: key.to_string(),
        reason: format!("{} is not a table", part),
    };

    let (parents, leaf) = match key.rsplit_once('.') {
        Some((parents, leaf)) => (Some(parents), leaf),
        None => (None, key),
    };

    let mut current = doc;
    for part in parents.into_iter().flat_map(|p| p.split('.')) {
        current = current
            .as_table_mut()
            .ok_or_else(|| not_table(part))?
            .entry(part)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    current
        .as_table_mut()
        .ok_or_else(|| not_table(leaf))?
        .insert(leaf.to_string(), value);
    Ok(())
}
