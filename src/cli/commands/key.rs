//! Key command - derive a cache key from project inputs

use crate::cache::KeyBuilder;
use crate::cli::args::KeyArgs;
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::ui::{self, UiContext};
use console::style;
use std::env;

/// Execute the key command
pub async fn execute(args: KeyArgs, config: &Config) -> StrataResult<()> {
    let ctx = UiContext::detect();
    let dir = match args.dir {
        Some(dir) => dir,
        None => env::current_dir().map_err(|e| StrataError::io("getting current directory", e))?,
    };

    let mut builder = KeyBuilder::new(&config.key.env_allow_prefixes);
    let lockfiles = builder.add_lockfiles(&dir)?;
    for file in &args.files {
        builder.add_file(&dir, file)?;
    }
    if args.env {
        builder.add_env(env::vars());
    }

    if builder.is_empty() {
        return Err(StrataError::InvalidKey(format!(
            "no lockfiles, files or environment inputs found in {}",
            dir.display()
        )));
    }

    let key = builder.build(args.namespace.namespace()?);
    println!("{}", key);

    if args.explain {
        ui::section(&ctx, "Inputs");
        for info in &lockfiles {
            ui::key_value(
                &ctx,
                &info.ecosystem.to_string(),
                &format!("{} ({})", info.path.display(), style(&info.hash).dim()),
            );
        }
        for name in builder.input_names() {
            ui::remark(&ctx, name);
        }
    }

    Ok(())
}
