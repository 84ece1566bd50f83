//! Classify command - show the sharing scope of files

use crate::cli::args::{ClassifyArgs, OutputFormat};
use crate::config::Config;
use crate::error::{StrataError, StrataResult};
use crate::scope::{Classification, Content, ContentKind, Scope, ScopeClassifier};
use console::style;
use serde::Serialize;
use tokio::fs;

#[derive(Serialize)]
struct Row {
    file: String,
    scope: Scope,
    #[serde(skip_serializing_if = "Option::is_none")]
    group: Option<String>,
    reason: String,
}

/// Execute the classify command
pub async fn execute(args: ClassifyArgs, config: &Config) -> StrataResult<()> {
    let classifier = ScopeClassifier::from_config(&config.scope)?;
    let kind = match (args.distributable, args.group) {
        (true, _) => ContentKind::Distributable,
        (false, Some(group)) => ContentKind::GroupShared { group },
        (false, None) => ContentKind::Private,
    };

    let mut rows = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let payload = fs::read(path)
            .await
            .map_err(|e| StrataError::io(format!("reading {}", path.display()), e))?;
        let name = path.to_string_lossy().into_owned();
        let content = Content::new(name.clone(), kind.clone(), payload);
        rows.push(row(name, classifier.classify(&content)));
    }

    match args.format {
        OutputFormat::Table => print_table(&rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
        OutputFormat::Plain => {
            for row in &rows {
                println!("{}\t{}", row.scope, row.file);
            }
        }
    }
    Ok(())
}

fn row(file: String, classification: Classification) -> Row {
    Row {
        file,
        scope: classification.scope,
        group: classification.group,
        reason: classification.reason.to_string(),
    }
}

fn print_table(rows: &[Row]) {
    println!("{:<40} {:<8} {}", "FILE", "SCOPE", "REASON");
    println!("{}", "-".repeat(80));

    for row in rows {
        let scope = match row.scope {
            Scope::Global => style("global").green().to_string(),
            Scope::Group => style("group").cyan().to_string(),
            Scope::Owner => style("owner").yellow().to_string(),
        };
        println!("{:<40} {:<8} {}", row.file, scope, row.reason);
    }
}
