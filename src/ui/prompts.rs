//! Confirmation prompts with non-interactive fallback

use super::context::UiContext;
use crate::error::{StrataError, StrataResult};

/// Ask a yes/no question
///
/// Auto-yes answers yes. Without a terminal the default is returned.
pub async fn confirm(ctx: &UiContext, message: &str, default: bool) -> StrataResult<bool> {
    if ctx.auto_yes() {
        return Ok(true);
    }
    if !ctx.is_interactive() {
        return Ok(default);
    }

    let message = message.to_string();
    tokio::task::spawn_blocking(move || {
        cliclack::confirm(&message)
            .initial_value(default)
            .interact()
    })
    .await
    .map_err(|e| StrataError::Internal(format!("prompt task failed: {}", e)))?
    .map_err(|e| StrataError::io("reading confirmation", e))
}
