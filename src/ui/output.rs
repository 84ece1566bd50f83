//! Status lines

use super::context::UiContext;
use console::{style, StyledObject};

#[derive(Clone, Copy)]
enum Status {
    Ok,
    Warn,
    Info,
}

impl Status {
    fn tag(self) -> StyledObject<&'static str> {
        match self {
            Self::Ok => style("[OK]").green(),
            Self::Warn => style("[WARN]").yellow(),
            Self::Info => style("[INFO]").cyan(),
        }
    }
}

fn emit(ctx: &UiContext, status: Status, message: String) {
    if ctx.is_interactive() {
        let shown = match status {
            Status::Ok => cliclack::log::success(&message),
            Status::Warn => cliclack::log::warning(&message),
            Status::Info => cliclack::log::info(&message),
        };
        if shown.is_ok() {
            return;
        }
    }
    eprintln!("  {} {}", status.tag(), message);
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    emit(ctx, Status::Ok, message.to_string());
}

pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    emit(ctx, Status::Ok, format!("{} ({})", message, style(detail).dim()));
}

pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    emit(ctx, Status::Warn, format!("{} - {}", message, style(hint).dim()));
}

pub fn step_info(ctx: &UiContext, message: &str) {
    emit(ctx, Status::Info, message.to_string());
}

/// Bold heading preceded by a blank line
pub fn section(_ctx: &UiContext, title: &str) {
    eprintln!();
    eprintln!("{}", style(title).bold());
}

/// Dimmed hint
pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.is_interactive() && cliclack::log::remark(message).is_ok() {
        return;
    }
    eprintln!("  {}", style(message).dim());
}

pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    if ctx.is_interactive() {
        eprintln!("  {}: {}", style(key).dim(), value);
    } else {
        eprintln!("  {}: {}", key, value);
    }
}
