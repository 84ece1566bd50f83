//! Terminal output for the strata CLI
//!
//! Status lines go to stderr so that commands like `strata cache get` can
//! stream payloads on stdout. Interactive terminals get `cliclack` styling
//! and `indicatif` progress; CI and pipes get plain tagged lines.
//!
//! ```rust,ignore
//! use strata::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect().with_auto_yes(args.yes);
//!
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Warming pools...");
//! spinner.stop("4 resources ready");
//!
//! ui::step_warn_hint(&ctx, "Podman not found", "Install podman");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{key_value, remark, section, step_info, step_ok, step_ok_detail, step_warn_hint};
pub use progress::{PoolMonitor, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, StrataTheme};
