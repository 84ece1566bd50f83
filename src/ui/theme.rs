//! cliclack theme

use cliclack::ThemeState;
use console::Style;

/// Blue bars, green on submit
#[derive(Debug, Clone, Default)]
pub struct StrataTheme;

impl cliclack::Theme for StrataTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Active => Style::new().blue(),
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Style::new().blue().dim(),
        }
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        match state {
            ThemeState::Error(_) => Style::new().red(),
            ThemeState::Cancel => Style::new().dim(),
            ThemeState::Submit => Style::new().green(),
            ThemeState::Active => Style::new().blue(),
        }
    }
}

pub fn init_theme() {
    cliclack::set_theme(StrataTheme);
}
