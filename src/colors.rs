//! Terminal color selection.
//!
//! `--color` wins over the environment. With `auto`, `NO_COLOR` (any value)
//! disables colors, `CLICOLOR_FORCE` (non-zero) forces them, `CLICOLOR=0`
//! disables them, and otherwise colors follow whether stdout is a terminal.

use clap::ValueEnum;
use colored::control;

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

pub fn init_colors(choice: ColorChoice) {
    let is_tty = std::io::IsTerminal::is_terminal(&std::io::stdout());
    let enabled = colors_enabled(choice, |key| std::env::var(key).ok(), is_tty);
    control::set_override(enabled);
}

fn colors_enabled(
    choice: ColorChoice,
    env: impl Fn(&str) -> Option<String>,
    is_tty: bool,
) -> bool {
    match choice {
        ColorChoice::Always => return true,
        ColorChoice::Never => return false,
        ColorChoice::Auto => {}
    }

    if env("NO_COLOR").is_some() {
        return false;
    }
    if env("CLICOLOR_FORCE").is_some_and(|v| v != "0") {
        return true;
    }
    if env("CLICOLOR").is_some_and(|v| v == "0") {
        return false;
    }
    is_tty
}
