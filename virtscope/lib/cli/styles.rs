use std::{
    fmt::Write,
    io::{self, IsTerminal},
    sync::LazyLock,
};

use clap::builder::styling::{AnsiColor, Effects, Style, Styles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Whether stdout is an interactive terminal that understands ANSI escapes.
static IS_ANSI_TERMINAL: LazyLock<bool> = LazyLock::new(|| {
    io::stdout().is_terminal() && std::env::var("TERM").map_or(true, |term| term != "dumb")
});

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Applies the [`styles`] palette to text printed by the CLI.
pub trait AnsiStyles {
    /// Apply header style to text
    fn header(&self) -> String;

    /// Apply literal style to text
    fn literal(&self) -> String;

    /// Apply placeholder style to text
    fn placeholder(&self) -> String;

    /// Apply error style to text
    fn error(&self) -> String;
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns a `Styles` object with the default styles for the CLI.
pub fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default())
        .error(AnsiColor::Red.on_default() | Effects::BOLD)
        .valid(AnsiColor::Green.on_default() | Effects::BOLD)
        .invalid(AnsiColor::Red.on_default() | Effects::BOLD)
}

fn apply_style(text: &str, style: &Style) -> String {
    paint(text, style, *IS_ANSI_TERMINAL)
}

fn paint(text: &str, style: &Style, enabled: bool) -> String {
    if !enabled {
        return text.to_string();
    }

    let mut styled = String::with_capacity(text.len() + 20);
    let _ = write!(styled, "{}", style);
    styled.push_str(text);
    let _ = write!(styled, "{}", style.render_reset());
    styled
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl<T: AsRef<str> + ?Sized> AnsiStyles for T {
    fn header(&self) -> String {
        apply_style(self.as_ref(), styles().get_header())
    }

    fn literal(&self) -> String {
        apply_style(self.as_ref(), styles().get_literal())
    }

    fn placeholder(&self) -> String {
        apply_style(self.as_ref(), styles().get_placeholder())
    }

    fn error(&self) -> String {
        apply_style(self.as_ref(), styles().get_error())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
