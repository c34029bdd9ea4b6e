//! Shared styling utilities for the CLI.

use console::Style;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Label for the "ours" side of a conflict (green).
pub fn ours(msg: &str) -> String {
    let style = Style::new().green().bold();
    style.apply_to(msg).to_string()
}

/// Label for the "theirs" side of a conflict (blue).
pub fn theirs(msg: &str) -> String {
    let style = Style::new().blue().bold();
    style.apply_to(msg).to_string()
}

/// Class indicator: Background paths are shelved around operations.
pub fn background() -> String {
    let style = Style::new().cyan();
    format!("{} background", style.apply_to("◌"))
}

/// Class indicator: Foreground paths are left for git.
pub fn foreground() -> String {
    format!("{} foreground", Style::new().apply_to("●"))
}

/// First 8 characters of an id, for tables.
pub fn short_id(id: &str) -> &str {
    if id.len() > 8 {
        &id[..8]
    } else {
        id
    }
}
