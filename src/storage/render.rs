//! HTML rendering of a metric namespace for the diagnostic page.

use crate::core::Result;
use std::fmt::Display;
use std::io::Write;

/// Write one `<p>name: value</p>` line per entry.
pub fn render_entries<'a, V, I>(entries: I, sink: &mut (dyn Write + Send)) -> Result<()>
where
    V: Display,
    I: IntoIterator<Item = (&'a str, V)>,
{
    for (name, value) in entries {
        writeln!(sink, "<p>{}: {}</p>", escape_html(name), value)?;
    }
    Ok(())
}

/// Escape text for an HTML element body.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&#34;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
