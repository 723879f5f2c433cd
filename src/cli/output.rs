//! `resolve` and `render` commands.

use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde_json::Value as JsonValue;

use crate::engine::Engine;
use crate::source::TemplateSource;

/// Resolve `file` and print the result to stdout.
pub async fn resolve_file<S: TemplateSource>(engine: &Engine<S>, file: &Path) -> Result<()> {
    let text = engine
        .resolve(file)
        .await
        .with_context(|| format!("failed to resolve `{}`", file.display()))?;
    write_stdout(&text)
}

/// Resolve and render `file` with the JSON object in `data`.
pub async fn render_file<S: TemplateSource>(
    engine: &Engine<S>,
    file: &Path,
    data: Option<&str>,
) -> Result<()> {
    let data = parse_data(data)?;
    let text = engine
        .render_file(file, data)
        .await
        .with_context(|| format!("failed to render `{}`", file.display()))?;
    write_stdout(&text)
}

fn parse_data(data: Option<&str>) -> Result<JsonValue> {
    let Some(raw) = data else {
        return Ok(JsonValue::Object(Default::default()));
    };
    let value: JsonValue = serde_json::from_str(raw).context("`--data` is not valid JSON")?;
    if !value.is_object() {
        bail!("`--data` must be a JSON object");
    }
    Ok(value)
}

fn write_stdout(text: &str) -> Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}
