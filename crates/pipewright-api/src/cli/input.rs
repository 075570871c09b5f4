//! JSON arguments given inline or as `@path`.

use std::path::Path;

use anyhow::Context;
use serde_json::Value;

/// Parse a JSON argument. `@path` reads the document from a file; an absent
/// argument is `{}`.
pub fn parse_json_arg(raw: Option<&str>) -> anyhow::Result<Value> {
    let Some(raw) = raw else {
        return Ok(Value::Object(serde_json::Map::new()));
    };
    match raw.strip_prefix('@') {
        Some(path) => {
            let content = std::fs::read_to_string(Path::new(path))
                .with_context(|| format!("failed to read {path}"))?;
            serde_json::from_str(&content).with_context(|| format!("{path} is not valid JSON"))
        }
        None => serde_json::from_str(raw).context("invalid JSON argument"),
    }
}
