use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{GraphError, Result};

/// Parse one record per line. Blank lines are skipped; the first malformed
/// line aborts with its 1-based line number.
pub fn parse_lines<T: DeserializeOwned>(path: &str, text: &str) -> Result<Vec<T>> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(source) => {
                tracing::error!(path = path, line = i + 1, error = %source, "Malformed JSON-Lines record");
                return Err(GraphError::Corrupt {
                    path: path.to_string(),
                    line: i + 1,
                    source,
                });
            }
        }
    }
    Ok(records)
}

pub fn render_lines<'a, T: Serialize + 'a>(records: impl IntoIterator<Item = &'a T>) -> Result<Bytes> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(Bytes::from(out))
}

/// Parse a whole-object JSON document such as an index file.
pub fn parse_document<T: DeserializeOwned>(path: &str, text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|source| {
        tracing::error!(path = path, error = %source, "Malformed JSON document");
        GraphError::Corrupt {
            path: path.to_string(),
            line: source.line(),
            source,
        }
    })
}

pub fn render_document<T: Serialize>(doc: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec_pretty(doc)?))
}
