//! Query-file loading.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

/// One work item: a stable id plus the prompt text.
#[derive(Debug, Clone, Deserialize)]
pub struct Query {
    pub id: u32,
    pub query: String,
}

/// Load a JSON array of queries from `path`.
pub fn load(path: &Path) -> Result<Vec<Query>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading query file {}", path.display()))?;
    let queries = parse(&raw).with_context(|| format!("parsing query file {}", path.display()))?;
    log::info!("loaded {} queries from {}", queries.len(), path.display());
    Ok(queries)
}

fn parse(raw: &str) -> Result<Vec<Query>> {
    let queries: Vec<Query> = serde_json::from_str(raw)?;
    ensure!(!queries.is_empty(), "query file contains no queries");
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_array() {
        let queries = parse(
            r#"[
                {"id": 0, "query": "What is hypertension?"},
                {"id": 1, "query": "Treatment protocol for anaphylaxis?"}
            ]"#,
        )
        .unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].id, 0);
        assert_eq!(queries[1].query, "Treatment protocol for anaphylaxis?");
    }

    #[test]
    fn test_empty_array_is_rejected() {
        assert!(parse("[]").is_err());
    }

    #[test]
    fn test_malformed_json_is_rejected() {
        assert!(parse(r#"{"id": 0}"#).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = load(Path::new("/nonexistent/queries.json")).unwrap_err();
        assert!(err.to_string().contains("queries.json"));
    }
}
