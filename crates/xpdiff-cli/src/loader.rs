//! Manifest loading from files and stdin

use std::io::Read;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::error::CliError;

/// Load every YAML document from the given paths ("-" reads stdin)
///
/// Empty documents and non-mapping documents are skipped.
pub fn load_files(paths: &[std::path::PathBuf]) -> Result<Vec<JsonValue>, CliError> {
    let mut docs = Vec::new();
    for path in paths {
        let content = read_input(path)?;
        docs.extend(parse_documents(&content, &path.display().to_string())?);
    }
    Ok(docs)
}

fn read_input(path: &Path) -> Result<String, CliError> {
    if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| CliError::input(format!("cannot read stdin: {}", e)))?;
        Ok(buf)
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| CliError::input(format!("cannot read {}: {}", path.display(), e)))
    }
}

/// Split a multi-document YAML stream into unstructured objects
pub fn parse_documents(content: &str, source: &str) -> Result<Vec<JsonValue>, CliError> {
    let mut docs = Vec::new();
    for (index, deserializer) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let value = JsonValue::deserialize(deserializer)
            .map_err(|e| CliError::input(format!("{} document {}: {}", source, index, e)))?;
        if value.is_object() {
            docs.push(value);
        }
    }
    Ok(docs)
}
