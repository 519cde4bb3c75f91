use std::fs;
use std::path::Path;

use super::{AppConfig, ConfigError};

/// Loads and validates the resolved configuration from a JSON file.
///
/// Missing fields fall back to their defaults, so a minimal config can be as
/// small as `{}`.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: AppConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::vbc_core::config::QueueSortMode;

    #[test]
    fn load_config_applies_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"general": {{"threads": 4, "queue_sort": "size-desc"}}}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.general.threads, 4);
        assert_eq!(config.general.queue_sort, QueueSortMode::SizeDesc);
        assert_eq!(config.general.cq, 45);
        assert_eq!(config.output_suffix(), "_out");
    }

    #[test]
    fn load_config_parses_dynamic_cq_rules_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"general": {{"dynamic_cq": [
                {{"pattern": "GoPro", "cq": 38}},
                {{"pattern": "Sony", "cq": 42}}
            ]}}}}"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        let patterns: Vec<&str> = config
            .general
            .dynamic_cq
            .iter()
            .map(|rule| rule.pattern.as_str())
            .collect();
        assert_eq!(patterns, vec!["GoPro", "Sony"]);
    }

    #[test]
    fn load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/vbc.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn load_config_rejects_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "general:").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
