//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::{Result, SyncError};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A relative mapping path is resolved against the config file's directory.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        if config.job.mapping.is_relative() {
            if let Some(dir) = path.parent() {
                config.job.mapping = dir.join(&config.job.mapping);
            }
        }
        Ok(config)
    }

    /// Parse configuration from a YAML string, expanding `${VAR}` references.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let expanded = expand_env(yaml, |name| std::env::var(name).ok())?;
        let config: Config = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

/// Replace `${NAME}` references using `lookup`.
///
/// Unset variables are a configuration error; `$$` escapes a literal `$`.
fn expand_env<F>(input: &str, lookup: F) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed || name.is_empty() {
                    return Err(SyncError::Configuration(format!(
                        "unterminated environment reference '${{{}'",
                        name
                    )));
                }
                let value = lookup(&name).ok_or_else(|| {
                    SyncError::Configuration(format!("environment variable {} is not set", name))
                })?;
                out.push_str(&value);
            }
            _ => out.push('$'),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup(name: &str) -> Option<String> {
        match name {
            "CLIENT_SECRET" => Some("s3cret".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_expand_env_replaces_references() {
        let out = expand_env("secret: ${CLIENT_SECRET}\nprice: $$5", lookup).unwrap();
        assert_eq!(out, "secret: s3cret\nprice: $5");
    }

    #[test]
    fn test_expand_env_missing_variable() {
        let err = expand_env("token: ${NOPE}", lookup).unwrap_err();
        assert!(matches!(err, SyncError::Configuration(_)));
    }

    #[test]
    fn test_expand_env_unterminated() {
        assert!(expand_env("token: ${OPEN", lookup).is_err());
    }

    #[test]
    fn test_load_resolves_mapping_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"
source:
  base_url: https://source.example.com
  endpoint: /rest/asset/v1/programs.json
  auth:
    type: static
    token: abc
target:
  type: memory
job:
  name: programs
  mapping: mappings/program.yaml
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.job.mapping, dir.path().join("mappings/program.yaml"));
        assert_eq!(config.source.page_size, 100);
        assert_eq!(config.job.on_existing, UpsertPolicy::SkipExisting);
        assert!(!config.job.lock_keys());
    }
}
