//! Settings store for values the embedding application supplies, mostly API keys.
//!
//! Lookups check the environment first, then a JSON object file: the path
//! given on the command line, else `<config_dir>/apibase/config.json`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use log::debug;
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::runtime::Runtime;

pub const SETTINGS_DIR: &str = "apibase";
pub const SETTINGS_FILE: &str = "config.json";

pub struct Settings<R: Runtime> {
    runtime: R,
    values: Map<String, Value>,
}

impl<R: Runtime> Settings<R> {
    /// Settings with no backing file; only the environment is consulted.
    pub fn empty(runtime: R) -> Self {
        Self {
            runtime,
            values: Map::new(),
        }
    }

    /// Loads settings from `path`, or from the default location when `None`.
    ///
    /// An explicit path must exist; a missing default file is not an error.
    #[tracing::instrument(skip(runtime))]
    pub fn load(runtime: R, path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => {
                if !runtime.exists(path) {
                    bail!("Settings file not found: {}", path.display());
                }
                path.to_path_buf()
            }
            None => match default_path(&runtime) {
                Some(path) if runtime.exists(&path) => path,
                _ => {
                    debug!("No settings file, using environment only");
                    return Ok(Self::empty(runtime));
                }
            },
        };

        debug!("Loading settings from {}...", path.display());
        let content = runtime
            .read_to_string(&path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        let values = match serde_json::from_str::<Value>(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?
        {
            Value::Object(values) => values,
            _ => bail!("Settings file {} must contain a JSON object", path.display()),
        };

        Ok(Self { runtime, values })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Resolves a secret from `env_key`, then from the settings key.
    ///
    /// Empty values count as absent.
    pub fn secret(&self, env_key: &str, setting_key: &str) -> Result<String, ApiError> {
        if let Ok(value) = self.runtime.env_var(env_key) {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }
        match self.get_str(setting_key) {
            Some(value) if !value.trim().is_empty() => Ok(value.to_string()),
            _ => Err(ApiError::configuration(format!(
                "missing {} (set the environment variable or `{}` in the settings file)",
                env_key, setting_key
            ))),
        }
    }
}

/// `<config_dir>/apibase/config.json`
pub fn default_path<R: Runtime + ?Sized>(runtime: &R) -> Option<PathBuf> {
    runtime
        .config_dir()
        .map(|dir| dir.join(SETTINGS_DIR).join(SETTINGS_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;
    use mockall::predicate::eq;
    use std::env::VarError;

    fn runtime_with_file(content: &'static str) -> MockRuntime {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_config_dir()
            .returning(|| Some(PathBuf::from("/home/user/.config")));
        runtime
            .expect_exists()
            .with(eq(PathBuf::from("/home/user/.config/apibase/config.json")))
            .returning(|_| true);
        runtime
            .expect_read_to_string()
            .returning(move |_| Ok(content.to_string()));
        runtime
    }

    #[test]
    fn test_load_default_path() {
        let settings = Settings::load(runtime_with_file(r#"{"rootme_key": "abc"}"#), None).unwrap();
        assert_eq!(settings.get_str("rootme_key"), Some("abc"));
    }

    #[test]
    fn test_missing_default_file_is_empty() {
        let mut runtime = MockRuntime::new();
        runtime
            .expect_config_dir()
            .returning(|| Some(PathBuf::from("/home/user/.config")));
        runtime.expect_exists().returning(|_| false);

        let settings = Settings::load(runtime, None).unwrap();
        assert!(settings.get("rootme_key").is_none());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let mut runtime = MockRuntime::new();
        runtime.expect_exists().returning(|_| false);

        let result = Settings::load(runtime, Some(Path::new("/tmp/nope.json")));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_object_file_is_error() {
        assert!(Settings::load(runtime_with_file("[1, 2]"), None).is_err());
        assert!(Settings::load(runtime_with_file("not json"), None).is_err());
    }

    #[test]
    fn test_secret_prefers_environment() {
        let mut runtime = runtime_with_file(r#"{"mistral_key": "from-file"}"#);
        runtime
            .expect_env_var()
            .with(eq("MISTRAL_API_KEY"))
            .returning(|_| Ok("from-env".to_string()));

        let settings = Settings::load(runtime, None).unwrap();
        assert_eq!(
            settings.secret("MISTRAL_API_KEY", "mistral_key").unwrap(),
            "from-env"
        );
    }

    #[test]
    fn test_secret_falls_back_to_file() {
        let mut runtime = runtime_with_file(r#"{"mistral_key": "from-file"}"#);
        runtime
            .expect_env_var()
            .returning(|_| Err(VarError::NotPresent));

        let settings = Settings::load(runtime, None).unwrap();
        assert_eq!(
            settings.secret("MISTRAL_API_KEY", "mistral_key").unwrap(),
            "from-file"
        );
    }

    #[test]
    fn test_secret_missing_is_configuration_error() {
        let mut runtime = MockRuntime::new();
        runtime.expect_env_var().returning(|_| Ok("  ".to_string()));

        let settings = Settings::empty(runtime);
        let err = settings.secret("ROOTME_API_KEY", "rootme_key").unwrap_err();
        assert!(matches!(err, ApiError::Configuration(_)));
        assert!(err.to_string().contains("ROOTME_API_KEY"));
    }
}
