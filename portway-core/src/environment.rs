use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Settings for one deployment environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSettings {
    pub name: String,
    /// ADO.NET-style connection string for the environment's database.
    pub connection_string: String,
    pub server_name: Option<String>,
    /// Headers injected into every proxied request for this environment.
    pub headers: HashMap<String, String>,
}

/// The allowed-environment set plus per-environment settings, loaded from
/// `environments/settings.json` and `environments/<Env>/settings.json`.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentRegistry {
    allowed: Vec<String>,
    environments: HashMap<String, EnvironmentSettings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct GlobalEnvironmentFile {
    #[serde(default)]
    allowed_environments: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EnvironmentFile {
    #[serde(default)]
    connection_string: String,
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
}

impl EnvironmentRegistry {
    /// Load from `<root>` (the `environments/` directory). The global
    /// settings file is required; a broken per-environment file is logged
    /// and that environment becomes unusable rather than fatal.
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let global_path = root.join("settings.json");
        let raw = fs::read_to_string(&global_path)
            .with_context(|| format!("reading {}", global_path.display()))?;
        let global: GlobalEnvironmentFile =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", global_path.display()))?;

        let mut environments = HashMap::new();
        for name in &global.allowed_environments {
            let env_path = root.join(name).join("settings.json");
            let raw = match fs::read_to_string(&env_path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(environment = %name, error = %e, "No settings file for allowed environment");
                    continue;
                }
            };
            match serde_json::from_str::<EnvironmentFile>(&raw) {
                Ok(file) => {
                    environments.insert(
                        name.clone(),
                        EnvironmentSettings {
                            name: name.clone(),
                            connection_string: resolve_secret(&file.connection_string),
                            server_name: file.server_name,
                            headers: file.headers,
                        },
                    );
                }
                Err(e) => {
                    warn!(environment = %name, error = %e, "Invalid environment settings, skipping");
                }
            }
        }

        Ok(Self {
            allowed: global.allowed_environments,
            environments,
        })
    }

    pub fn is_allowed(&self, environment: &str) -> bool {
        self.allowed.iter().any(|e| e == environment)
    }

    pub fn get(&self, environment: &str) -> Option<&EnvironmentSettings> {
        self.environments.get(environment)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    pub fn len(&self) -> usize {
        self.environments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.is_empty()
    }
}

/// Resolve `${VAR}` indirection from the process environment. At-rest
/// encryption of the value itself is the secret store's concern.
fn resolve_secret(value: &str) -> String {
    let trimmed = value.trim();
    if let Some(var) = trimmed.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        match std::env::var(var) {
            Ok(resolved) => resolved,
            Err(_) => {
                warn!(variable = %var, "Connection-string variable is not set");
                String::new()
            }
        }
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_registry(root: &Path) {
        fs::create_dir_all(root.join("600")).unwrap();
        fs::write(
            root.join("settings.json"),
            r#"{"AllowedEnvironments": ["600", "700"]}"#,
        )
        .unwrap();
        fs::write(
            root.join("600").join("settings.json"),
            r#"{"ServerName": "sql01", "ConnectionString": "Server=sql01;Database=prod", "Headers": {"X-Origin": "portway"}}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_load_and_lookup() {
        let tmp = tempfile::tempdir().unwrap();
        write_registry(tmp.path());

        let registry = EnvironmentRegistry::load(tmp.path()).unwrap();
        assert!(registry.is_allowed("600"));
        assert!(registry.is_allowed("700"));
        assert!(!registry.is_allowed("800"));

        let env = registry.get("600").unwrap();
        assert_eq!(env.server_name.as_deref(), Some("sql01"));
        assert_eq!(env.headers["X-Origin"], "portway");

        // 700 is allowed but has no settings file
        assert!(registry.get("700").is_none());
    }

    #[test]
    fn test_missing_global_file_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(EnvironmentRegistry::load(tmp.path()).is_err());
    }

    #[test]
    fn test_secret_indirection() {
        unsafe { std::env::set_var("PORTWAY_TEST_CONN", "Server=secret") };
        assert_eq!(resolve_secret("${PORTWAY_TEST_CONN}"), "Server=secret");
        assert_eq!(resolve_secret("Server=plain"), "Server=plain");
        assert_eq!(resolve_secret("${PORTWAY_TEST_UNSET_VAR}"), "");
    }
}
