use crate::init::PreconditionError;
use std::path::{Path, PathBuf};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const CREDENTIAL_VARS: &[&str] = &["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: String,
    pub project_root: PathBuf,
    pub api_base: String,
}

/// First non-empty credential among `GEMINI_API_KEY` and `GOOGLE_API_KEY`.
pub fn resolve_api_key<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    CREDENTIAL_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

impl Config {
    pub fn resolve<F>(project_root: &Path, lookup: F) -> Result<Self, PreconditionError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = resolve_api_key(&lookup).ok_or(PreconditionError::MissingCredential)?;
        let api_base = lookup("GEMINI_API_BASE")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());

        Ok(Self {
            api_key,
            project_root: project_root.to_path_buf(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }
}

/// Loads `<root>/.env.local` into the process environment. Variables that
/// are already set win.
pub fn load_env_file(project_root: &Path) {
    let env_file = project_root.join(".env.local");
    if env_file.is_file() {
        if let Err(e) = dotenvy::from_path(&env_file) {
            crate::logw(format!("Could not read {}: {}", env_file.display(), e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn prefers_gemini_key() {
        let vars = env(&[("GEMINI_API_KEY", "g-key"), ("GOOGLE_API_KEY", "o-key")]);
        let cfg = Config::resolve(Path::new("/site"), |k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.api_key, "g-key");
        assert_eq!(cfg.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.project_root, PathBuf::from("/site"));
    }

    #[test]
    fn falls_back_to_google_key_when_gemini_blank() {
        let vars = env(&[("GEMINI_API_KEY", "  "), ("GOOGLE_API_KEY", "o-key")]);
        assert_eq!(resolve_api_key(|k| vars.get(k).cloned()).as_deref(), Some("o-key"));
    }

    #[test]
    fn missing_credential_is_a_precondition_failure() {
        let vars = env(&[]);
        let err = Config::resolve(Path::new("."), |k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, PreconditionError::MissingCredential));
    }

    #[test]
    fn api_base_override_drops_trailing_slash() {
        let vars = env(&[("GOOGLE_API_KEY", "k"), ("GEMINI_API_BASE", "http://127.0.0.1:9000/v1beta/")]);
        let cfg = Config::resolve(Path::new("."), |k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.api_base, "http://127.0.0.1:9000/v1beta");
    }
}
