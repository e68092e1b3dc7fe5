//! Catalog credential resolution
//!
//! This module finds the bearer token attached to catalog and file requests.
//! A stored credential file wins over environment variables; with neither,
//! requests go out anonymously.

use std::path::Path;
use tracing::debug;

use config::EnvSource;

/// Resolves the catalog token
///
/// Order: trimmed contents of `credential_file`, then the first non-empty
/// variable among `env_vars`.
pub fn resolve_token(
    credential_file: Option<&Path>,
    env_vars: &[String],
    env: &dyn EnvSource,
) -> Option<String> {
    if let Some(path) = credential_file {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let token = contents.trim();
                if !token.is_empty() {
                    debug!("Using catalog token from {:?}", path);
                    return Some(token.to_string());
                }
            }
            Err(e) => debug!("No credential file at {:?}: {}", path, e),
        }
    }

    for name in env_vars {
        if let Some(token) = env.var(name) {
            debug!("Using catalog token from ${}", name);
            return Some(token);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn names() -> Vec<String> {
        config::DEFAULT_TOKEN_ENV_VARS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_credential_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hf_token");
        std::fs::write(&path, "  hf_from_file\n").unwrap();

        let env: HashMap<String, String> =
            [("HF_TOKEN".to_string(), "hf_from_env".to_string())].into_iter().collect();

        assert_eq!(
            resolve_token(Some(&path), &names(), &env).as_deref(),
            Some("hf_from_file")
        );
    }

    #[test]
    fn test_env_order_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let blank = dir.path().join("hf_token");
        std::fs::write(&blank, "\n").unwrap();

        let env: HashMap<String, String> = [
            ("HUGGINGFACEHUB_API_TOKEN".to_string(), " ".to_string()),
            ("HUGGING_FACE_HUB_TOKEN".to_string(), "second".to_string()),
            ("HF_TOKEN".to_string(), "third".to_string()),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            resolve_token(Some(&blank), &names(), &env).as_deref(),
            Some("second")
        );
    }

    #[test]
    fn test_anonymous_without_sources() {
        let env: HashMap<String, String> = HashMap::new();
        let missing = Path::new("/nonexistent/depot/hf_token");
        assert!(resolve_token(Some(missing), &names(), &env).is_none());
        assert!(resolve_token(None, &names(), &env).is_none());
    }
}
