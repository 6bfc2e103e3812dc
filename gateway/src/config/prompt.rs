use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Mounted data volume location used in deployments
const DEFAULT_PROMPT_PATH: &str = "/app/data/system_prompt.txt";
/// Working-directory fallback for local development
const LOCAL_PROMPT_PATH: &str = "./system_prompt.txt";

/// Instructions used when no persona file can be read.
pub const FALLBACK_SYSTEM_PROMPT: &str = "Apologize that you were unable to load persona instructions. Refuse to answer any questions.";

/// Resolve the persona instructions.
///
/// Tries the configured path (or the data volume default), then
/// `./system_prompt.txt`, then falls back to a fixed refusal prompt.
pub fn load_system_prompt(configured: Option<PathBuf>) -> String {
    let primary = configured.unwrap_or_else(|| PathBuf::from(DEFAULT_PROMPT_PATH));

    for candidate in [primary.as_path(), Path::new(LOCAL_PROMPT_PATH)] {
        match std::fs::read_to_string(candidate) {
            Ok(contents) => {
                info!(path = %candidate.display(), "Loaded system prompt");
                return contents;
            }
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "System prompt not readable");
            }
        }
    }

    warn!("Using fallback system prompt");
    FALLBACK_SYSTEM_PROMPT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_loads_configured_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("persona.txt");
        fs::write(&path, "You are a helpful avatar.").unwrap();

        assert_eq!(load_system_prompt(Some(path)), "You are a helpful avatar.");
    }

    #[test]
    fn test_missing_files_use_fallback() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.txt");

        // The working-directory fallback is not present in the crate root.
        if Path::new(LOCAL_PROMPT_PATH).exists() {
            return;
        }
        assert_eq!(load_system_prompt(Some(path)), FALLBACK_SYSTEM_PROMPT);
    }
}
