//! Environment variable naming and dotenv loading.

use crate::error::ConfigError;
use std::path::Path;
use tracing::debug;

/// Variable that names the env file to load before flags are parsed.
pub const ENV_FILE_VAR: &str = "ENV_FILE";

/// Env file used when [`ENV_FILE_VAR`] is unset.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Maps a flag name onto its environment variable.
///
/// `.` and `-` become `_`, the optional prefix is prepended and the result is
/// uppercased: `pubsub-graceful-stop` reads `PUBSUB_GRACEFUL_STOP`.
pub fn env_name(flag: &str, prefix: &str) -> String {
    let name = flag.replace(['.', '-'], "_");
    format!("{prefix}{name}").to_uppercase()
}

/// Loads the env file named by `ENV_FILE`, or `.env` when unset.
///
/// A missing default file is not an error; a missing file that was asked for
/// explicitly is. Variables already present in the process environment win
/// over the file.
pub fn load_env_file() -> Result<Option<String>, ConfigError> {
    let explicit = std::env::var(ENV_FILE_VAR).ok().filter(|p| !p.is_empty());
    let path = explicit.clone().unwrap_or_else(|| DEFAULT_ENV_FILE.to_string());

    if explicit.is_none() && !Path::new(&path).exists() {
        debug!(path = %path, "no env file");
        return Ok(None);
    }

    dotenvy::from_path(&path).map_err(|source| ConfigError::EnvFile {
        path: path.clone(),
        source,
    })?;
    debug!(path = %path, "env file loaded");
    Ok(Some(path))
}
