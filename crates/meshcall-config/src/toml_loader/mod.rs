//! Reading `config.toml`, and writing the commented template on first run.

mod template;


use std::path::{Path, PathBuf};

use meshcall_common::ConfigError;
use tracing::info;

use crate::schema::MeshcallConfig;

/// `<platform config dir>/meshcall/config.toml`.
pub(crate) fn default_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("meshcall").join("config.toml"))
        .ok_or_else(|| ConfigError::ParseError("could not determine config directory".into()))
}

/// Parse `path`. Missing fields take their defaults; nothing is validated.
pub(crate) fn read(path: &Path) -> Result<MeshcallConfig, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ConfigError::ParseError(format!(
                "failed to read {}: {e}",
                path.display()
            )))
        }
    };
    let config = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// Like [`read`], but a missing file is replaced by the template and the
/// defaults are returned.
pub(crate) fn read_or_create(path: &Path) -> Result<MeshcallConfig, ConfigError> {
    match read(path) {
        Err(ConfigError::FileNotFound(_)) => {
            write_template(path)?;
            Ok(MeshcallConfig::default())
        }
        other => other,
    }
}

fn write_template(path: &Path) -> Result<(), ConfigError> {
    let written = path
        .parent()
        .map_or(Ok(()), std::fs::create_dir_all)
        .and_then(|()| std::fs::write(path, template::default_config_toml()));
    written.map_err(|e| ConfigError::ParseError(format!("failed to write {}: {e}", path.display())))?;
    info!(path = %path.display(), "Wrote default config");
    Ok(())
}
