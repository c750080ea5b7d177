use std::path::{Path, PathBuf};

use eyre::OptionExt;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use portier_terminal::TerminalConfig;

/// File name of the configuration inside [`config_dir`]
const CONFIG_FILE: &str = "portier.toml";

/// Prefix of environment variables overriding the configuration
///
/// Nested keys are separated by a double underscore, e.g.
/// `PORTIER_TIMING__POLL_INTERVAL_MS=100`.
const ENV_PREFIX: &str = "PORTIER_";

/// Returns the base config directory for portier. It also creates the
/// directory if it doesn't exist yet.
pub(crate) fn config_dir() -> eyre::Result<PathBuf> {
    let dir = std::env::home_dir()
        .ok_or_eyre("home directory not found")?
        .join(".portier");
    if !dir.exists() {
        std::fs::create_dir(&dir)?
    }
    Ok(dir)
}

/// Load the terminal configuration from `path`, or the default file when
/// unset, with environment overrides on top. A missing file is not an error.
pub(crate) fn load_config(path: Option<&Path>) -> eyre::Result<TerminalConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config_dir()?.join(CONFIG_FILE),
    };
    tracing::debug!(path = %path.display(), "Loading configuration");

    Ok(sources(&path).extract()?)
}

fn sources(path: &Path) -> Figment {
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use portier_terminal::config::PinMode;

    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let path = std::env::temp_dir().join("portier-test-missing.toml");
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.credential, TerminalConfig::default().credential);
        assert!(config.trust_anchor.is_none());
    }

    #[test]
    fn test_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("portier-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
            [reader]
            name = "Virtual Reader 0"

            [timing]
            blink_interval_ms = 50

            [pin]
            mode = "pad"
            entry_timeout_ms = 15000
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.reader.name.as_deref(), Some("Virtual Reader 0"));
        assert_eq!(config.timing.blink_interval(), Duration::from_millis(50));
        assert_eq!(config.pin.mode, PinMode::Pad);
        assert_eq!(config.pin.entry_timeout(), Some(Duration::from_secs(15)));
    }
}
