//! `turnloop config`: show the effective settings.

use std::path::Path;

use anyhow::Context;
use turnloop_config::AgentSettings;

pub fn show(path: &Path) -> anyhow::Result<()> {
    let settings = AgentSettings::load_from_with_env(path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    println!("# {}", path.display());
    println!("{}", settings.to_toml());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn invalid_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_turns = 0").unwrap();
        let err = show(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to load settings"));
    }

    #[test]
    fn missing_file_shows_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(show(&dir.path().join("agent.toml")).is_ok());
    }
}
