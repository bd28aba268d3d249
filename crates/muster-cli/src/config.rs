//! CLI-side configuration: resolves which running `muster-server` a
//! client subcommand (`status`, `instances`, and `submit`/`workflow run`
//! in `--server` mode) talks to.
//!
//! Same resolution chain and XDG config file as the engine config in
//! `muster_core::config`: CLI flag > env var > config file > default.
//! Engine tunables themselves (`max_instances`, `worker_command`, ...)
//! are resolved directly via `muster_core::config::EngineConfig::resolve`
//! for in-process subcommands; this module only covers the CLI's own
//! concern of locating a server.

use serde::{Deserialize, Serialize};

use muster_core::config::config_path;

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:7878";

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub cli: CliSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CliSection {
    pub server_url: Option<String>,
}

fn load_config_file() -> Option<ConfigFile> {
    let contents = std::fs::read_to_string(config_path()).ok()?;
    toml::from_str(&contents).ok()
}

/// Resolve the server URL: CLI flag > `MUSTER_SERVER` env > config file > default.
pub fn resolve_server_url(cli_flag: Option<&str>) -> String {
    if let Some(url) = cli_flag {
        return url.to_string();
    }
    if let Ok(url) = std::env::var("MUSTER_SERVER") {
        return url;
    }
    if let Some(url) = load_config_file().and_then(|f| f.cli.server_url) {
        return url;
    }
    DEFAULT_SERVER_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flag_wins_over_everything() {
        assert_eq!(resolve_server_url(Some("http://example:1")), "http://example:1");
    }

    #[test]
    fn defaults_when_nothing_set() {
        // SAFETY: test-only env mutation, no other test in this module touches it.
        unsafe { std::env::remove_var("MUSTER_SERVER") };
        assert_eq!(resolve_server_url(None), DEFAULT_SERVER_URL);
    }
}
