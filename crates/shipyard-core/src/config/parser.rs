//! TOML parser with helpful error messages

use super::schema::ShipyardConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse shipyard.toml from disk.
pub fn parse_config(path: &Path) -> Result<ShipyardConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse shipyard.toml content from string
pub fn parse_config_str(content: &str) -> Result<ShipyardConfig> {
    let config: ShipyardConfig =
        toml::from_str(content).map_err(|e| enhance_toml_error(e, content))?;
    config.validate()?;
    Ok(config)
}

/// Attach the offending lines to a TOML error.
pub(crate) fn enhance_toml_error(error: toml::de::Error, content: &str) -> anyhow::Error {
    let message = error.message().to_string();
    match error.span() {
        Some(span) => {
            let line_num = content[..span.start.min(content.len())]
                .matches('\n')
                .count()
                + 1;
            anyhow::anyhow!(
                "TOML parsing error at line {}:\n{}\n\nError: {}",
                line_num,
                line_context(content, line_num),
                message
            )
        }
        None => anyhow::anyhow!("TOML parsing error: {}", message),
    }
}

fn line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2);
    let end = (line_num + 1).min(lines.len());

    lines[start.min(end)..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Serialize a configuration to TOML string
pub fn to_toml(config: &ShipyardConfig) -> Result<String> {
    toml::to_string_pretty(config).context("Failed to serialize configuration to TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config_str("").unwrap();
        assert_eq!(config.health.interval_secs, 5);
        assert_eq!(config.retention.keep_releases, 5);
        assert_eq!(config.reconcile.supervisor_command, vec!["supervisorctl"]);
    }

    #[test]
    fn parses_overrides() {
        let toml = r#"
deploy_user = "www-data"
link_mode = "copy"

[paths]
state_dir = "/srv/shipyard/state"

[health]
interval_secs = 2
timeout_secs = 30
failure_threshold = 4

[reconcile]
proxy_test_command = ["nginx", "-t"]
"#;

        let config = parse_config_str(toml).unwrap();
        assert_eq!(config.deploy_user.as_deref(), Some("www-data"));
        assert_eq!(config.link_mode, crate::fs::LinkMode::Copy);
        assert_eq!(config.health.failure_threshold, Some(4));
        assert_eq!(config.reconcile.proxy_test_command, vec!["nginx", "-t"]);
        assert_eq!(config.reconcile.retry_attempts, 3);
    }

    #[test]
    fn rejects_timeout_shorter_than_interval() {
        let err = parse_config_str("[health]\ninterval_secs = 10\ntimeout_secs = 5\n").unwrap_err();
        assert!(err.to_string().contains("timeout_secs"));
    }

    #[test]
    fn syntax_error_reports_line() {
        let err = parse_config_str("deploy_user = \"x\"\n[health\n").unwrap_err();
        assert!(err.to_string().contains("line 2"), "{}", err);
    }

    #[test]
    fn round_trips_through_toml() {
        let mut config = ShipyardConfig::new();
        config.retention.keep_releases = 8;
        let text = to_toml(&config).unwrap();
        assert_eq!(parse_config_str(&text).unwrap(), config);
    }
}
