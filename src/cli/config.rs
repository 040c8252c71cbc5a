use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::config::{AdapterConfig, AppConfig, RuleConfig};

/// 检查配置文件权限（仅Unix系统）
#[cfg(unix)]
pub fn check_config_file_permissions(config_path: &str) -> Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tracing::warn;

    let metadata = fs::metadata(config_path)
        .with_context(|| format!("Failed to read metadata for config file: {}", config_path))?;
    let mode = metadata.permissions().mode();

    // 其他用户或组用户可读（o+r / g+r）
    if mode & 0o044 != 0 {
        warn!(
            "Config file '{}' is readable by group or others (permissions: {:o}), \
             it may contain upstream credentials. Consider: chmod 600 {}",
            config_path,
            mode & 0o777,
            config_path
        );
    }

    Ok(())
}

/// Windows系统不进行权限检查
#[cfg(not(unix))]
pub fn check_config_file_permissions(_config_path: &str) -> Result<()> {
    Ok(())
}

#[derive(Serialize)]
struct CheckResult {
    valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    details: serde_json::Value,
}

/// Expand path with tilde (~) and make it absolute
pub fn expand_path(path: &str) -> Result<String> {
    let expanded = shellexpand::tilde(path);
    let path_buf = PathBuf::from(&*expanded);

    if path_buf.is_absolute() {
        Ok(expanded.into_owned())
    } else {
        std::env::current_dir()
            .context("Failed to get current directory")?
            .join(&path_buf)
            .to_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("Invalid path: {}", path))
    }
}

/// 配置中值得提醒但不致命的问题
fn collect_warnings(config: &AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.listeners.is_empty() {
        warnings.push("No listeners defined, nothing will accept connections".to_string());
    }
    for adapter in &config.adapters {
        if let AdapterConfig::Https {
            id,
            skip_verify: true,
            ..
        } = adapter
        {
            warnings.push(format!("Adapter '{}' skips TLS certificate verification", id));
        }
    }
    for (index, rule) in config.rules.iter().enumerate() {
        if let RuleConfig::Country { geoip_db, .. } = rule {
            match geoip_db {
                Some(path) if !Path::new(&*shellexpand::tilde(path)).exists() => warnings.push(
                    format!("Rule #{}: GeoIP database not found: {}", index + 1, path),
                ),
                None => warnings.push(format!("Rule #{}: no geoip_db, rule never matches", index + 1)),
                _ => {}
            }
        }
    }
    warnings
}

fn describe(config: &AppConfig) -> serde_json::Value {
    serde_json::json!({
        "listeners": config.listeners.iter().map(|l| l.name()).collect::<Vec<_>>(),
        "adapters": config
            .adapters
            .iter()
            .map(|a| serde_json::json!({ "id": a.id(), "kind": a.kind() }))
            .collect::<Vec<_>>(),
        "rules": config.rules.len(),
        "default_adapter": config.default_adapter,
        "historian_capacity": config.historian_capacity,
        "stats": config.stats.as_ref().map(|s| format!("{}:{}", s.bind_addr, s.port)),
    })
}

/// Check configuration file format
pub fn check_config(config_path: &str, format: &str) -> Result<()> {
    if !Path::new(config_path).exists() {
        if format == "json" {
            let result = CheckResult {
                valid: false,
                warnings: vec![],
                error: Some(format!("Configuration file not found: {}", config_path)),
                details: serde_json::json!({}),
            };
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            println!("✗ Configuration file not found: {}", config_path);
        }
        anyhow::bail!("Configuration file not found: {}", config_path);
    }

    match AppConfig::from_file(config_path) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            if format == "json" {
                let result = CheckResult {
                    valid: true,
                    warnings,
                    error: None,
                    details: describe(&config),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Checking configuration file: {}\n", config_path);
                for listener in &config.listeners {
                    println!("✓ Listener: {}", listener.name());
                }
                for adapter in &config.adapters {
                    println!("✓ Adapter: '{}' ({})", adapter.id(), adapter.kind());
                }
                println!("✓ Number of rules: {}", config.rules.len());
                if let Some(default) = &config.default_adapter {
                    println!("✓ Default adapter: {}", default);
                }
                for warning in &warnings {
                    println!("⚠ Warning: {}", warning);
                }
                println!("\n✓ Configuration is valid!");
            }
            Ok(())
        }
        Err(e) => {
            if format == "json" {
                let result = CheckResult {
                    valid: false,
                    warnings: vec![],
                    error: Some(format!("{:#}", e)),
                    details: serde_json::json!({}),
                };
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("✗ Configuration validation failed!");
                println!("\nError details:");
                println!("{:#}", e);

                println!("\nCommon issues:");
                println!("  1. Check TOML syntax (brackets, quotes, commas)");
                println!("  2. Every [[adapters]] and [[rules]] entry needs a `kind`");
                println!("  3. Rules and select pools may only reference defined adapter ids");
                println!("  4. Set default_adapter or end the rules with an `all` rule");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_relative_path() {
        let expanded = expand_path("proxy.toml").unwrap();
        assert!(Path::new(&expanded).is_absolute());
        assert!(expanded.ends_with("proxy.toml"));
    }

    #[test]
    fn test_warnings() {
        let config = AppConfig::from_toml(
            r#"
            default_adapter = "direct"
            [[adapters]]
            kind = "https"
            id = "tls"
            server = "example.net"
            port = 443
            skip_verify = true
        "#,
        )
        .unwrap();
        let warnings = collect_warnings(&config);
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1].contains("'tls'"));
    }

    #[test]
    fn test_check_missing_file() {
        assert!(check_config("/definitely/not/here.toml", "json").is_err());
    }
}
