use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::config::GeoConfig;

const GEOIPLOOKUP: &str = "geoiplookup";
const MMDBLOOKUP: &str = "mmdblookup";

/// A local geographic database tool, invoked once per address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeoTool {
    /// `geoiplookup <ip>` against the legacy GeoIP country database.
    GeoIpLookup { program: PathBuf },
    /// `mmdblookup --file <db> --ip <ip> country iso_code`.
    MmdbLookup { program: PathBuf, database: PathBuf },
}

impl GeoTool {
    /// Whether `name` is a tool this resolver knows how to drive.
    pub fn is_supported(name: &str) -> bool {
        matches!(name, GEOIPLOOKUP | MMDBLOOKUP)
    }

    /// Probe `PATH` once for every configured tool, in configured order.
    /// Tools that are missing, or whose database is missing, are skipped.
    pub fn from_config(cfg: &GeoConfig) -> Vec<GeoTool> {
        let mut tools = Vec::with_capacity(cfg.tools.len());

        for name in &cfg.tools {
            let Some(program) = locate(name) else {
                debug!(tool = %name, "geo tool not found on PATH, skipping");
                continue;
            };

            match name.as_str() {
                GEOIPLOOKUP => tools.push(GeoTool::GeoIpLookup { program }),
                MMDBLOOKUP => {
                    if !cfg.mmdb_path.is_file() {
                        debug!(
                            database = %cfg.mmdb_path.display(),
                            "mmdb database missing, skipping mmdblookup",
                        );
                        continue;
                    }
                    tools.push(GeoTool::MmdbLookup {
                        program,
                        database: cfg.mmdb_path.clone(),
                    });
                }
                _ => {}
            }
        }

        tools
    }

    pub fn name(&self) -> &'static str {
        match self {
            GeoTool::GeoIpLookup { .. } => GEOIPLOOKUP,
            GeoTool::MmdbLookup { .. } => MMDBLOOKUP,
        }
    }

    /// Run the tool for `ip`. Any failure, including a timeout, a non-zero
    /// exit status or an unparseable answer, yields `None`.
    pub async fn lookup(&self, ip: Ipv4Addr, timeout: Duration) -> Option<String> {
        let ip_arg = ip.to_string();
        let mut cmd = match self {
            GeoTool::GeoIpLookup { program } => {
                let mut cmd = Command::new(program);
                cmd.arg(&ip_arg);
                cmd
            }
            GeoTool::MmdbLookup { program, database } => {
                let mut cmd = Command::new(program);
                cmd.arg("--file")
                    .arg(database)
                    .arg("--ip")
                    .arg(&ip_arg)
                    .args(["country", "iso_code"]);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                debug!(tool = self.name(), ip = %ip, error = %e, "geo tool failed to start");
                return None;
            }
            Err(_) => {
                debug!(tool = self.name(), ip = %ip, "geo tool timed out");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match self {
            GeoTool::GeoIpLookup { .. } => parse_geoiplookup(&stdout),
            GeoTool::MmdbLookup { .. } => parse_mmdblookup(&stdout),
        }
    }
}

/// Extract the country code from `geoiplookup` output such as
/// `GeoIP Country Edition: DE, Germany`.
pub fn parse_geoiplookup(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("Country Edition:")?;
        let rest = rest.trim();
        if rest.contains("not found") || rest.starts_with("IP Address") {
            return None;
        }
        let code = rest.split(',').next()?.trim();
        if code.is_empty() || code == "--" {
            return None;
        }
        Some(code.to_string())
    })
}

/// Extract the first quoted string from `mmdblookup` output such as
/// `  "DE" <utf8_string>`.
pub fn parse_mmdblookup(output: &str) -> Option<String> {
    let start = output.find('"')? + 1;
    let len = output[start..].find('"')?;
    let value = output[start..start + len].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Resolve `name` to an executable, searching `PATH` for bare names.
fn locate(name: &str) -> Option<PathBuf> {
    which::which(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_tools() {
        assert!(GeoTool::is_supported("geoiplookup"));
        assert!(GeoTool::is_supported("mmdblookup"));
        assert!(!GeoTool::is_supported("whois"));
    }

    #[test]
    fn test_parse_geoiplookup() {
        assert_eq!(
            parse_geoiplookup("GeoIP Country Edition: DE, Germany\n"),
            Some("DE".to_string())
        );
        assert_eq!(
            parse_geoiplookup("GeoIP Country Edition: IP Address not found\n"),
            None
        );
        assert_eq!(parse_geoiplookup("garbage\n"), None);
    }

    #[test]
    fn test_parse_mmdblookup() {
        let out = "\n  \"FR\" <utf8_string>\n\n";
        assert_eq!(parse_mmdblookup(out), Some("FR".to_string()));
        assert_eq!(parse_mmdblookup("\n  Could not find an entry\n"), None);
        assert_eq!(parse_mmdblookup("\"\""), None);
    }

    #[test]
    fn test_from_config_skips_missing_tools() {
        let cfg = GeoConfig {
            tools: vec!["geoiplookup-definitely-missing".to_string()],
            ..GeoConfig::default()
        };
        assert!(GeoTool::from_config(&cfg).is_empty());
    }

    #[test]
    fn test_mmdb_skipped_without_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = GeoConfig {
            tools: vec!["mmdblookup".to_string()],
            mmdb_path: dir.path().join("missing.mmdb"),
            ..GeoConfig::default()
        };
        assert!(GeoTool::from_config(&cfg).is_empty());
    }

    #[test]
    fn test_locate_requires_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let program = dir.path().join("geoiplookup");
        std::fs::write(&program, "#!/bin/sh\n").expect("write");
        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o644))
            .expect("chmod");
        let name = program.to_str().expect("utf-8 path");
        assert_eq!(locate(name), None);

        std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        assert!(locate(name).is_some());
    }

    #[tokio::test]
    async fn test_lookup_missing_program_is_none() {
        let tool = GeoTool::GeoIpLookup {
            program: PathBuf::from("/nonexistent/geoiplookup"),
        };
        assert_eq!(
            tool.lookup(Ipv4Addr::new(1, 1, 1, 1), Duration::from_secs(1))
                .await,
            None
        );
    }
}
