use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};

use crate::control::Endpoint;

/// Upper bound on `RELAY_COUNT`.
pub const MAX_INSTANCES: u32 = 32;

const DEFAULT_CONTROL_HOST: &str = "127.0.0.1";
const DEFAULT_CONTROL_PORT_BASE: u16 = 9051;
const DEFAULT_DATA_DIR_BASE: &str = "/var/lib/tor-instances/relay";

/// What an instance reports about the origin of its traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Aggregated per-country client counts.
    #[default]
    ClientCount,
    /// Addresses of currently connected peers.
    PeerIp,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientCount => "client-count",
            Self::PeerIp => "peer-ip",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "client-count" => Ok(Self::ClientCount),
            "peer-ip" => Ok(Self::PeerIp),
            other => Err(anyhow!("unknown relay role {other:?}")),
        }
    }
}

/// One monitored relay process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// 1-based index.
    pub index: u32,
    pub endpoint: Endpoint,
    pub role: Role,
    /// Directory holding the instance's control credential.
    pub data_dir: PathBuf,
}

impl Instance {
    /// Tag written into snapshot rows produced by this instance.
    pub fn source_tag(&self) -> String {
        format!("relay-{}", self.index)
    }
}

/// Read and parse the instance file. The caller keeps its previous
/// configuration when this fails.
pub fn reload_config(path: &Path) -> Result<Vec<Instance>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading instance file {}", path.display()))?;
    parse_instances(&text).with_context(|| format!("parsing instance file {}", path.display()))
}

/// Parse `KEY=value` text into the configured instances.
pub fn parse_instances(text: &str) -> Result<Vec<Instance>> {
    let vars = parse_assignments(text);
    let get = |key: &str| vars.get(key).map(String::as_str).filter(|v| !v.is_empty());

    let count = match get("RELAY_COUNT") {
        Some(raw) => raw
            .parse::<u32>()
            .with_context(|| format!("RELAY_COUNT={raw:?}"))?,
        None => 1,
    };
    if count == 0 || count > MAX_INSTANCES {
        bail!("RELAY_COUNT must be between 1 and {MAX_INSTANCES}, got {count}");
    }

    let host = get("CONTROL_HOST").unwrap_or(DEFAULT_CONTROL_HOST);
    let port_base = match get("CONTROL_PORT_BASE") {
        Some(raw) => raw
            .parse::<u16>()
            .with_context(|| format!("CONTROL_PORT_BASE={raw:?}"))?,
        None => DEFAULT_CONTROL_PORT_BASE,
    };
    let dir_base = get("DATA_DIR_BASE").unwrap_or(DEFAULT_DATA_DIR_BASE);
    let default_role = match get("RELAY_ROLE") {
        Some(raw) => raw.parse::<Role>()?,
        None => Role::default(),
    };

    let mut instances = Vec::with_capacity(count as usize);
    for index in 1..=count {
        let port = match get(format!("CONTROL_PORT_{index}").as_str()) {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("CONTROL_PORT_{index}={raw:?}"))?,
            None => u16::try_from(u32::from(port_base) + index - 1)
                .map_err(|_| anyhow!("control port for instance {index} exceeds 65535"))?,
        };
        if port == 0 {
            bail!("control port for instance {index} must not be 0");
        }

        let data_dir = match get(format!("DATA_DIR_{index}").as_str()) {
            Some(dir) => PathBuf::from(dir),
            None => PathBuf::from(format!("{dir_base}{index}")),
        };

        let role = match get(format!("RELAY_ROLE_{index}").as_str()) {
            Some(raw) => raw.parse::<Role>()?,
            None => default_role,
        };

        instances.push(Instance {
            index,
            endpoint: Endpoint::new(host, port),
            role,
            data_dir,
        });
    }

    Ok(instances)
}

/// Collect `KEY=value` assignments. Comments, blank lines, an `export`
/// prefix and surrounding quotes are tolerated; later keys win.
fn parse_assignments(text: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        vars.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    vars
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = value
            .strip_prefix(quote)
            .and_then(|v| v.strip_suffix(quote))
        {
            return inner;
        }
    }
    value
}
