pub mod credential;
pub mod parse;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

pub use credential::{Credential, CredentialCache};
use parse::{Reply, ReplyReader};

/// Value returned by `ip-to-country` when the relay has no answer.
const UNKNOWN_COUNTRY_CODE: &str = "??";

/// Control-channel failures.
///
/// Every variant is contained to a single instance for a single cycle.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control transport unavailable at {endpoint}: {source}")]
    TransportUnavailable {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("reading credential {}: {source}", path.display())]
    CredentialUnavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("credential file {} is empty", path.display())]
    EmptyCredential { path: PathBuf },

    #[error("authentication rejected by {endpoint}: {message}")]
    AuthenticationFailure { endpoint: Endpoint, message: String },

    #[error("control query to {endpoint} timed out after {timeout:?}")]
    Timeout { endpoint: Endpoint, timeout: Duration },

    #[error("control connection to {endpoint} failed: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("{endpoint} closed the connection after {received} of {expected} replies")]
    Truncated {
        endpoint: Endpoint,
        received: usize,
        expected: usize,
    },

    #[error("{endpoint} rejected {command:?}: {code} {message}")]
    Rejected {
        endpoint: Endpoint,
        command: String,
        code: u16,
        message: String,
    },

    #[error("{endpoint} sent an unusable {what}: {detail}")]
    Malformed {
        endpoint: Endpoint,
        what: &'static str,
        detail: String,
    },
}

impl ControlError {
    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransportUnavailable { .. } => "transport_unavailable",
            Self::CredentialUnavailable { .. }
            | Self::EmptyCredential { .. }
            | Self::AuthenticationFailure { .. } => "authentication",
            Self::Timeout { .. } => "timeout",
            Self::Io { .. } | Self::Truncated { .. } => "io",
            Self::Rejected { .. } => "rejected",
            Self::Malformed { .. } => "malformed",
        }
    }

    /// True when the cached credential for the instance must be dropped.
    pub fn invalidates_credential(&self) -> bool {
        matches!(
            self,
            Self::CredentialUnavailable { .. }
                | Self::EmptyCredential { .. }
                | Self::AuthenticationFailure { .. }
        )
    }
}

/// Loopback control endpoint of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Monotonic traffic counters reported by one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficTotals {
    pub read: u64,
    pub written: u64,
}

/// Connected-client count for one country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryCount {
    pub country: String,
    pub clients: u64,
}

/// Information that can be requested from an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Traffic,
    CountrySummary,
    Peers,
}

impl Query {
    /// Wire command for this query.
    pub fn command(self) -> &'static str {
        match self {
            Self::Traffic => "GETINFO traffic/read traffic/written",
            Self::CountrySummary => "GETINFO status/clients-seen",
            Self::Peers => "GETINFO orconn-status",
        }
    }
}

/// Typed results of one [`ControlClient::poll`] round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readings {
    pub traffic: Option<TrafficTotals>,
    pub countries: Option<Vec<CountryCount>>,
    pub peers: Option<Vec<Ipv4Addr>>,
}

/// Short-lived-connection client for the control channel.
#[derive(Debug, Clone)]
pub struct ControlClient {
    timeout: Duration,
}

impl ControlClient {
    /// Create a client whose round trips are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Authenticate, send `commands`, send QUIT, and return one reply per
    /// command.
    pub async fn query(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        commands: &[&str],
    ) -> Result<Vec<Reply>, ControlError> {
        match tokio::time::timeout(self.timeout, round_trip(endpoint, credential, commands)).await
        {
            Ok(result) => result,
            Err(_) => Err(ControlError::Timeout {
                endpoint: endpoint.clone(),
                timeout: self.timeout,
            }),
        }
    }

    /// Run the given typed queries in a single round trip.
    pub async fn poll(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        queries: &[Query],
    ) -> Result<Readings, ControlError> {
        let commands: Vec<&str> = queries.iter().map(|q| q.command()).collect();
        let replies = self.query(endpoint, credential, &commands).await?;

        let mut readings = Readings::default();
        for (query, reply) in queries.iter().zip(replies.iter()) {
            if !reply.is_ok() {
                return Err(ControlError::Rejected {
                    endpoint: endpoint.clone(),
                    command: query.command().to_string(),
                    code: reply.code(),
                    message: reply.message().to_string(),
                });
            }

            match query {
                Query::Traffic => {
                    let totals = parse_traffic(reply).map_err(|detail| ControlError::Malformed {
                        endpoint: endpoint.clone(),
                        what: "traffic reply",
                        detail,
                    })?;
                    readings.traffic = Some(totals);
                }
                Query::CountrySummary => {
                    let summary = reply.value("status/clients-seen").unwrap_or("");
                    readings.countries = Some(parse_country_summary(summary));
                }
                Query::Peers => {
                    readings.peers = Some(extract_peer_addrs(
                        reply.text_lines("orconn-status").into_iter(),
                    ));
                }
            }
        }

        Ok(readings)
    }

    /// Ask the instance's built-in address table for the country of each
    /// address. Addresses without a usable answer are absent from the map.
    pub async fn lookup_countries(
        &self,
        endpoint: &Endpoint,
        credential: &Credential,
        ips: &[Ipv4Addr],
    ) -> Result<HashMap<Ipv4Addr, String>, ControlError> {
        if ips.is_empty() {
            return Ok(HashMap::new());
        }

        let mut command = String::from("GETINFO");
        for ip in ips {
            command.push_str(" ip-to-country/");
            command.push_str(&ip.to_string());
        }

        let replies = self.query(endpoint, credential, &[command.as_str()]).await?;
        let mut out = HashMap::with_capacity(ips.len());

        // A relay rejects the whole batch when any key is unknown to it; the
        // caller then falls back to local tools for every address.
        if let Some(reply) = replies.first().filter(|r| r.is_ok()) {
            for (key, value) in reply.entries() {
                let Some(ip) = key
                    .strip_prefix("ip-to-country/")
                    .and_then(|s| s.parse::<Ipv4Addr>().ok())
                else {
                    continue;
                };
                let value = value.trim();
                if value.is_empty() || value == UNKNOWN_COUNTRY_CODE {
                    continue;
                }
                out.insert(ip, value.to_string());
            }
        }

        Ok(out)
    }
}

async fn round_trip(
    endpoint: &Endpoint,
    credential: &Credential,
    commands: &[&str],
) -> Result<Vec<Reply>, ControlError> {
    let stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|source| match source.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::NotFound
            | io::ErrorKind::PermissionDenied => ControlError::TransportUnavailable {
                endpoint: endpoint.clone(),
                source,
            },
            _ => ControlError::Io {
                endpoint: endpoint.clone(),
                source,
            },
        })?;

    let io_err = |source: io::Error| ControlError::Io {
        endpoint: endpoint.clone(),
        source,
    };

    let (read_half, mut write_half) = stream.into_split();

    let mut request = format!("AUTHENTICATE {}\r\n", credential.as_hex());
    for command in commands {
        request.push_str(command.trim());
        request.push_str("\r\n");
    }
    request.push_str("QUIT\r\n");

    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(io_err)?;
    write_half.flush().await.map_err(io_err)?;

    // AUTHENTICATE + commands + QUIT
    let expected = commands.len() + 2;
    let mut replies: Vec<Reply> = Vec::with_capacity(expected);
    let mut reader = BufReader::new(read_half);
    let mut assembler = ReplyReader::new();
    let mut buf = Vec::with_capacity(256);

    while replies.len() < expected {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }

        let line = String::from_utf8_lossy(&buf);
        match assembler.feed(&line) {
            Ok(Some(reply)) => {
                // The first reply answers AUTHENTICATE (514/515 on rejection).
                if replies.is_empty() && !reply.is_ok() {
                    return Err(ControlError::AuthenticationFailure {
                        endpoint: endpoint.clone(),
                        message: format!("{} {}", reply.code(), reply.message()),
                    });
                }
                replies.push(reply);
            }
            Ok(None) => {}
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "ignoring malformed control reply line");
            }
        }
    }

    // The QUIT acknowledgement is optional; everything before it is not.
    if replies.len() < commands.len() + 1 {
        if replies.is_empty() {
            return Err(ControlError::AuthenticationFailure {
                endpoint: endpoint.clone(),
                message: "connection closed before authentication reply".to_string(),
            });
        }
        return Err(ControlError::Truncated {
            endpoint: endpoint.clone(),
            received: replies.len(),
            expected,
        });
    }

    Ok(replies
        .into_iter()
        .skip(1)
        .take(commands.len())
        .collect())
}

/// Extract read/written totals from a traffic reply.
pub fn parse_traffic(reply: &Reply) -> Result<TrafficTotals, String> {
    let field = |key: &str| -> Result<u64, String> {
        let raw = reply
            .value(key)
            .ok_or_else(|| format!("missing {key}"))?;
        raw.trim()
            .parse::<u64>()
            .map_err(|e| format!("{key}={raw:?}: {e}"))
    };

    Ok(TrafficTotals {
        read: field("traffic/read")?,
        written: field("traffic/written")?,
    })
}

/// Parse a comma-separated `cc=count` list.
///
/// Accepts either the bare list or a space-separated status value carrying
/// it in a `CountrySummary=` token. Pairs that are not a plain country code
/// and a count are skipped. Codes are upper-cased and repeated codes are
/// summed.
pub fn parse_country_summary(value: &str) -> Vec<CountryCount> {
    let list = value
        .split_whitespace()
        .find_map(|token| token.strip_prefix("CountrySummary="))
        .unwrap_or(value.trim());

    let mut out: Vec<CountryCount> = Vec::new();
    for pair in list.split(',') {
        let Some((country, count)) = pair.split_once('=') else {
            continue;
        };
        let country = country.trim();
        if country.is_empty() || !country.chars().all(|c| c.is_ascii_alphanumeric()) {
            continue;
        }
        let country = crate::geo::country_key(country);
        let Ok(clients) = count.trim().parse::<u64>() else {
            continue;
        };

        match out.iter_mut().find(|c| c.country == country) {
            Some(existing) => existing.clients = existing.clients.saturating_add(clients),
            None => out.push(CountryCount { country, clients }),
        }
    }
    out
}

/// Collect the distinct IPv4 addresses embedded in `lines`, sorted
/// ascending. Loopback, unspecified and broadcast addresses are dropped.
pub fn extract_peer_addrs<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<Ipv4Addr> {
    let mut seen = BTreeSet::new();
    for line in lines {
        for token in line.split(|c: char| !(c.is_ascii_digit() || c == '.')) {
            let token = token.trim_matches('.');
            if token.split('.').count() != 4 {
                continue;
            }
            if let Ok(ip) = token.parse::<Ipv4Addr>() {
                if !(ip.is_loopback() || ip.is_unspecified() || ip.is_broadcast()) {
                    seen.insert(ip);
                }
            }
        }
    }
    seen.into_iter().collect()
}

/// Parse a dotted-quad IPv4 address, rejecting anything else.
pub fn parse_dotted_quad(s: &str) -> Option<Ipv4Addr> {
    let s = s.trim();
    if s.split('.').count() != 4 {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn credential() -> Credential {
        Credential::from_bytes(&[0xde, 0xad, 0xbe, 0xef])
    }

    /// Spawn a one-shot fake relay that checks the credential and answers
    /// every request with `answer`.
    async fn fake_relay(answer: &'static str) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = vec![0u8; 4096];
            let mut received = String::new();
            while !received.contains("QUIT\r\n") {
                let n = socket.read(&mut buf).await.expect("read");
                if n == 0 {
                    return;
                }
                received.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            if received.starts_with("AUTHENTICATE deadbeef\r\n") {
                socket.write_all(b"250 OK\r\n").await.expect("write");
                socket.write_all(answer.as_bytes()).await.expect("write");
                socket
                    .write_all(b"250 closing connection\r\n")
                    .await
                    .expect("write");
            } else {
                socket
                    .write_all(b"515 Authentication failed: Wrong length\r\n")
                    .await
                    .expect("write");
            }
        });

        Endpoint::new("127.0.0.1", port)
    }

    #[tokio::test]
    async fn test_poll_traffic_and_country_summary() {
        let endpoint = fake_relay(
            "250-traffic/read=1600\r\n250-traffic/written=900\r\n250 OK\r\n\
             250-status/clients-seen=TimeStarted=\"2024-06-01 00:00:00\" CountrySummary=ir=10,cn=5 TransportSummary=obfs4=15\r\n250 OK\r\n",
        )
        .await;

        let client = ControlClient::new(Duration::from_secs(2));
        let readings = client
            .poll(
                &endpoint,
                &credential(),
                &[Query::Traffic, Query::CountrySummary],
            )
            .await
            .expect("poll succeeds");

        assert_eq!(
            readings.traffic,
            Some(TrafficTotals {
                read: 1600,
                written: 900
            })
        );
        assert_eq!(
            readings.countries,
            Some(vec![
                CountryCount {
                    country: "IR".to_string(),
                    clients: 10
                },
                CountryCount {
                    country: "CN".to_string(),
                    clients: 5
                },
            ])
        );
        assert_eq!(readings.peers, None);
    }

    #[tokio::test]
    async fn test_poll_peers_from_data_block() {
        let endpoint = fake_relay(
            "250+orconn-status=\r\n$AAAA~a CONNECTED\r\n1.2.3.4:9001 CONNECTED\r\n5.6.7.8:443 CONNECTED\r\n1.2.3.4:9002 CONNECTED\r\n127.0.0.1:9050 CONNECTED\r\n.\r\n250 OK\r\n",
        )
        .await;

        let client = ControlClient::new(Duration::from_secs(2));
        let readings = client
            .poll(&endpoint, &credential(), &[Query::Peers])
            .await
            .expect("poll succeeds");

        assert_eq!(
            readings.peers,
            Some(vec![Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)])
        );
    }

    #[tokio::test]
    async fn test_authentication_failure() {
        let endpoint = fake_relay("250 OK\r\n").await;
        let client = ControlClient::new(Duration::from_secs(2));
        let wrong = Credential::from_bytes(&[0x01]);

        let err = client
            .poll(&endpoint, &wrong, &[Query::Traffic])
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ControlError::AuthenticationFailure { .. }));
        assert!(err.invalidates_credential());
        assert_eq!(err.kind(), "authentication");
    }

    #[tokio::test]
    async fn test_rejected_query() {
        let endpoint = fake_relay("552 Unrecognized key \"traffic/read\"\r\n").await;
        let client = ControlClient::new(Duration::from_secs(2));

        let err = client
            .poll(&endpoint, &credential(), &[Query::Traffic])
            .await
            .expect_err("must be rejected");
        assert!(matches!(err, ControlError::Rejected { code: 552, .. }));
        assert!(!err.invalidates_credential());
    }

    #[tokio::test]
    async fn test_lookup_countries_skips_unknown() {
        let endpoint = fake_relay(
            "250-ip-to-country/1.2.3.4=de\r\n250-ip-to-country/5.6.7.8=??\r\n250 OK\r\n",
        )
        .await;
        let client = ControlClient::new(Duration::from_secs(2));

        let found = client
            .lookup_countries(
                &endpoint,
                &credential(),
                &[Ipv4Addr::new(1, 2, 3, 4), Ipv4Addr::new(5, 6, 7, 8)],
            )
            .await
            .expect("lookup succeeds");

        assert_eq!(found.len(), 1);
        assert_eq!(found.get(&Ipv4Addr::new(1, 2, 3, 4)).map(String::as_str), Some("de"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_unavailable() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let client = ControlClient::new(Duration::from_secs(2));
        let err = client
            .poll(&Endpoint::new("127.0.0.1", port), &credential(), &[Query::Traffic])
            .await
            .expect_err("nothing listens");
        assert_eq!(err.kind(), "transport_unavailable");
    }

    #[tokio::test]
    async fn test_timeout_bounds_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.expect("accept");
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = ControlClient::new(Duration::from_millis(200));
        let err = client
            .poll(&Endpoint::new("127.0.0.1", port), &credential(), &[Query::Traffic])
            .await
            .expect_err("must time out");
        assert!(matches!(err, ControlError::Timeout { .. }));
    }

    #[test]
    fn test_parse_country_summary_variants() {
        let bare = parse_country_summary("ir=10,cn=5");
        assert_eq!(bare.len(), 2);
        assert_eq!(bare[0].clients, 10);

        let noisy = parse_country_summary(" de=3, bogus, fr=x, ??=4, de=2 ,us=1");
        assert_eq!(
            noisy,
            vec![
                CountryCount {
                    country: "DE".to_string(),
                    clients: 5
                },
                CountryCount {
                    country: "US".to_string(),
                    clients: 1
                },
            ]
        );

        assert!(parse_country_summary("").is_empty());
    }

    #[test]
    fn test_extract_peer_addrs_rejects_non_quads() {
        let peers = extract_peer_addrs(
            ["10.0.0.1:443", "999.1.1.1", "1.2.3", "v1.2.3.4.5", "0.0.0.0", "8.8.8.8."].into_iter(),
        );
        assert_eq!(
            peers,
            vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(10, 0, 0, 1)]
        );
    }

    #[test]
    fn test_parse_dotted_quad() {
        assert_eq!(parse_dotted_quad("1.2.3.4"), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(parse_dotted_quad(" 1.2.3.4 "), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(parse_dotted_quad("1.2.3"), None);
        assert_eq!(parse_dotted_quad("::1"), None);
        assert_eq!(parse_dotted_quad("example.com"), None);
        assert_eq!(parse_dotted_quad("256.1.1.1"), None);
    }
}
