//! Dispersy configuration

use std::fmt;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::DispersyError;
use crate::resilience::RateLimitConfig;

/// Default UDP port
pub const DEFAULT_PORT: u16 = 6421;

/// Configuration of a Dispersy instance
#[derive(Clone, Serialize, Deserialize)]
pub struct DispersyConfig {
    /// Path to the database file
    /// If None, uses `dispersy.db` inside the state directory
    pub db_path: Option<PathBuf>,

    /// State directory
    /// If None, uses `dispersy/` in the user's data directory
    pub state_dir: Option<PathBuf>,

    /// UDP port to bind
    /// Default: 6421
    pub port: u16,

    /// Bootstrap candidates every community may walk to
    pub bootstrap: Vec<SocketAddrV4>,

    /// Interval between walk steps (seconds)
    /// Default: 5
    pub walker_interval_secs: u64,

    /// Delay before the first walk step (seconds)
    /// Default: 1
    pub walker_initial_delay_secs: u64,

    /// Time to wait for an introduction response (seconds)
    /// Default: 5
    pub introduction_timeout_secs: u64,

    /// Time a timed out walk identifier stays reserved (seconds)
    /// Default: 10
    pub identifier_release_secs: u64,

    /// Interval between sync rounds (seconds)
    /// Default: 20
    pub sync_interval_secs: u64,

    /// Candidates receiving a sync request per round
    /// Default: 3
    pub sync_member_count: usize,

    /// Maximum bytes sent in reply to one sync request
    /// Default: 5 KiB
    pub sync_response_limit: usize,

    /// Bits per sync range Bloom filter
    /// Default: 8192
    pub bloom_bits: u32,

    /// Target false positive rate of a full sync range
    /// Default: 0.01
    pub bloom_error_rate: f64,

    /// Candidates silent this long are forgotten (seconds)
    /// Default: 1800
    pub candidate_cleanup_age_secs: u64,

    /// Time to wait for a signature response (seconds)
    /// Default: 10
    pub signature_timeout_secs: u64,

    /// Times an unanswered signature request is sent again
    /// Default: 0
    pub signature_retries: u8,

    /// Time a delayed packet waits for what it misses (seconds)
    /// Default: 10
    pub delayed_packet_timeout_secs: u64,

    /// How far beyond the community global time a message may claim to be
    /// Default: 10000
    pub acceptable_global_time_range: u64,

    /// Interval between maintenance rounds (seconds)
    /// Default: 5
    pub maintenance_interval_secs: u64,

    /// Age after which WAN address votes are discarded (seconds)
    /// Default: 300
    pub address_vote_age_secs: u64,

    /// Seed for the random source; None draws from the OS
    pub rng_seed: Option<u64>,

    /// Dropped packets tolerated per source within the window
    /// Default: 50
    pub max_drops_per_source: u32,

    /// Drop counting window (seconds)
    /// Default: 60
    pub drop_window_secs: u64,
}

impl fmt::Debug for DispersyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispersyConfig")
            .field("db_path", &self.db_path)
            .field("state_dir", &self.state_dir)
            .field("port", &self.port)
            .field("bootstrap", &self.bootstrap)
            .field("walker_interval_secs", &self.walker_interval_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("sync_member_count", &self.sync_member_count)
            .field("sync_response_limit", &self.sync_response_limit)
            .field("bloom_bits", &self.bloom_bits)
            .field("rng_seed", &self.rng_seed.map(|_| "[SET]"))
            .finish_non_exhaustive()
    }
}

impl Default for DispersyConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            state_dir: None,
            port: DEFAULT_PORT,
            bootstrap: Vec::new(),
            walker_interval_secs: 5,
            walker_initial_delay_secs: 1,
            introduction_timeout_secs: 5,
            identifier_release_secs: 10,
            sync_interval_secs: 20,
            sync_member_count: 3,
            sync_response_limit: 5 * 1024,
            bloom_bits: 8 * 1024,
            bloom_error_rate: 0.01,
            candidate_cleanup_age_secs: 30 * 60,
            signature_timeout_secs: 10,
            signature_retries: 0,
            delayed_packet_timeout_secs: 10,
            acceptable_global_time_range: 10_000,
            maintenance_interval_secs: 5,
            address_vote_age_secs: 300,
            rng_seed: None,
            max_drops_per_source: 50,
            drop_window_secs: 60,
        }
    }
}

impl DispersyConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database path
    pub fn with_db_path(mut self, path: PathBuf) -> Self {
        self.db_path = Some(path);
        self
    }

    /// Set the state directory
    pub fn with_state_dir(mut self, path: PathBuf) -> Self {
        self.state_dir = Some(path);
        self
    }

    /// Set the UDP port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add a bootstrap candidate
    pub fn with_bootstrap_candidate(mut self, address: SocketAddrV4) -> Self {
        if !self.bootstrap.contains(&address) {
            self.bootstrap.push(address);
        }
        self
    }

    /// Set bootstrap candidates (replaces existing)
    pub fn with_bootstrap(mut self, addresses: Vec<SocketAddrV4>) -> Self {
        self.bootstrap = addresses;
        self
    }

    /// Set the walker interval
    pub fn with_walker_interval(mut self, secs: u64) -> Self {
        self.walker_interval_secs = secs;
        self
    }

    /// Set the sync interval
    pub fn with_sync_interval(mut self, secs: u64) -> Self {
        self.sync_interval_secs = secs;
        self
    }

    /// Set the sync response byte limit
    pub fn with_sync_response_limit(mut self, bytes: usize) -> Self {
        self.sync_response_limit = bytes;
        self
    }

    /// Set the Bloom filter size of new sync ranges
    pub fn with_bloom_bits(mut self, bits: u32) -> Self {
        self.bloom_bits = bits;
        self
    }

    /// Set the signature request timeout
    pub fn with_signature_timeout(mut self, secs: u64) -> Self {
        self.signature_timeout_secs = secs;
        self
    }

    /// Set how often an unanswered signature request is repeated
    pub fn with_signature_retries(mut self, retries: u8) -> Self {
        self.signature_retries = retries;
        self
    }

    /// Seed the random source
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Configuration for testing (in-memory friendly, seeded, lenient limits)
    pub fn for_testing() -> Self {
        Self {
            port: 0,
            rng_seed: Some(0),
            max_drops_per_source: 1000,
            ..Self::default()
        }
    }

    /// State directory, falling back to the user's data directory
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("dispersy")
        })
    }

    /// Database path, falling back to the state directory
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.resolved_state_dir().join("dispersy.db"))
    }

    pub fn walker_interval(&self) -> Duration {
        Duration::from_secs(self.walker_interval_secs)
    }

    pub fn walker_initial_delay(&self) -> Duration {
        Duration::from_secs(self.walker_initial_delay_secs)
    }

    pub fn introduction_timeout(&self) -> Duration {
        Duration::from_secs(self.introduction_timeout_secs)
    }

    pub fn identifier_release(&self) -> Duration {
        Duration::from_secs(self.identifier_release_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn candidate_cleanup_age(&self) -> Duration {
        Duration::from_secs(self.candidate_cleanup_age_secs)
    }

    pub fn signature_timeout(&self) -> Duration {
        Duration::from_secs(self.signature_timeout_secs)
    }

    pub fn delayed_packet_timeout(&self) -> Duration {
        Duration::from_secs(self.delayed_packet_timeout_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn address_vote_age(&self) -> Duration {
        Duration::from_secs(self.address_vote_age_secs)
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            max_drops_per_source: self.max_drops_per_source,
            window_duration: Duration::from_secs(self.drop_window_secs),
            enabled: self.max_drops_per_source > 0,
        }
    }
}

/// Parse a bootstrap list: one `host, port` or `host:port` per line.
///
/// Blank lines and `#` comments are ignored. Host names are resolved and the
/// first IPv4 address is used.
pub fn parse_bootstrap(contents: &str) -> Result<Vec<SocketAddrV4>, DispersyError> {
    let mut addresses = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let (host, port) = match line.split_once(',') {
            Some((host, port)) => (host.trim(), port.trim()),
            None => line
                .rsplit_once(':')
                .map(|(h, p)| (h.trim(), p.trim()))
                .ok_or_else(|| DispersyError::InvalidInput(format!("line {}: missing port", number + 1)))?,
        };
        let port: u16 = port
            .parse()
            .map_err(|_| DispersyError::InvalidInput(format!("line {}: invalid port {}", number + 1, port)))?;
        let address = resolve_ipv4(host, port)
            .ok_or_else(|| DispersyError::InvalidInput(format!("line {}: cannot resolve {}", number + 1, host)))?;
        if !addresses.contains(&address) {
            addresses.push(address);
        }
    }
    Ok(addresses)
}

/// Read and parse a bootstrap file.
pub fn load_bootstrap_file(path: &Path) -> Result<Vec<SocketAddrV4>, DispersyError> {
    let contents = std::fs::read_to_string(path)?;
    parse_bootstrap(&contents)
}

fn resolve_ipv4(host: &str, port: u16) -> Option<SocketAddrV4> {
    if let Ok(ip) = host.parse() {
        return Some(SocketAddrV4::new(ip, port));
    }
    (host, port).to_socket_addrs().ok()?.find_map(|a| match a {
        SocketAddr::V4(v4) => Some(v4),
        SocketAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_default_config() {
        let config = DispersyConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.walker_interval(), Duration::from_secs(5));
        assert_eq!(config.sync_interval(), Duration::from_secs(20));
        assert_eq!(config.sync_response_limit, 5 * 1024);
        assert_eq!(config.bloom_bits, 8192);
        assert_eq!(config.candidate_cleanup_age(), Duration::from_secs(1800));
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn test_builder_pattern() {
        let address = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 6421);
        let config = DispersyConfig::new()
            .with_port(7000)
            .with_db_path(PathBuf::from("/tmp/test.db"))
            .with_bootstrap_candidate(address)
            .with_bootstrap_candidate(address)
            .with_sync_interval(1)
            .with_rng_seed(9);

        assert_eq!(config.port, 7000);
        assert_eq!(config.resolved_db_path(), PathBuf::from("/tmp/test.db"));
        assert_eq!(config.bootstrap, vec![address]);
        assert_eq!(config.sync_interval(), Duration::from_secs(1));
        assert_eq!(config.rng_seed, Some(9));
    }

    #[test]
    fn test_db_path_falls_back_to_state_dir() {
        let config = DispersyConfig::new().with_state_dir(PathBuf::from("/var/dispersy"));
        assert_eq!(config.resolved_db_path(), PathBuf::from("/var/dispersy/dispersy.db"));
    }

    #[test]
    fn test_debug_hides_seed() {
        let config = DispersyConfig::for_testing();
        let debug = format!("{:?}", config);
        assert!(debug.contains("[SET]"));
        assert!(!debug.contains("Some(0)"));
    }

    #[test]
    fn test_parse_bootstrap() {
        let contents = "\
# bootstrap peers
192.0.2.1, 6421
192.0.2.2:7000   # trailing comment

192.0.2.1,6421
";
        let addresses = parse_bootstrap(contents).unwrap();
        assert_eq!(
            addresses,
            vec![
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 6421),
                SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 2), 7000),
            ]
        );
    }

    #[test]
    fn test_parse_bootstrap_rejects_bad_lines() {
        assert!(parse_bootstrap("192.0.2.1").is_err());
        assert!(parse_bootstrap("192.0.2.1, port").is_err());
    }

    #[test]
    fn test_load_bootstrap_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bootstraptribler.txt");
        std::fs::write(&path, "127.0.0.1, 6421\n").unwrap();
        assert_eq!(
            load_bootstrap_file(&path).unwrap(),
            vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6421)]
        );
    }
}
