//! Runtime configuration surface.
//!
//! The whole surface deserializes from a single JSON file; every section and
//! field is optional and falls back to its default, so a minimal deployment
//! config only names the credentials and the receiver. `validate()` is the
//! startup gate: the orchestrator refuses to leave `Initializing` while it
//! reports violations.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::logging::LogLevel;

/// Capture scratch capacity in 32-bit words; fixed at init, never grown.
pub const SCRATCH_WORDS: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub wifi: WifiConfig,
    pub static_ip: Option<StaticIpConfig>,
    pub server: ServerConfig,
    pub tcp: TcpConfig,
    pub i2s: CaptureConfig,
    pub memory: MemoryConfig,
    pub rssi: SignalConfig,
    pub watchdog: WatchdogConfig,
    pub logger: LoggerConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    /// Delay between association retries.
    pub retry_delay_ms: u64,
    /// Retry budget before the supervisor enters safety backoff.
    pub max_retries: u32,
    /// Budget for a full association, used to size the watchdog margin.
    pub timeout_ms: u64,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: String::new(),
            password: String::new(),
            retry_delay_ms: 2000,
            max_retries: 20,
            timeout_ms: 30_000,
        }
    }
}

/// Optional fixed addressing; skips DHCP when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticIpConfig {
    pub ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub subnet: Ipv4Addr,
    pub dns: Ipv4Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
    pub backoff_jitter_pct: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 9000,
            reconnect_min_ms: 5000,
            reconnect_max_ms: 60_000,
            backoff_jitter_pct: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub write_timeout_ms: u64,
    /// Emit chunk size; must match the receiver's configured chunk size.
    pub chunk_bytes: usize,
    pub keepalive_idle_s: u32,
    pub keepalive_interval_s: u32,
    pub keepalive_count: u32,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            write_timeout_ms: 5000,
            chunk_bytes: 19_200,
            keepalive_idle_s: 5,
            keepalive_interval_s: 5,
            keepalive_count: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Base capture read size in bytes; the adaptive sizer shrinks reads
    /// below this, never above.
    pub buffer_bytes: usize,
    pub dma_buf_count: u32,
    pub dma_buf_len: u32,
    pub max_read_retries: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            buffer_bytes: 4096,
            dma_buf_count: 8,
            dma_buf_len: 256,
            max_read_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub warn_bytes: u32,
    pub critical_bytes: u32,
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            warn_bytes: 40 * 1024,
            critical_bytes: 20 * 1024,
            check_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    pub weak_threshold_dbm: i32,
    pub check_interval_ms: u64,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            weak_threshold_dbm: -80,
            check_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub timeout_s: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { timeout_s: 60 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub max_lines_per_sec: u32,
    pub burst_max: u32,
    pub min_level: LogLevel,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            max_lines_per_sec: 5,
            burst_max: 20,
            min_level: LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Nominal tick period; 10 ms gives the 100 Hz loop.
    pub tick_interval_ms: u64,
    pub error_recovery_delay_ms: u64,
    pub max_consecutive_errors: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 10,
            error_recovery_delay_ms: 5000,
            max_consecutive_errors: 10,
        }
    }
}

impl Config {
    /// Load from a JSON file; missing optional sections fall back to
    /// defaults.
    pub fn load(path: &Path) -> RelayResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&text)?;
        Ok(cfg)
    }

    /// Validate every bracketed constraint of the configuration surface.
    /// Returns all violations, not just the first, so an operator fixes the
    /// file in one pass.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut problems = Vec::new();

        if self.wifi.ssid.is_empty() {
            problems.push("wifi.ssid is empty".to_string());
        }
        if self.wifi.password.is_empty() {
            problems.push("wifi.password is empty".to_string());
        }

        if self.server.host.is_empty() {
            problems.push("server.host is empty".to_string());
        }
        if self.server.port == 0 {
            problems.push("server.port must be 1-65535".to_string());
        }
        if self.server.reconnect_min_ms == 0 {
            problems.push("server.reconnect_min_ms must be > 0".to_string());
        }
        if self.server.reconnect_max_ms < self.server.reconnect_min_ms {
            problems.push(format!(
                "server.reconnect_max_ms ({}) < server.reconnect_min_ms ({})",
                self.server.reconnect_max_ms, self.server.reconnect_min_ms
            ));
        }

        if self.tcp.write_timeout_ms == 0 {
            problems.push("tcp.write_timeout_ms must be > 0".to_string());
        }
        if self.tcp.chunk_bytes == 0 || self.tcp.chunk_bytes % 2 != 0 {
            problems.push(format!(
                "tcp.chunk_bytes ({}) must be a positive multiple of the sample width",
                self.tcp.chunk_bytes
            ));
        }

        if !(8000..=48_000).contains(&self.i2s.sample_rate) {
            problems.push(format!(
                "i2s.sample_rate ({}) outside 8000-48000 Hz",
                self.i2s.sample_rate
            ));
        }
        if self.i2s.buffer_bytes == 0 || !self.i2s.buffer_bytes.is_power_of_two() {
            problems.push(format!(
                "i2s.buffer_bytes ({}) must be a power of two",
                self.i2s.buffer_bytes
            ));
        }
        if self.i2s.buffer_bytes / 2 > SCRATCH_WORDS {
            problems.push(format!(
                "i2s.buffer_bytes ({}) exceeds the {}-word capture scratch",
                self.i2s.buffer_bytes, SCRATCH_WORDS
            ));
        }
        if self.i2s.dma_buf_count == 0 {
            problems.push("i2s.dma_buf_count must be > 0".to_string());
        }
        if self.i2s.dma_buf_len == 0 || !self.i2s.dma_buf_len.is_power_of_two() {
            problems.push(format!(
                "i2s.dma_buf_len ({}) must be a power of two",
                self.i2s.dma_buf_len
            ));
        }
        if self.i2s.max_read_retries == 0 {
            problems.push("i2s.max_read_retries must be > 0".to_string());
        }

        if self.memory.critical_bytes == 0 {
            problems.push("memory.critical_bytes must be > 0".to_string());
        }
        if self.memory.critical_bytes >= self.memory.warn_bytes {
            problems.push(format!(
                "memory.critical_bytes ({}) must be < memory.warn_bytes ({})",
                self.memory.critical_bytes, self.memory.warn_bytes
            ));
        }

        if self.rssi.weak_threshold_dbm >= 0 {
            problems.push(format!(
                "rssi.weak_threshold_dbm ({}) must be negative",
                self.rssi.weak_threshold_dbm
            ));
        }

        // The watchdog must outlast the longest uninterruptible window:
        // a full wireless association attempt plus error recovery, with
        // at least 5 s of margin.
        let watchdog_ms = self.watchdog.timeout_s as u64 * 1000;
        if watchdog_ms <= self.wifi.timeout_ms + 5000 {
            problems.push(format!(
                "watchdog.timeout_s ({}) too short for wifi timeout {} ms + 5 s margin",
                self.watchdog.timeout_s, self.wifi.timeout_ms
            ));
        }
        if watchdog_ms <= self.orchestrator.error_recovery_delay_ms {
            problems.push(format!(
                "watchdog.timeout_s ({}) does not exceed error recovery delay {} ms",
                self.watchdog.timeout_s, self.orchestrator.error_recovery_delay_ms
            ));
        }

        if self.orchestrator.tick_interval_ms == 0 {
            problems.push("orchestrator.tick_interval_ms must be > 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    /// Convenience wrapper mapping violations into the crate error type.
    pub fn validated(self) -> RelayResult<Self> {
        match self.validate() {
            Ok(()) => Ok(self),
            Err(problems) => Err(RelayError::Config(problems.join("; "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> Config {
        Config {
            wifi: WifiConfig {
                ssid: "AP".to_string(),
                password: "secret".to_string(),
                ..WifiConfig::default()
            },
            server: ServerConfig {
                host: "10.0.0.1".to_string(),
                ..ServerConfig::default()
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_defaults_fail_on_missing_credentials() {
        // The all-defaults config has no SSID, password, or host.
        let problems = Config::default().validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("wifi.ssid")));
        assert!(problems.iter().any(|p| p.contains("wifi.password")));
        assert!(problems.iter().any(|p| p.contains("server.host")));
    }

    #[test]
    fn test_memory_threshold_hierarchy_enforced() {
        let mut cfg = valid_config();
        cfg.memory.critical_bytes = 50 * 1024;
        cfg.memory.warn_bytes = 40 * 1024;

        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("memory.critical_bytes")));
    }

    #[test]
    fn test_backoff_bounds_enforced() {
        let mut cfg = valid_config();
        cfg.server.reconnect_min_ms = 10_000;
        cfg.server.reconnect_max_ms = 5000;

        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("reconnect_max_ms")));
    }

    #[test]
    fn test_sample_rate_range_enforced() {
        for rate in [7999u32, 48_001, 96_000] {
            let mut cfg = valid_config();
            cfg.i2s.sample_rate = rate;
            let problems = cfg.validate().unwrap_err();
            assert!(
                problems.iter().any(|p| p.contains("i2s.sample_rate")),
                "rate {rate} accepted"
            );
        }
        let mut cfg = valid_config();
        cfg.i2s.sample_rate = 8000;
        assert!(cfg.validate().is_ok());
        cfg.i2s.sample_rate = 48_000;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_buffer_must_be_power_of_two_and_fit_scratch() {
        let mut cfg = valid_config();
        cfg.i2s.buffer_bytes = 3000;
        assert!(cfg.validate().is_err());

        cfg.i2s.buffer_bytes = 16_384; // power of two but 8192 samples > scratch
        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("capture scratch")));

        cfg.i2s.buffer_bytes = 8192;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_rssi_threshold_must_be_negative() {
        let mut cfg = valid_config();
        cfg.rssi.weak_threshold_dbm = 30;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_watchdog_must_cover_wifi_timeout() {
        let mut cfg = valid_config();
        cfg.watchdog.timeout_s = 30; // wifi timeout is 30 s; needs 5 s margin
        let problems = cfg.validate().unwrap_err();
        assert!(problems.iter().any(|p| p.contains("watchdog.timeout_s")));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "wifi": { "ssid": "AP", "password": "pw" },
            "server": { "host": "10.0.0.1", "port": 9000 }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();

        assert_eq!(cfg.tcp.chunk_bytes, 19_200);
        assert_eq!(cfg.i2s.sample_rate, 16_000);
        assert_eq!(cfg.server.reconnect_min_ms, 5000);
        assert!(cfg.static_ip.is_none());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_static_ip_quad_parses() {
        let json = r#"{
            "wifi": { "ssid": "AP", "password": "pw" },
            "server": { "host": "10.0.0.1" },
            "static_ip": {
                "ip": "192.168.1.50",
                "gateway": "192.168.1.1",
                "subnet": "255.255.255.0",
                "dns": "1.1.1.1"
            }
        }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        let st = cfg.static_ip.expect("static quad missing");
        assert_eq!(st.ip, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(st.dns, Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "wifi": {{ "ssid": "AP", "password": "pw" }}, "server": {{ "host": "h" }} }}"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.wifi.ssid, "AP");
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
