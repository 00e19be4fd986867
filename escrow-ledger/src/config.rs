//! Configuration for the escrow ledger

use crate::types::UserId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Metrics listen address
    pub metrics_listen_addr: String,

    /// Bounded mailbox size of the writer actor
    pub mailbox_capacity: usize,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Escrow policy
    pub escrow: EscrowConfig,

    /// Timeout sweeper
    pub sweeper: SweeperConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/escrow"),
            service_name: "escrow-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_listen_addr: "0.0.0.0:9090".to_string(),
            mailbox_capacity: 1000,
            rocksdb: RocksDBConfig::default(),
            escrow: EscrowConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Escrow policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowConfig {
    /// Wallet owner that receives service fees
    pub platform_user_id: String,

    /// Service fee in basis points of the order total
    pub service_fee_bps: u32,

    /// Largest order total accepted by `hold`
    pub max_order_amount: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            platform_user_id: "platform".to_string(),
            service_fee_bps: 500, // 5%
            max_order_amount: 100_000_000_000,
        }
    }
}

impl EscrowConfig {
    /// Fee account owner
    pub fn platform_user(&self) -> UserId {
        UserId::new(self.platform_user_id.clone())
    }

    /// Service fee for an order total, rounded down
    pub fn service_fee_for(&self, total_amount: u64) -> u64 {
        ((total_amount as u128 * self.service_fee_bps as u128) / 10_000) as u64
    }
}

/// Timeout sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Run the sweeper in the server
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// DELIVERED orders older than this are released to the seller
    pub auto_complete_after_hours: u64,

    /// PENDING orders older than this are cancelled and refunded
    pub pending_timeout_mins: u64,
}

/// Longest accepted sweeper timeout, one year
const MAX_SWEEPER_TIMEOUT_SECS: u64 = 365 * 24 * 60 * 60;

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            auto_complete_after_hours: 72,
            pending_timeout_mins: 30,
        }
    }
}

impl SweeperConfig {
    /// Age after which a DELIVERED order is auto-completed
    pub fn delivered_timeout(&self) -> crate::Result<chrono::Duration> {
        Self::timeout(
            "auto_complete_after_hours",
            self.auto_complete_after_hours.checked_mul(60 * 60),
        )
    }

    /// Age after which a PENDING order is cancelled
    pub fn pending_timeout(&self) -> crate::Result<chrono::Duration> {
        Self::timeout("pending_timeout_mins", self.pending_timeout_mins.checked_mul(60))
    }

    fn timeout(name: &str, secs: Option<u64>) -> crate::Result<chrono::Duration> {
        match secs {
            Some(secs) if secs > 0 && secs <= MAX_SWEEPER_TIMEOUT_SECS => {
                chrono::Duration::from_std(std::time::Duration::from_secs(secs))
                    .map_err(|e| crate::Error::Config(format!("sweeper.{}: {}", name, e)))
            }
            _ => Err(crate::Error::Config(format!(
                "sweeper.{} must be positive and at most one year",
                name
            ))),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ESCROW_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(addr) = std::env::var("ESCROW_METRICS_ADDR") {
            config.metrics_listen_addr = addr;
        }

        if let Ok(user) = std::env::var("ESCROW_PLATFORM_USER") {
            config.escrow.platform_user_id = user;
        }

        if let Ok(bps) = std::env::var("ESCROW_SERVICE_FEE_BPS") {
            config.escrow.service_fee_bps = bps.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid ESCROW_SERVICE_FEE_BPS '{}': {}", bps, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the ledger cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.escrow.service_fee_bps >= 10_000 {
            return Err(crate::Error::Config(format!(
                "service_fee_bps must be below 10000, got {}",
                self.escrow.service_fee_bps
            )));
        }
        if self.escrow.platform_user_id.is_empty() {
            return Err(crate::Error::Config(
                "platform_user_id must not be empty".to_string(),
            ));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweeper.interval_secs must be positive".to_string(),
            ));
        }
        self.sweeper.delivered_timeout()?;
        self.sweeper.pending_timeout()?;
        if self.mailbox_capacity == 0 {
            return Err(crate::Error::Config(
                "mailbox_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
