/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In
/// production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8420`).
    pub port: u16,
    /// Shared secret a worker must present to register.
    pub join_secret: String,
    /// Operator API key. When unset, operator endpoints are open
    /// (trusted-network deployments).
    pub operator_key: Option<String>,
    /// Terminal jobs older than this many hours are purged by the
    /// background sweep (default: `72`).
    pub purge_after_hours: i64,
    /// Interval between background sweeps in seconds (default: `300`).
    pub sweep_interval_secs: u64,
    /// A running job with no report for this many seconds is assumed
    /// orphaned and requeued (default: `600`).
    pub stale_after_secs: u64,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                    | Default          |
    /// |----------------------------|------------------|
    /// | `HOST`                     | `0.0.0.0`        |
    /// | `PORT`                     | `8420`           |
    /// | `ELARA_JOIN_SECRET`        | `elara-dev-only` |
    /// | `ELARA_OPERATOR_KEY`       | unset (open)     |
    /// | `ELARA_PURGE_AFTER_HOURS`  | `72`             |
    /// | `ELARA_SWEEP_INTERVAL_SECS`| `300`            |
    /// | `ELARA_STALE_AFTER_SECS`   | `600`            |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "8420".into())
            .parse()
            .expect("PORT must be a valid u16");

        let join_secret = std::env::var("ELARA_JOIN_SECRET").unwrap_or_else(|_| {
            tracing::warn!("ELARA_JOIN_SECRET not set, using the development default");
            "elara-dev-only".into()
        });

        let operator_key = std::env::var("ELARA_OPERATOR_KEY").ok();

        let purge_after_hours: i64 = std::env::var("ELARA_PURGE_AFTER_HOURS")
            .unwrap_or_else(|_| "72".into())
            .parse()
            .expect("ELARA_PURGE_AFTER_HOURS must be a valid i64");

        let sweep_interval_secs: u64 = std::env::var("ELARA_SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".into())
            .parse()
            .expect("ELARA_SWEEP_INTERVAL_SECS must be a valid u64");

        let stale_after_secs: u64 = std::env::var("ELARA_STALE_AFTER_SECS")
            .unwrap_or_else(|_| "600".into())
            .parse()
            .expect("ELARA_STALE_AFTER_SECS must be a valid u64");

        Self {
            host,
            port,
            join_secret,
            operator_key,
            purge_after_hours,
            sweep_interval_secs,
            stale_after_secs,
        }
    }
}
