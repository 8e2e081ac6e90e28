use std::time::Duration;

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Orchestrator base URL (default: `http://localhost:8420`).
    pub server_url: String,
    /// Name this worker registers under. Stable across restarts so the
    /// node keeps its identity.
    pub name: String,
    /// Shared secret presented at registration.
    pub join_secret: String,
    /// Delay between claim attempts when the queue is empty.
    pub poll_interval: Duration,
    /// Interval between rescans and progress reports while rendering.
    pub tick_interval: Duration,
    /// Safety limit on a graceful stop: if the current frame has not
    /// finished after this long, the render is killed anyway.
    pub graceful_timeout: Duration,
    /// How long an output file must sit unmodified before it counts
    /// as complete.
    pub quiet_period: Duration,
    /// Render tool executable (default: `Render`).
    pub render_exe: String,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default                 |
    /// |------------------------------|-------------------------|
    /// | `ELARA_SERVER`               | `http://localhost:8420` |
    /// | `ELARA_WORKER_NAME`          | `$HOSTNAME` or `worker` |
    /// | `ELARA_JOIN_SECRET`          | `elara-dev-only`        |
    /// | `ELARA_POLL_INTERVAL_SECS`   | `5`                     |
    /// | `ELARA_TICK_INTERVAL_SECS`   | `5`                     |
    /// | `ELARA_GRACEFUL_TIMEOUT_SECS`| `600`                   |
    /// | `ELARA_QUIET_PERIOD_MS`      | `2500`                  |
    /// | `ELARA_RENDER_EXE`           | `Render`                |
    pub fn from_env() -> Self {
        let server_url =
            std::env::var("ELARA_SERVER").unwrap_or_else(|_| "http://localhost:8420".into());

        let name = std::env::var("ELARA_WORKER_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "worker".into());

        let join_secret =
            std::env::var("ELARA_JOIN_SECRET").unwrap_or_else(|_| "elara-dev-only".into());

        let secs = |var: &str, default: u64| -> Duration {
            let value = std::env::var(var)
                .unwrap_or_else(|_| default.to_string())
                .parse()
                .unwrap_or_else(|_| panic!("{var} must be a valid u64"));
            Duration::from_secs(value)
        };

        let quiet_ms: u64 = std::env::var("ELARA_QUIET_PERIOD_MS")
            .unwrap_or_else(|_| "2500".into())
            .parse()
            .expect("ELARA_QUIET_PERIOD_MS must be a valid u64");

        let render_exe = std::env::var("ELARA_RENDER_EXE").unwrap_or_else(|_| "Render".into());

        Self {
            server_url,
            name,
            join_secret,
            poll_interval: secs("ELARA_POLL_INTERVAL_SECS", 5),
            tick_interval: secs("ELARA_TICK_INTERVAL_SECS", 5),
            graceful_timeout: secs("ELARA_GRACEFUL_TIMEOUT_SECS", 600),
            quiet_period: Duration::from_millis(quiet_ms),
            render_exe,
        }
    }
}
