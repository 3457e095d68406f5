use clap::{Parser, ValueEnum};
use once_cell::sync::OnceCell;

/// Runtime environment; affects the safety rails in [`crate::preflight`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        };
        f.write_str(s)
    }
}

/// Environment-bound options shared by every subcommand.
#[derive(Debug, Clone, Parser)]
pub struct CoreOptions {
    #[arg(long, env = "ENVIRONMENT", value_enum, default_value_t = Environment::Development)]
    pub environment: Environment,

    #[arg(long, env = "DRY_RUN", default_value_t = false)]
    pub dry_run: bool,

    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[arg(long, env = "CC_API_BASE_URL")]
    pub api_base_url: String,

    #[arg(long, env = "CC_API_KEY")]
    pub api_key: String,

    #[arg(long, env = "ETL_BATCH_SIZE", default_value_t = 1000)]
    pub batch_size: usize,

    #[arg(long, env = "ETL_MAX_PARALLEL", default_value_t = 5)]
    pub max_parallel: usize,

    #[arg(long, env = "ETL_TIMEOUT_SECONDS", default_value_t = 300)]
    pub timeout_seconds: u64,

    #[arg(long, env = "API_RATE_LIMIT_RPS", default_value_t = 10.0)]
    pub rate_limit_rps: f64,

    #[arg(long, env = "API_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "ETL_RETRY_DELAY_SECONDS", default_value_t = 5)]
    pub retry_delay_seconds: u64,

    #[arg(long, env = "API_REQUEST_TIMEOUT_SECONDS", default_value_t = 30)]
    pub request_timeout_seconds: u64,

    #[arg(long, env = "API_MAX_PAGES", default_value_t = 10_000)]
    pub max_pages: u64,

    #[arg(long, env = "API_MAX_RECORDS")]
    pub max_records: Option<u64>,

    #[arg(long, env = "ETL_STUCK_RUN_THRESHOLD_HOURS", default_value_t = 24)]
    pub stuck_run_threshold_hours: u64,
}

/// Resolved process settings, immutable after startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub environment: Environment,
    pub dry_run: bool,
    pub database_url: String,
    pub api_base_url: String,
    pub api_key: String,
    pub batch_size: usize,
    pub max_parallel: usize,
    pub timeout_seconds: u64,
    pub rate_limit_rps: f64,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub request_timeout_seconds: u64,
    pub max_pages: u64,
    pub max_records: Option<u64>,
    pub stuck_run_threshold_hours: u64,
}

impl From<CoreOptions> for Settings {
    fn from(opts: CoreOptions) -> Self {
        Self {
            environment: opts.environment,
            dry_run: opts.dry_run,
            database_url: opts.database_url,
            api_base_url: opts.api_base_url,
            api_key: opts.api_key,
            batch_size: opts.batch_size.max(1),
            max_parallel: opts.max_parallel.max(1),
            timeout_seconds: opts.timeout_seconds,
            rate_limit_rps: opts.rate_limit_rps,
            max_retries: opts.max_retries,
            retry_delay_seconds: opts.retry_delay_seconds,
            request_timeout_seconds: opts.request_timeout_seconds,
            max_pages: opts.max_pages,
            max_records: opts.max_records,
            stuck_run_threshold_hours: opts.stuck_run_threshold_hours,
        }
    }
}

impl Settings {
    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_test(&self) -> bool {
        self.environment == Environment::Test
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Checkpoints are saved at most this often during extraction.
    pub const CHECKPOINT_INTERVAL_SECONDS: u64 = 60;
    /// Parameterized jobs also checkpoint every N parameter values.
    pub const CHECKPOINT_INTERVAL_PARAMS: usize = 100;
    /// Ring-buffer size for per-parameter failures kept in a checkpoint.
    pub const FAILED_PARAMETER_RETENTION: usize = 100;
}

static GLOBAL: OnceCell<Settings> = OnceCell::new();

/// Install the process-wide settings snapshot. Called once from `main`.
pub fn init_global(settings: Settings) {
    let _ = GLOBAL.set(settings);
}

pub fn global() -> Option<&'static Settings> {
    GLOBAL.get()
}

#[cfg(test)]
pub fn test_settings() -> Settings {
    Settings {
        environment: Environment::Test,
        dry_run: true,
        database_url: "postgres://localhost/ccsync_test".to_string(),
        api_base_url: "https://sandbox.example.com/ccsweb/api/v1".to_string(),
        api_key: "test-key".to_string(),
        batch_size: 1000,
        max_parallel: 5,
        timeout_seconds: 300,
        rate_limit_rps: 10.0,
        max_retries: 3,
        retry_delay_seconds: 5,
        request_timeout_seconds: 30,
        max_pages: 10_000,
        max_records: None,
        stuck_run_threshold_hours: 24,
    }
}
