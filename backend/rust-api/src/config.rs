use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    /// Base URL of the player web app; assignment links point here.
    pub play_base_url: String,
    pub mail: MailConfig,
    pub session: SessionConfig,
    pub reminder: ReminderConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
    pub use_tls: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of play-session JWTs (seconds).
    pub play_token_ttl_seconds: i64,
    /// Lifetime of emailed one-time sign-in codes (minutes).
    pub signin_code_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReminderConfig {
    /// Wall-clock hour the daily reminder batch runs at.
    pub daily_hour: u32,
    /// Fixed UTC offset the hour is interpreted in.
    pub utc_offset_hours: i32,
    /// How often the worker sweeps for unsent assignment emails (seconds).
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            // Fallback to current directory .env for backward compatibility
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            .add_source(
                config::File::with_name(&format!("config/{}", env)).required(false), // Allow missing config file, fallback to ENV
            )
            // Override with environment variables (prefix: APP_)
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        // Extract values with fallbacks to ENV or defaults
        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| {
                let user = env::var("MONGO_USER").expect("MONGO_USER must be set");
                let password = env::var("MONGO_PASSWORD").expect("MONGO_PASSWORD must be set");
                let db = env::var("MONGO_DB").unwrap_or_else(|_| "verselearning".to_string());
                eprintln!("WARNING: Building MongoDB URI from MONGO_USER/MONGO_PASSWORD env vars");
                format!(
                    "mongodb://{}:{}@localhost:27017/{}?authSource=admin",
                    user, password, db
                )
            });

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                let password = env::var("REDIS_PASSWORD").expect("REDIS_PASSWORD must be set");
                eprintln!("WARNING: Building Redis URI from REDIS_PASSWORD env var");
                format!("redis://:{}@{}:{}/0", password, host, port)
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "verselearning".to_string());

        let jwt_secret = settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
            .unwrap_or_else(|_| {
                if env == "prod" {
                    panic!("FATAL: JWT_SECRET must be set in production!");
                }
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            });

        let play_base_url = settings
            .get_string("play.base_url")
            .or_else(|_| env::var("PLAY_BASE_URL"))
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        let mail = MailConfig {
            smtp_host: settings
                .get_string("mail.smtp_host")
                .or_else(|_| env::var("SMTP_HOST"))
                .unwrap_or_else(|_| "localhost".to_string()),
            smtp_port: settings
                .get_int("mail.smtp_port")
                .ok()
                .and_then(|p| u16::try_from(p).ok())
                .or_else(|| {
                    env::var("SMTP_PORT").ok().and_then(|s| s.parse().ok())
                })
                .unwrap_or(587),
            smtp_username: settings
                .get_string("mail.smtp_username")
                .or_else(|_| env::var("SMTP_USERNAME"))
                .unwrap_or_default(),
            smtp_password: settings
                .get_string("mail.smtp_password")
                .or_else(|_| env::var("SMTP_PASSWORD"))
                .unwrap_or_default(),
            from_email: settings
                .get_string("mail.from_email")
                .or_else(|_| env::var("MAIL_FROM_EMAIL"))
                .unwrap_or_else(|_| "noreply@verselearning.local".to_string()),
            from_name: settings
                .get_string("mail.from_name")
                .or_else(|_| env::var("MAIL_FROM_NAME"))
                .unwrap_or_else(|_| "Verse Learning".to_string()),
            use_tls: settings
                .get_bool("mail.use_tls")
                .ok()
                .or_else(|| {
                    env::var("SMTP_USE_TLS").ok().map(|s| s == "1" || s == "true")
                })
                .unwrap_or(true),
        };

        let session = SessionConfig {
            play_token_ttl_seconds: settings
                .get_int("session.play_token_ttl_seconds")
                .ok()
                .or_else(|| {
                    env::var("PLAY_TOKEN_TTL_SECONDS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(7200), // 2 hours
            signin_code_ttl_minutes: settings
                .get_int("session.signin_code_ttl_minutes")
                .ok()
                .or_else(|| {
                    env::var("SIGNIN_CODE_TTL_MINUTES")
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(30),
        };

        let reminder = ReminderConfig {
            daily_hour: settings
                .get_int("reminder.daily_hour")
                .ok()
                .and_then(|h| u32::try_from(h).ok())
                .or_else(|| {
                    env::var("REMINDER_DAILY_HOUR").ok().and_then(|s| s.parse().ok())
                })
                .unwrap_or(16),
            utc_offset_hours: settings
                .get_int("reminder.utc_offset_hours")
                .ok()
                .and_then(|h| i32::try_from(h).ok())
                .or_else(|| {
                    env::var("REMINDER_UTC_OFFSET_HOURS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(0),
            sweep_interval_secs: settings
                .get_int("reminder.sweep_interval_secs")
                .ok()
                .and_then(|s| u64::try_from(s).ok())
                .or_else(|| {
                    env::var("REMINDER_SWEEP_INTERVAL_SECS")
                        .ok()
                        .and_then(|s| s.parse().ok())
                })
                .unwrap_or(300),
        };

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            play_base_url,
            mail,
            session,
            reminder,
        })
    }
}
