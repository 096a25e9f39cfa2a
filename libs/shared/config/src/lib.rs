use std::env;
use tracing::warn;

/// Default reconciliation tick period in seconds.
pub const DEFAULT_RECONCILER_TICK_SECONDS: u64 = 60;

/// Default regional display offset: UTC+05:30.
pub const DEFAULT_CLINIC_UTC_OFFSET_MINUTES: i32 = 330;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_url: String,
    pub store_anon_key: String,
    pub store_jwt_secret: String,
    pub reconciler_tick_seconds: u64,
    pub clinic_utc_offset_minutes: i32,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            store_url: env::var("STORE_URL")
                .unwrap_or_else(|_| {
                    warn!("STORE_URL not set, using empty value");
                    String::new()
                }),
            store_anon_key: env::var("STORE_ANON_KEY")
                .unwrap_or_else(|_| {
                    warn!("STORE_ANON_KEY not set, using empty value");
                    String::new()
                }),
            store_jwt_secret: env::var("STORE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("STORE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            reconciler_tick_seconds: env::var("RECONCILER_TICK_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RECONCILER_TICK_SECONDS),
            clinic_utc_offset_minutes: env::var("CLINIC_UTC_OFFSET_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_CLINIC_UTC_OFFSET_MINUTES),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.store_url.is_empty()
            && !self.store_anon_key.is_empty()
            && !self.store_jwt_secret.is_empty()
    }
}
