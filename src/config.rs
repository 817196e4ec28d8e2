use once_cell::sync::Lazy;

/// Secret key for the payment provider API. Must be set via `STRIPE_SECRET_KEY`.
pub static STRIPE_SECRET_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("STRIPE_SECRET_KEY").expect("STRIPE_SECRET_KEY must be set"));

/// Signing secret used to authenticate inbound provider events.
pub static STRIPE_WEBHOOK_SECRET: Lazy<String> = Lazy::new(|| {
    std::env::var("STRIPE_WEBHOOK_SECRET").expect("STRIPE_WEBHOOK_SECRET must be set")
});

/// Base URL of the provider API. Defaults to the public Stripe endpoint.
pub static STRIPE_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("STRIPE_API_BASE").unwrap_or_else(|| "https://api.stripe.com".to_string())
});

/// Public base URL of this application, used for checkout and portal redirects.
pub static APP_BASE_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("APP_BASE_URL").unwrap_or_else(|| "http://localhost:3000".to_string())
});

/// Accepted clock skew for signed provider events, in seconds. Defaults to `300`.
pub static WEBHOOK_TOLERANCE_SECS: Lazy<i64> = Lazy::new(|| {
    std::env::var("WEBHOOK_TOLERANCE_SECS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// Lifetime of a checkout session in minutes, clamped to what the provider accepts.
pub static CHECKOUT_SESSION_TTL_MINUTES: Lazy<i64> = Lazy::new(|| {
    std::env::var("CHECKOUT_SESSION_TTL_MINUTES")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(60)
        .clamp(30, 1440)
});

/// Storage backend. `postgres` (default) or `memory`.
pub static STORAGE_BACKEND: Lazy<String> = Lazy::new(|| {
    read_optional_env("STORAGE_BACKEND")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_else(|| "postgres".to_string())
});

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
