//! Function to setup logging in binaries and tests.

/// Crates that are too loud at `debug` level for our taste.
const LOUD_CRATES: [&str; 2] = [
    // Only interesting when debugging the profiler itself:
    "puffin",
    // Spams on every metric export:
    "opentelemetry_sdk",
];

/// Determines the default log filter.
///
/// Uses `RUST_LOG` if set, `info` otherwise, and always quiets down crates that are too loud.
pub fn default_log_filter() -> String {
    let mut rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_owned());

    for loud_crate in LOUD_CRATES {
        if !rust_log.contains(&format!("{loud_crate}=")) {
            rust_log += &format!(",{loud_crate}=warn");
        }
    }

    rust_log
}

/// Sets up logging to stderr, honoring `RUST_LOG`.
///
/// Safe to call multiple times: only the first call has any effect. Tests call this first thing.
#[cfg(not(target_arch = "wasm32"))]
pub fn setup_logging() {
    static SETUP: std::sync::Once = std::sync::Once::new();

    SETUP.call_once(|| {
        let mut builder = env_logger::Builder::new();
        builder.parse_filters(&default_log_filter());
        if cfg!(test) || std::env::var("RUST_TEST_THREADS").is_ok() {
            builder.is_test(true);
        }

        // Someone else might have already installed a logger, which is fine.
        builder.try_init().ok();
    });
}

#[cfg(target_arch = "wasm32")]
pub fn setup_logging() {}
