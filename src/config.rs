use std::path::PathBuf;

use serde::Serialize;

use crate::resource::BusyPolicy;

/// Application-level constants
pub const APP_NAME: &str = "OmniMed";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tracing filter when RUST_LOG is unset.
pub fn default_log_filter() -> String {
    "omnimed=info".to_string()
}

/// Get the application data directory
/// ~/OmniMed/ on all platforms (user-visible, per design requirement)
pub fn app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("Cannot determine home directory");
    home.join("OmniMed")
}

/// Path of the SQLite database holding requests and the vector index.
pub fn database_path() -> PathBuf {
    app_data_dir().join("omnimed.db")
}

// ═══════════════════════════════════════════════════════════
// Pipeline settings
// ═══════════════════════════════════════════════════════════

/// Device memory budget for a single-accelerator deployment (bytes).
///
/// Sized for a 16 GB card with headroom for the KV cache and the
/// framework's own allocations. The admission check in the resource
/// arbiter is static: it never inspects actual free memory, because
/// free-memory introspection is unreliable across accelerator backends.
pub const DEVICE_BUDGET_BYTES: u64 = 14_000_000_000;

/// Transient stage failures retried in place before the run fails.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Records buffered per ingestion batch.
pub const DEFAULT_BATCH_SIZE: usize = 64;

/// Retrieved records handed to the reasoning stage.
pub const DEFAULT_TOP_K: usize = 5;

/// Tunable knobs for one orchestrator instance.
///
/// Owned by the orchestrator rather than read from globals so that two
/// instances (e.g. production and a test harness) never share hidden state.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSettings {
    /// Static admission budget for heavy model loads (bytes).
    pub device_budget_bytes: u64,
    /// Maximum in-place retries per stage for transient errors.
    pub max_retries: u32,
    /// What `reserve` does when another resource class is resident.
    pub busy_policy: BusyPolicy,
    /// Whether the sanitization middleware runs between vision and retrieval.
    pub sanitize: bool,
    /// Top-k for the retrieval stage.
    pub top_k: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            device_budget_bytes: DEVICE_BUDGET_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            busy_policy: BusyPolicy::FailFast,
            sanitize: false,
            top_k: DEFAULT_TOP_K,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_data_dir_under_home() {
        let dir = app_data_dir();
        let home = dirs::home_dir().unwrap();
        assert!(dir.starts_with(home));
        assert!(dir.ends_with("OmniMed"));
    }

    #[test]
    fn database_path_under_app_data() {
        let db = database_path();
        assert!(db.starts_with(app_data_dir()));
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }

    #[test]
    fn default_settings_fit_budget() {
        let settings = PipelineSettings::default();
        assert_eq!(settings.device_budget_bytes, DEVICE_BUDGET_BYTES);
        assert_eq!(settings.max_retries, DEFAULT_MAX_RETRIES);
        assert!(!settings.sanitize);
    }
}
