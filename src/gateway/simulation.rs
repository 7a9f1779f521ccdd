//! Simulate-vs-live decision.
//!
//! The decision is recomputed on every call from the injected config and
//! the outcome of the token check. Nothing is persisted.

use chrono::Utc;
use std::time::Duration;

/// Handles of simulated payments start with this marker.
pub const TEST_PREFIX: &str = "TEST_";

const PLACEHOLDERS: &[&str] = &["changeme", "change_me", "placeholder", "xxx", "your_", "<"];

/// What a gateway knows about itself when deciding.
#[derive(Clone, Copy, Debug)]
pub struct SimulationConfig {
    pub test_mode: bool,
    pub credentials_present: bool,
    pub allow_fallback: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenCheck {
    /// No token request has been made yet.
    NotAttempted,
    /// The token endpoint answered with this HTTP status.
    Rejected(u16),
}

pub fn should_simulate(config: &SimulationConfig, check: TokenCheck) -> bool {
    if config.test_mode || !config.credentials_present { return true; }
    matches!(check, TokenCheck::Rejected(400 | 401)) && config.allow_fallback
}

/// True for a non-empty value that does not look like a template placeholder.
pub fn credential_present(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => false,
        Some(v) => {
            let lower = v.to_ascii_lowercase();
            !PLACEHOLDERS.iter().any(|p| lower.starts_with(p))
        }
    }
}

pub fn is_simulated(handle: &str) -> bool { handle.starts_with(TEST_PREFIX) }

/// `TEST_<tag>_<reference>_<millis>`
pub fn simulated_handle(tag: &str, order_reference: &str) -> String {
    format!("{TEST_PREFIX}{tag}_{order_reference}_{}", Utc::now().timestamp_millis())
}

/// Receipt used when a simulated payment resolves.
pub fn simulated_receipt(handle: &str) -> String {
    let tail: String = handle.chars().rev().take(8).collect::<Vec<_>>().into_iter().rev().collect();
    format!("TEST{}", tail.to_ascii_uppercase())
}

pub async fn pause(delay: Duration) {
    if !delay.is_zero() { tokio::time::sleep(delay).await; }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIVE: SimulationConfig = SimulationConfig { test_mode: false, credentials_present: true, allow_fallback: false };

    #[test]
    fn test_live_config_stays_live() {
        assert!(!should_simulate(&LIVE, TokenCheck::NotAttempted));
        assert!(!should_simulate(&LIVE, TokenCheck::Rejected(401)));
    }

    #[test]
    fn test_test_mode_and_missing_credentials_simulate() {
        assert!(should_simulate(&SimulationConfig { test_mode: true, ..LIVE }, TokenCheck::NotAttempted));
        assert!(should_simulate(&SimulationConfig { credentials_present: false, ..LIVE }, TokenCheck::NotAttempted));
    }

    #[test]
    fn test_fallback_only_on_auth_rejection() {
        let cfg = SimulationConfig { allow_fallback: true, ..LIVE };
        assert!(should_simulate(&cfg, TokenCheck::Rejected(400)));
        assert!(should_simulate(&cfg, TokenCheck::Rejected(401)));
        assert!(!should_simulate(&cfg, TokenCheck::Rejected(503)));
        assert!(!should_simulate(&cfg, TokenCheck::NotAttempted));
    }

    #[test]
    fn test_placeholders_are_not_credentials() {
        assert!(credential_present(Some("Gx7kPq2")));
        assert!(!credential_present(Some("  ")));
        assert!(!credential_present(Some("your_consumer_key")));
        assert!(!credential_present(None));
    }

    #[test]
    fn test_simulated_handles() {
        let h = simulated_handle("MPESA", "ORD20240101ABCDEF");
        assert!(is_simulated(&h));
        assert!(!is_simulated("ws_CO_0101"));
        assert!(simulated_receipt(&h).starts_with("TEST"));
    }
}
