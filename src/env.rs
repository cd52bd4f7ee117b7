//! Environment helpers and application constants.

/// Application name used for the config directory.
pub const APP_NAME: &str = "agentctl";

/// Default control-plane port.
pub const DEFAULT_CONTROL_PORT: u16 = 8700;

/// Default bottom of the instance port range.
pub const DEFAULT_INSTANCE_PORT_BASE: u16 = 10001;

/// Default top of the instance port range (inclusive).
pub const DEFAULT_INSTANCE_PORT_MAX: u16 = 10100;

/// Default agent protocol label when none is configured.
pub const DEFAULT_PROTOCOL: &str = "acp";

/// Check whether the process is running under the test harness.
///
/// `AGENTCTL_ENV=test` is set by integration tests to keep all filesystem
/// side effects (config dir, logs) inside the project tree.
#[must_use]
pub fn is_test_mode() -> bool {
    std::env::var("AGENTCTL_ENV").as_deref() == Ok("test")
}

/// True in unit tests or when the test env var is set.
#[must_use]
pub fn is_any_test() -> bool {
    cfg!(test) || is_test_mode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_any_test_true_under_cfg_test() {
        assert!(is_any_test());
    }

    #[test]
    fn defaults_form_a_valid_range() {
        assert!(DEFAULT_INSTANCE_PORT_MAX > DEFAULT_INSTANCE_PORT_BASE);
        assert_ne!(DEFAULT_CONTROL_PORT, DEFAULT_INSTANCE_PORT_BASE);
    }
}
