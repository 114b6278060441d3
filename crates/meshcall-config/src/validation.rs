//! Full configuration validation.
//!
//! Validates numeric ranges and URL schemes, collecting every problem.

use crate::schema::MeshcallConfig;
use meshcall_common::ConfigError;

/// Run all validations on a config, collecting all errors.
pub fn validate(config: &MeshcallConfig) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let rt = &config.realtime;

    validate_scheme(&mut errors, "realtime.host", &rt.host, &["ws://", "wss://"]);
    validate_scheme(
        &mut errors,
        "realtime.auth_endpoint",
        &rt.auth_endpoint,
        &["http://", "https://"],
    );
    validate_range(&mut errors, "realtime.heartbeat_interval", rt.heartbeat_interval, 5, 300);
    validate_range(&mut errors, "realtime.connect_timeout", rt.connect_timeout, 1, 120);
    validate_range(&mut errors, "realtime.reconnect_base_ms", rt.reconnect_base_ms, 10, 60_000);
    // Delays double per attempt; past 16 attempts the wait is measured in days.
    validate_range(
        &mut errors,
        "realtime.max_reconnect_attempts",
        rt.max_reconnect_attempts,
        0,
        16,
    );

    if config.room.signal_event.is_empty() {
        errors.push("room.signal_event must not be empty".into());
    }
    if config.room.signal_event.starts_with("client-") {
        errors.push("room.signal_event must not carry the client- prefix".into());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}

fn validate_range(errors: &mut Vec<String>, name: &str, value: u32, min: u32, max: u32) {
    if value < min || value > max {
        errors.push(format!("{name} = {value} is out of range [{min}, {max}]"));
    }
}

fn validate_scheme(errors: &mut Vec<String>, name: &str, value: &str, schemes: &[&str]) {
    if !schemes.iter().any(|s| value.starts_with(s)) {
        errors.push(format!(
            "{name} = {value:?} must start with one of {}",
            schemes.join(", ")
        ));
    }
}
