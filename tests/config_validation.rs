//! Integration tests for configuration validation

#![allow(clippy::expect_used)]

use std::time::Duration;
use wearable_link::config::{LinkConfig, MAX_FRAME_PAYLOAD, MIN_MTU};
use wearable_link::core::codec::WireFormatKind;
use wearable_link::protocol::session::{AuthMode, Role};

#[test]
fn test_default_config_validates() {
    let config = LinkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_mtu_below_minimum() {
    let config = LinkConfig::default_with_overrides(|c| c.link.mtu = MIN_MTU - 1);
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("MTU too small")));
}

#[test]
fn test_mtu_above_frame_payload() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.link.max_frame_payload = 512;
        c.link.mtu = 1024;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("larger than max frame payload")));
}

#[test]
fn test_max_frame_payload_limits() {
    let zero = LinkConfig::default_with_overrides(|c| c.link.max_frame_payload = 0);
    assert!(zero.validate().iter().any(|e| e.contains("cannot be 0")));

    let huge = LinkConfig::default_with_overrides(|c| c.link.max_frame_payload = MAX_FRAME_PAYLOAD + 1);
    assert!(huge.validate().iter().any(|e| e.contains("Max frame payload too large")));
}

#[test]
fn test_send_timeout_bounds() {
    let short = LinkConfig::default_with_overrides(|c| c.link.send_timeout = Duration::from_millis(1));
    assert!(short.validate().iter().any(|e| e.contains("Send timeout too short")));

    let long = LinkConfig::default_with_overrides(|c| c.link.send_timeout = Duration::from_secs(600));
    assert!(long.validate().iter().any(|e| e.contains("Send timeout too long")));
}

#[test]
fn test_handshake_timeout_too_short() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.session.handshake_timeout = Duration::from_millis(5)
    });
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));
}

#[test]
fn test_zero_thresholds() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.session.integrity_failure_threshold = 0;
        c.requests.send_failure_threshold = 0;
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Integrity failure threshold")));
    assert!(errors.iter().any(|e| e.contains("Send failure threshold")));
}

#[test]
fn test_plaintext_mode_warns() {
    let config = LinkConfig::default_with_overrides(|c| c.session.auth_mode = AuthMode::Plaintext);
    let errors = config.validate();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("WARNING"));
}

#[test]
fn test_transfer_retry_limits() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.transfer.max_missing_requests = 100;
        c.transfer.max_transfer_restarts = 100;
        c.transfer.chunk_ack_timeout = Duration::from_millis(1);
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max missing requests too high")));
    assert!(errors.iter().any(|e| e.contains("Max transfer restarts too high")));
    assert!(errors.iter().any(|e| e.contains("Chunk ack timeout too short")));
}

#[test]
fn test_request_timeout_shorter_than_chunk_inactivity() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.requests.default_timeout = Duration::from_millis(500);
        c.transfer.chunk_inactivity_timeout = Duration::from_secs(2);
    });
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("shorter than chunk inactivity timeout")));
}

#[test]
fn test_chunk_ack_timeout_must_exceed_inactivity_timeout() {
    let inverted = LinkConfig::default_with_overrides(|c| {
        c.transfer.chunk_inactivity_timeout = Duration::from_secs(3);
        c.transfer.chunk_ack_timeout = Duration::from_secs(1);
    });
    let errors = inverted.validate();
    assert!(
        errors.iter().any(|e| e.contains("must exceed chunk inactivity timeout")),
        "{errors:?}"
    );

    let equal = LinkConfig::default_with_overrides(|c| {
        c.transfer.chunk_inactivity_timeout = Duration::from_secs(2);
        c.transfer.chunk_ack_timeout = Duration::from_secs(2);
    });
    assert!(equal.validate_strict().is_err());

    let inverted_toml = "[transfer]\n\
        chunk_inactivity_timeout = 4000\n\
        chunk_ack_timeout = 1000\n\
        max_missing_requests = 3\n\
        max_transfer_restarts = 2\n";
    let parsed = LinkConfig::from_toml(inverted_toml).expect("parses");
    assert!(parsed.ensure_usable().is_err());
}

#[test]
fn test_ensure_usable_tolerates_advisories_only() {
    let plaintext = LinkConfig::default_with_overrides(|c| c.session.auth_mode = AuthMode::Plaintext);
    assert!(plaintext.validate_strict().is_err());
    assert!(plaintext.ensure_usable().is_ok());

    let tiny_mtu = LinkConfig::default_with_overrides(|c| c.link.mtu = 2);
    let err = tiny_mtu.ensure_usable().expect_err("MTU 2 cannot carry chunks");
    assert!(err.to_string().contains("MTU too small"));
}

#[test]
fn test_empty_names_rejected() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.session.device_name = String::new();
        c.logging.app_name = String::new();
    });
    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Device name cannot be empty")));
    assert!(errors.iter().any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_blank_log_filter_rejected() {
    let config = LinkConfig::default_with_overrides(|c| c.logging.filter = Some("  ".into()));
    assert!(config.validate().iter().any(|e| e.contains("Log filter")));
}

#[test]
fn test_multiple_errors_collected() {
    let config = LinkConfig::default_with_overrides(|c| {
        c.link.mtu = 1;
        c.link.event_buffer = 0;
        c.requests.command_buffer = 0;
    });
    let errors = config.validate();
    assert!(errors.len() >= 3, "expected several errors, got {errors:?}");

    let strict = config.validate_strict().expect_err("strict validation fails");
    assert!(strict.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_example_config_parses_back() {
    let text = LinkConfig::example_config();
    let parsed = LinkConfig::from_toml(&text).expect("example config parses");
    assert_eq!(parsed.link.mtu, LinkConfig::default().link.mtu);
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_toml_overrides_sections() {
    let base = LinkConfig::default_with_overrides(|c| {
        c.link.wire_format = WireFormatKind::Legacy;
        c.link.role = Role::Responder;
        c.link.mtu = 185;
        c.requests.default_timeout = Duration::from_secs(30);
    });
    let text = toml::to_string(&base).expect("serializes");
    let parsed = LinkConfig::from_toml(&text).expect("parses");

    assert_eq!(parsed.link.wire_format, WireFormatKind::Legacy);
    assert_eq!(parsed.link.role, Role::Responder);
    assert_eq!(parsed.link.mtu, 185);
    assert_eq!(parsed.requests.default_timeout, Duration::from_secs(30));
}

#[test]
fn test_malformed_toml_is_config_error() {
    let err = LinkConfig::from_toml("[link\nmtu = ").expect_err("malformed toml");
    assert!(err.to_string().contains("Failed to parse TOML"));
}
