use super::error::{ConnectReturnCode, MqttError};
use super::logging;

#[test]
fn logging_init_accepts_levels() {
    // Should not panic
    logging::init("info");
    logging::init("debug");
    logging::init("warn");
}

#[test]
fn unknown_level_falls_back_to_info() {
    assert_eq!(logging::parse_level("loud"), tracing::Level::INFO);
    assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
}

#[test]
fn connack_codes_map_both_ways() {
    assert_eq!(ConnectReturnCode::from(4), ConnectReturnCode::BadUsernameOrPassword);
    assert_eq!(ConnectReturnCode::from(9), ConnectReturnCode::Reserved(9));
    assert_eq!(u8::from(ConnectReturnCode::NotAuthorized), 5);
}

#[test]
fn io_errors_become_transport_errors() {
    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
    let err: MqttError = io.into();
    assert!(matches!(err, MqttError::Transport(ref msg) if msg.contains("reset")));
}

#[test]
fn refused_error_names_the_reason() {
    let err = MqttError::ConnectRefused(ConnectReturnCode::IdentifierRejected);
    assert_eq!(err.to_string(), "connection refused by broker: identifier rejected");
}
