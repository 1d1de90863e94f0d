//! Unit tests for `AppError` display format and HTTP status mapping.

use axum::http::StatusCode;
use phoenix_engine::AppError;

#[test]
fn display_prefixes_error_kind() {
    let cases = [
        (AppError::Validation("empty task".into()), "validation: empty task"),
        (AppError::NotFound("ckpt_1".into()), "not found: ckpt_1"),
        (AppError::Collaborator("planner down".into()), "collaborator: planner down"),
        (AppError::Snapshot("backend down".into()), "snapshot: backend down"),
        (AppError::RestoreConflict("running".into()), "restore conflict: running"),
        (AppError::InvalidState("busy".into()), "invalid state: busy"),
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Db("locked".into()), "db: locked"),
        (AppError::Http("bind".into()), "http: bind"),
    ];
    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn error_message_no_trailing_period() {
    let err = AppError::Snapshot("write failed".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn status_codes_follow_error_kind() {
    assert_eq!(
        AppError::Validation(String::new()).status_code(),
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        AppError::NotFound(String::new()).status_code(),
        StatusCode::NOT_FOUND
    );
    assert_eq!(
        AppError::InvalidState(String::new()).status_code(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        AppError::RestoreConflict(String::new()).status_code(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        AppError::Snapshot(String::new()).status_code(),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        AppError::Db(String::new()).status_code(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn toml_errors_convert_to_config() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .unwrap_err()
        .into();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn json_errors_convert_to_db() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    assert!(err.to_string().starts_with("db: serialization"));
}
