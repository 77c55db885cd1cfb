//! Integration tests for logging configuration and redaction helpers

use bridge_traits::time::LogLevel;
use core_runtime::error::Error;
use core_runtime::logging::{
    redact_if_sensitive, redact_url, strip_path, LogFormat, LoggingConfig,
};

#[test]
fn test_logging_config_chaining() {
    // A global subscriber can be installed once per process, so only the builder is exercised
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_redaction(false)
        .with_span_events(true)
        .with_filter("core_streaming::download=trace");

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.redact);
    assert!(config.span_events);
    assert!(config.sink.is_none());
    assert_eq!(config.filter.as_deref(), Some("core_streaming::download=trace"));
}

#[test]
fn test_log_format_parsing() {
    assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
    assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    assert!(matches!("syslog".parse::<LogFormat>(), Err(Error::Config(_))));

    for format in [LogFormat::Pretty, LogFormat::Json, LogFormat::Compact] {
        assert_eq!(format.as_str().parse::<LogFormat>().unwrap(), format);
    }
}

#[test]
fn test_redaction_of_credentials() {
    assert_eq!(redact_if_sensitive("access_token", "abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("Authorization", "Bearer abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("url_signature", "deadbeef"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("Cookie", "session=1"), "[REDACTED]");

    assert_eq!(redact_if_sensitive("track_id", "12345"), "12345");
    assert_eq!(redact_if_sensitive("quality", "320kbps"), "320kbps");
    assert_eq!(
        redact_if_sensitive("source_url", "https://cdn.example.com/a.mp3"),
        "https://cdn.example.com/a.mp3"
    );
}

#[test]
fn test_signed_media_urls_lose_query() {
    assert_eq!(
        redact_url("https://media.example.com/v1/t/abc/128.mp3?token=xyz&exp=1700000000"),
        "https://media.example.com/v1/t/abc/128.mp3"
    );
    assert_eq!(
        redact_url("https://media.example.com/a.mp3#t=10"),
        "https://media.example.com/a.mp3"
    );
    assert_eq!(redact_url(""), "");
}

#[test]
fn test_cache_paths_are_stripped() {
    assert_eq!(
        strip_path("/home/user/.cache/music-streaming-core/track-cache/media/0a1b-320kbps-x.audio"),
        "0a1b-320kbps-x.audio"
    );
    assert_eq!(strip_path("C:\\Users\\John\\AppData\\Local\\cache\\x.audio"), "x.audio");
    assert_eq!(strip_path("manifest.json"), "manifest.json");
    assert_eq!(strip_path("/var/cache/"), "");
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    assert_eq!(LoggingConfig::default().format, LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LoggingConfig::default().format, LogFormat::Json);
}
