use chunkflow_config::{LogFormat, LogLevel, LoggingConfig};
use chunkflow_logging::{
    classify_fault, init_logging_from_config, init_worker_tracing, BufferedLogger, ErrorInfo,
    ErrorSeverity, FaultCategory, LogEvent, StructuredLogger,
};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();
    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);

    init_logging_from_config(&config).unwrap();
    // A second initialisation is tolerated
    init_worker_tracing("info").unwrap();
}

#[test]
fn test_fault_event_carries_classification() {
    let message = "Connection closed while reading response";
    let (category, _) = classify_fault(message);
    assert_eq!(category, FaultCategory::Communication);

    let logger = BufferedLogger::new();
    logger.log(
        LogEvent::new(chunkflow_logging::LogLevel::Warn, "context fault")
            .with_field("fault_category", category.to_string())
            .with_error(ErrorInfo::classified("CONTEXT_FAULT", message)),
    );

    let events = logger.events();
    assert_eq!(events.len(), 1);
    let error = events[0].error.as_ref().unwrap();
    assert_eq!(error.severity, ErrorSeverity::High);
    assert_eq!(error.category, FaultCategory::Communication);
    assert!(error.is_retryable);
}
