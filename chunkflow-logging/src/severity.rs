//! Error severity levels and fault classification

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum ErrorSeverity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    pub fn should_alert(&self) -> bool {
        matches!(self, ErrorSeverity::High | ErrorSeverity::Critical)
    }

    pub fn should_retry(&self) -> bool {
        !matches!(self, ErrorSeverity::Critical)
    }
}

/// Coarse family of a context fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultCategory {
    Memory,
    Communication,
    Computation,
    Unknown,
}

impl fmt::Display for FaultCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultCategory::Memory => "memory",
            FaultCategory::Communication => "communication",
            FaultCategory::Computation => "computation",
            FaultCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

static FAULT_RULES: Lazy<Vec<(Regex, FaultCategory, ErrorSeverity)>> = Lazy::new(|| {
    [
        (
            r"(?i)out of memory|allocation failed|memory limit|heap|capacity overflow",
            FaultCategory::Memory,
            ErrorSeverity::Critical,
        ),
        (
            r"(?i)broken pipe|connection (closed|reset)|channel closed|disconnected|protocol|transfer|deserializ|serializ",
            FaultCategory::Communication,
            ErrorSeverity::High,
        ),
        (
            r"(?i)panic|overflow|divide by zero|index out of bounds|invalid (payload|input)|unknown task type",
            FaultCategory::Computation,
            ErrorSeverity::Medium,
        ),
    ]
    .into_iter()
    .filter_map(|(pattern, category, severity)| {
        Regex::new(pattern).ok().map(|regex| (regex, category, severity))
    })
    .collect()
});

/// Classify a fault message for telemetry.
///
/// The result is advisory: it is attached to fault events and logs, but
/// restart decisions are made from counters only.
pub fn classify_fault(message: &str) -> (FaultCategory, ErrorSeverity) {
    FAULT_RULES
        .iter()
        .find(|(regex, _, _)| regex.is_match(message))
        .map(|(_, category, severity)| (*category, *severity))
        .unwrap_or((FaultCategory::Unknown, ErrorSeverity::Low))
}
