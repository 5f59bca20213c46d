//! Configuration validation traits and utilities

use crate::error::{ConfigError, ConfigResult};

/// Trait for validatable configuration
pub trait Validatable {
    /// Validate the configuration
    fn validate(&self) -> ConfigResult<()>;

    /// Get the domain name for error reporting
    fn domain_name(&self) -> &'static str;

    /// Helper to create a domain-specific validation error
    fn validation_error(&self, message: impl Into<String>) -> ConfigError {
        ConfigError::DomainError {
            domain: self.domain_name().to_string(),
            message: message.into(),
        }
    }
}

/// Validate a required string field
pub fn validate_required_string(value: &str, field_name: &str, domain: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} cannot be empty", field_name),
        });
    }
    Ok(())
}

/// Validate a positive number
pub fn validate_positive<T>(value: T, field_name: &str, domain: &str) -> ConfigResult<()>
where
    T: PartialOrd + Default + std::fmt::Display,
{
    if value <= T::default() {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be greater than 0, got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a ratio in the half-open range (0, 1]
pub fn validate_ratio(value: f64, field_name: &str, domain: &str) -> ConfigResult<()> {
    if !(value > 0.0 && value <= 1.0) {
        return Err(ConfigError::DomainError {
            domain: domain.to_string(),
            message: format!("{} must be within (0, 1], got {}", field_name, value),
        });
    }
    Ok(())
}

/// Validate a complete configuration object
pub fn validate_config(config: &crate::domains::ChunkflowConfig) -> ConfigResult<()> {
    config.pool.validate()?;
    config.logging.validate()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive() {
        assert!(validate_positive(1u64, "size", "pool").is_ok());
        let err = validate_positive(0usize, "size", "pool").unwrap_err();
        assert!(err.to_string().contains("size must be greater than 0"));
    }

    #[test]
    fn test_validate_ratio() {
        assert!(validate_ratio(0.9, "high_memory_threshold", "pool").is_ok());
        assert!(validate_ratio(1.0, "high_memory_threshold", "pool").is_ok());
        assert!(validate_ratio(0.0, "high_memory_threshold", "pool").is_err());
        assert!(validate_ratio(1.5, "high_memory_threshold", "pool").is_err());
        assert!(validate_ratio(f64::NAN, "high_memory_threshold", "pool").is_err());
    }

    #[test]
    fn test_validate_required_string() {
        assert!(validate_required_string("hash", "name", "pool").is_ok());
        assert!(validate_required_string("  ", "name", "pool").is_err());
    }
}
