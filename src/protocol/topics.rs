//! Subscription topic validation
//!
//! The client subscribes to exactly one concrete topic published by the
//! device, so wildcard filters are rejected.

use thiserror::Error;

/// Check that a topic is usable as the single feed subscription
pub fn validate_topic(topic: &str) -> Result<(), ValidationError> {
    if topic.is_empty() {
        return Err(ValidationError::EmptyTopic);
    }

    for ch in topic.chars() {
        match ch {
            '+' | '#' => return Err(ValidationError::WildcardTopic(ch)),
            '\0' => return Err(ValidationError::NullCharacter),
            _ => {}
        }
    }

    Ok(())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Topic cannot be empty")]
    EmptyTopic,
    #[error("Topic must not contain wildcard '{0}'")]
    WildcardTopic(char),
    #[error("Topic must not contain a null character")]
    NullCharacter,
}
