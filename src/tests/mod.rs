//! Cross-service tests and shared fixtures.

pub mod test_helpers;
