mod diagnostics;
mod keys;
mod usage;

// Glob re-exports so utoipa's `routes!()` macro can find the hidden `__path_*`
// structs alongside the handler functions at the `crate::routes::admin::*` path.
pub use diagnostics::*;
pub use keys::*;
pub use usage::*;

use serde::Serialize;
use utoipa::ToSchema;

// --- Shared response types ---

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

// --- Validation helpers ---

const MAX_KEY_NAME_LENGTH: usize = 255;

pub(super) fn validate_key_name(name: &str) -> Result<(), &'static str> {
    let name = name.trim();
    if name.is_empty() {
        return Err("Key name cannot be empty");
    }
    if name.len() > MAX_KEY_NAME_LENGTH {
        return Err("Key name too long (max 255 characters)");
    }
    if name.chars().any(|c| c.is_control()) {
        return Err("Key name cannot contain control characters");
    }
    Ok(())
}

pub(super) fn validate_rate_limit(limit: u32) -> Result<(), &'static str> {
    if !(1..=1000).contains(&limit) {
        return Err("Rate limit must be between 1 and 1000 requests per minute");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_name() {
        assert!(validate_key_name("Production key").is_ok());
        assert!(validate_key_name("").is_err());
        assert!(validate_key_name("   ").is_err());
        assert!(validate_key_name("bad\nname").is_err());
        assert!(validate_key_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_validate_rate_limit() {
        assert!(validate_rate_limit(1).is_ok());
        assert!(validate_rate_limit(1000).is_ok());
        assert!(validate_rate_limit(0).is_err());
        assert!(validate_rate_limit(1001).is_err());
    }
}
