//! Small helpers shared across modules.
//!
//! - **URL validation**: scheme and SSRF checks for feed source URLs
//! - **Text processing**: control-character stripping and byte-size formatting

mod text;
mod url_validator;

pub use text::{format_bytes, strip_control_chars};
pub use url_validator::{validate_url, UrlValidationError};
