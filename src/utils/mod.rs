pub mod cursor;
pub mod redact;
