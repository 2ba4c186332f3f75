//! Small shared utilities.

pub mod crc64;
