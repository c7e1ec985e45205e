//! CLI command implementations.

pub mod init;
pub mod pair;
pub mod serve;
pub mod status;
