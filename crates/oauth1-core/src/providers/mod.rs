//! Ready-made configurations and calls for specific providers

pub mod twitter;
