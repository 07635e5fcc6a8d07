//! Provider-agnostic messaging model: inbound events and the outbound port.

pub mod port;
pub mod types;
