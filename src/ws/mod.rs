//! Real-time transport

pub mod handler;
pub mod protocol;
