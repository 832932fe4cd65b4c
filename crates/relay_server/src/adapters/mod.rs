#![forbid(unsafe_code)]

pub mod loopback;

pub use loopback::LoopbackConnector;
