#![forbid(unsafe_code)]

pub mod bot;
pub mod error;
pub mod health;
pub mod http;
pub mod multiplexer;
pub mod registry;
pub mod session;
pub mod sse;
pub mod upstream;
pub mod ws;

#[cfg(test)]
mod bot_tests;
#[cfg(test)]
mod registry_tests;
#[cfg(test)]
mod test_support;
