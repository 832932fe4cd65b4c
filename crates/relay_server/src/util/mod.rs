#![forbid(unsafe_code)]

pub mod backoff;
