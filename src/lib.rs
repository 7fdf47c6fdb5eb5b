//! A rate-limited queue that turns uploaded clothing photos into catalogue
//! items, with every outbound AI call sharing one sliding-window limit.
pub mod caller;
pub mod config;
pub mod error;
pub mod line_reader;
pub mod openai;
pub mod parser;
pub mod pipeline;
pub mod queue;
pub mod rate_limiter;
pub mod server;
pub mod services;
pub mod status;
pub mod storage;
pub mod util;

pub mod types {
    pub mod job;
    pub mod protocol;
    pub mod serialisable;
    pub mod states;
}

#[cfg(test)]
mod testing;
