pub mod availability;
pub mod chunk_plan;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod policy;
pub mod probe;
pub mod supervisor;
pub mod telemetry;
pub mod util;
pub mod validate;
