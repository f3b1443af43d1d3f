pub mod cancel;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod orchestrator;
pub mod pool;
pub mod registry;
pub mod report;
pub mod signals;
pub mod task;
pub mod wordcount;
