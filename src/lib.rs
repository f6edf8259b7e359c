pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod normalizer;
pub mod orchestrator;
pub mod source;
pub mod threads;

pub use error::ScrapeError;
pub use orchestrator::ScrapeOrchestrator;
pub use threads::ThreadReconstructor;
