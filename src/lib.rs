//! medtrace: derive regulatory artifacts (features, requirements, ISO 14971
//! risks, traceability, test outlines) from C and JavaScript device code.

pub mod app;
pub mod cli;
pub mod config;
pub mod error_handler;
pub mod export;
pub mod features;
pub mod hazards;
pub mod ingestion;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod progress;
pub mod requirements;
pub mod risk_register;
pub mod template_engine;
pub mod test_generator;
pub mod traceability;
