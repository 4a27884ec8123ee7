pub mod approval;
pub mod cache;
pub mod chart;
pub mod config;
pub mod db;
pub mod error;
pub mod exec;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod semantic;
pub mod similarity;
pub mod util;
pub mod web;
