pub mod batch;
pub mod classify;
pub mod config;
pub mod convert;
pub mod counter;
pub mod domain;
pub mod error;
pub mod listing;
pub mod orchestrator;
pub mod output;
pub mod remote;
pub mod rules;
pub mod study;
pub mod tool;
