//! Echoes training coordinator.
//!
//! Turns a user's reflection answers into a quality-gated training corpus,
//! queues and schedules fine-tuning jobs on an external executor, tracks
//! their progress and keeps each user bound to their active persona model.

#![allow(missing_docs)]

pub mod api;
pub mod app;
pub mod boot;
pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod dataset;
pub mod deployment;
pub mod environment;
pub mod jobs;
pub mod registry;
pub mod router;
pub mod setup_tracing;
