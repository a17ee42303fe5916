#![doc = "wincore-poller-core: build discovery, download, extraction and retention for the artifact poller."]

//! This crate holds the domain model, the repository client, the per-target
//! pipeline, the SQLite store and the [`engine::PollingEngine`] that drives them.
//! Process concerns (argument parsing, subscriber setup, exit codes) live in the
//! `wincore-poller` binary crate.
//!
//! # Usage
//! Build an [`engine::PollingEngine`] from [`config::EngineSettings`], an
//! [`contract::ArtifactRepository`] and a [`contract::BuildStore`], call `start()`,
//! then `poll_all_targets()` or `run_continuous()`.

pub mod config;
pub mod contract;
pub mod credentials;
pub mod discovery;
pub mod download;
pub mod engine;
pub mod error;
pub mod extract;
pub mod layout;
pub mod model;
pub mod pipeline;
pub mod repository;
pub mod retention;
pub mod store;
pub mod tracker;
