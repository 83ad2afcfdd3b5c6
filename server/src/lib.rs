//! Wedding site real-time activity server library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod activity;
pub mod config;
pub mod db;
pub mod hub;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;
