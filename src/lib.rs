//! Profile photo generation dispatcher
//!
//! Background worker that leases queued jobs from Postgres, builds a
//! generation prompt from each job's style options, calls the image
//! generation provider and records the outcome. Any number of worker
//! processes can share one database; coordination happens entirely through
//! the lease columns on `jobs`.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
