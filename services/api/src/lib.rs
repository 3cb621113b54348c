pub mod adapters;
pub mod booking;
pub mod config;
pub mod error;
pub mod outbox;
pub mod web;
