#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::struct_field_names
)]

pub mod chat;
pub mod config;
pub mod connection;
pub mod contacts;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gateway;
pub mod jobs;
pub mod ratelimit;
pub mod retention;
pub mod service;
pub mod store;
pub mod vault;
