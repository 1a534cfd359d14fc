// Library exports for the warden process supervisor

pub mod activation;
pub mod config;
pub mod error;
pub mod events;
pub mod isolation;
pub mod supervisor;
