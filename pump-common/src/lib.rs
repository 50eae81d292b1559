pub mod config;
pub mod dependencies;
pub mod error;
pub mod events;
pub mod grouping;
pub mod health;
pub mod metrics;
pub mod payload;
pub mod pipeline;
pub mod qatrack;
pub mod registry;
pub mod runtime;
pub mod validation;
