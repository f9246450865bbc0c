//! Spatial agent-based SIR epidemic simulation.
//!
//! Agents move through a bounded arena with reflecting walls. Infected agents
//! transmit the disease to susceptible agents within a fixed radius, and
//! recover after a fixed number of steps. See [`engine::Engine`].

pub mod analysis;
pub mod config;
pub mod engine;
pub mod manager;
pub mod model;
pub mod stats;
