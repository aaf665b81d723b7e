//! Lattice thermal conductivity pipeline: structure relaxation, finite
//! displacement force constants, and conductivity export or solve.

pub mod calculator;
pub mod conductivity;
pub mod config;
pub mod domain;
pub mod fc;
pub mod pipeline;
pub mod recorder;
pub mod relax;
pub mod resolve;
pub mod structure;

pub use domain::{KappaError, KappaErrorCategory, KappaResult};
