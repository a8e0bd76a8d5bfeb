//! Core library for the nutrisense field analyzer.
//!
//! This library contains the capture scheduling, analysis pipeline, local
//! result store and console synchronization engine for the device. It is
//! used by the main CLI binary and by the integration tests, which run the
//! whole pipeline against mock hardware and a scripted console.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod hardware;
pub mod store;
pub mod sync;
