//! Offline-first synchronization with the grower console.
//!
//! [`client`] speaks the console's REST protocol; [`engine`] decides what to
//! say. Records always land in the local store first and are reconciled
//! opportunistically, so the device keeps working with no connectivity.

pub mod client;
pub mod engine;

pub use client::{ConsoleApi, CreateSampleError, HttpConsoleClient, RemoteSample, SampleKey};
pub use engine::{ReconcileOptions, SyncEngine, SyncOutcome};
