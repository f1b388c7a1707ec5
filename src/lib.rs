//! Sampling engine for an Arm CPU performance-event profiling daemon:
//! ring-buffer draining, event-group binding, and APC frame packing.
//!
//! This crate implements the sampling engine only. The XML configuration
//! loader, CLI, session handshake, environment preparation and transport
//! are external collaborators that consume the crate through the
//! `CaptureConfig`/`Sink` seams in [`config`] and [`sink`].

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate failure_derive;
#[macro_use]
extern crate log;
#[macro_use]
extern crate nix;

extern crate bytes;
extern crate failure;
extern crate libc;
extern crate page_size;

pub mod activator;
pub mod apc;
pub mod arena;
pub mod aux;
pub mod binding;
pub mod config;
pub mod cpumon;
pub mod error;
pub mod frame;
pub mod mmap;
pub mod orchestrator;
pub mod ring;
pub mod signal;
pub mod sink;
pub mod sync_source;

pub mod raw;

pub use config::CaptureConfig;
pub use error::{Error, Result};
pub use orchestrator::CaptureOrchestrator;
pub use sink::{FileSink, Sink};
