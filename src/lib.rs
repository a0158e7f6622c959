//! Decoder Supervisor - lifecycle management for external decoder pipelines.
//!
//! Decoder programs run as ordered stages of a [`supervisor::PipelineSession`];
//! their output lines fan out through a [`bus::EventBus`], and a process-wide
//! [`supervisor::SupervisorRegistry`] keeps at most one session per decoder.

pub mod bus;
pub mod config;
pub mod dashboard;
pub mod display;
pub mod process;
pub mod publish;
pub mod supervisor;
