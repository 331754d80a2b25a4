//! # micrelay - Microphone-to-TCP Relay Node
//!
//! micrelay continuously captures a mono PCM stream from a digital
//! microphone and relays it in real time over a long-lived TCP connection
//! to a remote receiver, riding out wireless outages, signal degradation,
//! and transient capture faults.
//!
//! ## Architecture Overview
//!
//! The crate is organized around three cores and their supporting cast:
//!
//! - [`capture`] - DMA-driven ingest: 32-bit frame staging, 16-bit
//!   narrowing, failure classification, in-place driver recovery
//! - [`link`] - wireless association supervision, the TCP transport
//!   session, and signal-adaptive capture sizing
//! - [`orchestrator`] - the top-level state machine and cooperative tick
//!   loop that sequences everything
//! - [`config`] / [`console`] / [`logging`] / [`memory`] / [`stats`] /
//!   [`telemetry`] / [`watchdog`] - configuration with startup validation,
//!   the operator console, rate-limited tracing output, heap monitoring,
//!   shared counters, the volatile event ring, and the watchdog seam
//!
//! ## Key Properties
//!
//! - **Bit-exact delivery**: samples reach the receiver as raw
//!   little-endian 16-bit PCM in fixed-size chunks, no framing, no
//!   reordering
//! - **Single thread of control**: one cooperative tick loop; every
//!   blocking call carries a bounded deadline
//! - **Recovery without reboot**: backoff, reinitialization, and safe-mode
//!   maintenance keep the node reachable instead of power-cycling it
//!
//! ## Usage
//!
//! The binary assembles the host drivers and calls
//! [`orchestrator::Orchestrator::run`] in a restart loop; embedded ports
//! supply their own implementations of the driver seams
//! ([`capture::CaptureDriver`], [`link::WirelessInterface`],
//! [`memory::HeapProbe`], [`watchdog::Watchdog`]).

pub mod backoff;
pub mod capture;
pub mod config;
pub mod console;
pub mod error;
pub mod link;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod stats;
pub mod telemetry;
pub mod time;
pub mod watchdog;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use error::{RelayError, RelayResult};
pub use orchestrator::{ExitReason, NodeParts, NodeState, Orchestrator};
pub use stats::{Stats, StatsSnapshot};
