//! # Rover Link
//!
//! Control, telemetry and media negotiation links between operator stations
//! and a teleoperated rover.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── ROVER ─────────────────────────────┐
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────────┐  │
//! │  │ Shared chan. │  │ Drive chan.  │  │ MediaServer (per cam) │  │
//! │  │ TCP server   │  │ UDP server   │  │ TCP control + UDP     │  │
//! │  └──────┬───────┘  └──────┬───────┘  └──────────┬────────────┘  │
//! │         │                 │                     │ spawns        │
//! │         │                 ▼                     ▼               │
//! │         │          ┌──────────────┐      ┌────────────┐         │
//! │         │          │DeviceChannel │      │  encoder   │         │
//! │         │          │ (per board)  │      │  process   │         │
//! │         │          └──────┬───────┘      └─────┬──────┘         │
//! └─────────┼─────────────────┼────────────────────┼────────────────┘
//!           │                 │ UDP                │ UDP media
//!           │                 ▼                    │
//!           │          ┌──────────────┐            │
//!           │          │ controller   │            │
//!           │          │ board        │            │
//!           │          │ (DeviceEndpoint)          │
//!           │          └──────────────┘            │
//!           │ TCP                                  ▼
//! ┌─────────┼──────────── MASTER STATION ─────────────────────────┐
//! │         ▼                                                     │
//! │  ┌──────────────┐    relay     ┌──────────────────────────┐   │
//! │  │ RelayRouter  │◀────────────▶│ MediaClient (per stream) │   │
//! │  └──────┬───────┘              └──────────────────────────┘   │
//! └─────────┼─────────────────────────────────────────────────────┘
//!           │ TCP, found by UDP broadcast
//!           ▼
//!     SLAVE STATIONS
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod media;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// First byte of a drive-channel message that is forwarded to the drive board
    pub const DRIVE_MESSAGE_TAG: u8 = 1;

    /// Default TCP port of the shared channel
    pub const DEFAULT_SHARED_PORT: u16 = 5300;

    /// Default UDP port of the drive channel
    pub const DEFAULT_DRIVE_PORT: u16 = 5301;

    /// Default UDP port for station discovery
    pub const DEFAULT_DISCOVERY_PORT: u16 = 5600;
}
