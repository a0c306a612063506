//! Output negotiation and mode setting for drm devices.
//!
//! This crate drives the kernel mode setting side of a Wayland
//! compositor: it discovers the connectors, crtcs and planes of a GPU,
//! negotiates a working routing between them with driver-validated test
//! commits, manages the resulting outputs across hot-plug and session
//! switches, and hands non-desktop connectors out to clients as drm
//! leases.
//!
//! The entry point is [`Gpu`], one per drm node. It plugs into a
//! [`calloop`] event loop and emits a [`GpuEvent`] whenever a queued
//! frame reaches the screen:
//!
//! ```no_run
//! use std::fs::OpenOptions;
//! use std::os::unix::io::OwnedFd;
//!
//! use scanout::{Gpu, GpuFd, PlatformFlags};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let file = OpenOptions::new()
//!     .read(true)
//!     .write(true)
//!     .open("/dev/dri/card0")?;
//! let fd = GpuFd::new(OwnedFd::from(file));
//! let mut gpu = Gpu::new(fd, PlatformFlags::new())?;
//! for event in gpu.refresh_outputs()? {
//!     println!("{:?}", event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! All processing is single threaded on the event loop; the only
//! blocking operation is the bounded drain of in-flight page flips
//! before a renegotiation.

#![warn(missing_docs)]

mod error;
mod events;
mod fd;
mod gpu;
mod lease;
mod negotiate;
mod objects;
mod output;
mod pipeline;
mod reconcile;
mod time;

pub use error::{AccessError, Error, LeaseRejected};
pub use events::GpuEvent;
pub use fd::{DevPath, GpuFd};
pub use gpu::Gpu;
pub use lease::{LeaseGrant, LeaseRequest};
pub use objects::{Connector, Crtc, EncoderCaps, Plane};
pub use output::{
    DpmsMode, LeaseOutput, Output, OutputEvent, PlatformFlags, Transform, VirtualOutput,
};
pub use pipeline::Pipeline;
pub use time::{convert_timestamp, ClockDomain};
