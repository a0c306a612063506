//! Error types shared by the whole engine.

use std::io;
use std::path::PathBuf;

use drm::control::{connector, crtc, Mode, RawResourceHandle};

/// Errors thrown by [`Gpu`](crate::Gpu) and its pipelines.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The device encountered an access error
    #[error("DRM access error: {0}")]
    Access(#[from] AccessError),
    /// Unable to determine the device id of the drm node
    #[error("Unable to determine device id of drm device")]
    UnableToGetDeviceId(#[source] rustix::io::Errno),
    /// Resource discovery yielded no usable crtc
    ///
    /// This is the only fatal initialization error; the device is
    /// non-functional without timing generators.
    #[error("Device `{0:?}` exposes no usable crtcs")]
    NoCrtcs(Option<PathBuf>),
    /// Device is currently paused
    #[error("Device is currently paused, operation rejected")]
    DeviceInactive,
    /// The connector reports no modes to choose from
    #[error("Connector `{0:?}` exposes no modes")]
    NoModes(connector::Handle),
    /// A required property is missing on a hardware object
    #[error("Missing required property '{name}' on handle ({handle:?})")]
    UnknownProperty {
        /// Handle of the object missing the property
        handle: RawResourceHandle,
        /// Name of the missing property
        name: &'static str,
    },
    /// The atomic test commit was rejected by the driver
    #[error("Atomic test rejected for mode `{0:?}`")]
    TestFailed(Mode),
    /// No plane could be matched to the crtc
    #[error("No primary plane found for crtc `{0:?}`")]
    NoPrimaryPlane(crtc::Handle),
    /// The connector has no live pipeline
    #[error("Connector `{0:?}` has no live pipeline")]
    NoPipeline(connector::Handle),
    /// A frame was submitted while the previous one is still pending
    #[error("A frame is already pending on connector `{0:?}`")]
    FramePending(connector::Handle),
    /// The renderer has not acknowledged the output yet
    #[error("Output on connector `{0:?}` is not ready for frames")]
    OutputNotReady(connector::Handle),
    /// A lease request could not be granted
    #[error("Lease rejected: {0}")]
    LeaseRejected(#[from] LeaseRejected),
}

/// Underlying ioctl failure with some context attached
#[derive(Debug, thiserror::Error)]
#[error("{errmsg} on device `{dev:?}` ({source})")]
pub struct AccessError {
    /// Error message associated to the access error
    pub errmsg: &'static str,
    /// Device on which the error was generated
    pub dev: Option<PathBuf>,
    /// Underlying device error
    pub source: io::Error,
}

/// Reasons for denying a lease request.
#[derive(Debug, thiserror::Error)]
pub enum LeaseRejected {
    /// A requested connector is not offered for leasing
    #[error("Connector `{0:?}` is not available for leasing")]
    NotLeasable(connector::Handle),
    /// A requested connector is already part of an active lease
    #[error("Connector `{0:?}` is already leased")]
    AlreadyLeased(connector::Handle),
    /// The request named no connectors
    #[error("Lease request contains no connectors")]
    Empty,
    /// The kernel rejected the lease
    #[error("Kernel rejected the lease ({0})")]
    Kernel(#[source] io::Error),
}
