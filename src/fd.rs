//! Ref-counted handle of an open drm device node.

use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

use drm::control::Device as ControlDevice;
use drm::Device as BasicDevice;
use rustix::fs::fstat;

use tracing::{error, info, warn};

use crate::error::Error;

#[derive(Debug)]
struct InternalGpuFd {
    fd: OwnedFd,
    privileged: bool,
}

impl Drop for InternalGpuFd {
    fn drop(&mut self) {
        info!("Dropping device: {:?}", self.fd.dev_path());
        if self.privileged {
            if let Err(err) = self.release_master_lock() {
                error!("Failed to drop drm master state. Error: {}", err);
            }
        }
    }
}

impl AsFd for InternalGpuFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
impl BasicDevice for InternalGpuFd {}
impl ControlDevice for InternalGpuFd {}

/// Ref-counted file descriptor of an open drm device node.
///
/// Creating a `GpuFd` tries to acquire the drm master lock and releases
/// it again when the last clone is dropped. For that reason never create
/// two `GpuFd`s out of the same file descriptor, clone instead.
#[derive(Debug, Clone)]
pub struct GpuFd(Arc<InternalGpuFd>);

impl AsFd for GpuFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.fd.as_fd()
    }
}

impl AsRawFd for GpuFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.fd.as_raw_fd()
    }
}

impl BasicDevice for GpuFd {}
impl ControlDevice for GpuFd {}

impl GpuFd {
    /// Wrap an open drm node.
    ///
    /// We want to modeset, so we better be the master, if we run via a tty
    /// session. This is only needed on older kernels. Newer kernels grant
    /// this permission, if no other process is already the *master*, so we
    /// skip over this error.
    pub fn new(fd: OwnedFd) -> GpuFd {
        let mut dev = InternalGpuFd {
            fd,
            privileged: false,
        };
        if dev.acquire_master_lock().is_err() {
            warn!("Unable to become drm master, assuming unprivileged mode");
        } else {
            dev.privileged = true;
        }
        GpuFd(Arc::new(dev))
    }

    pub(crate) fn is_privileged(&self) -> bool {
        self.0.privileged
    }

    /// Returns the `dev_t` of the underlying device node
    pub fn dev_id(&self) -> Result<libc::dev_t, Error> {
        Ok(fstat(&self.0.fd).map_err(Error::UnableToGetDeviceId)?.st_rdev)
    }
}

/// Lookup of the path of an open device node, if possible.
pub trait DevPath {
    /// Returns the path of the open device if possible
    fn dev_path(&self) -> Option<PathBuf>;
}

impl<A: AsRawFd> DevPath for A {
    fn dev_path(&self) -> Option<PathBuf> {
        use std::fs;

        fs::read_link(format!("/proc/self/fd/{:?}", self.as_raw_fd())).ok()
    }
}
