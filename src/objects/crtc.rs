//! Crtc model.

use drm::control::{crtc, plane};

use crate::error::Error;
use crate::fd::GpuFd;

use super::{map_props, PropMap};

/// A hardware timing generator.
///
/// Discovered once at device initialization, not hot-pluggable. In atomic
/// mode every crtc is paired with a dedicated primary plane; legacy mode
/// leaves `primary_plane` unset.
#[derive(Debug)]
pub struct Crtc {
    handle: crtc::Handle,
    index: usize,
    primary_plane: Option<plane::Handle>,
    pub(crate) props: PropMap,
}

impl Crtc {
    pub(crate) fn new(
        fd: &GpuFd,
        handle: crtc::Handle,
        index: usize,
        primary_plane: Option<plane::Handle>,
    ) -> Result<Self, Error> {
        let props = map_props(fd, handle)?;
        Ok(Crtc {
            handle,
            index,
            primary_plane,
            props,
        })
    }

    /// Handle of the crtc
    pub fn handle(&self) -> crtc::Handle {
        self.handle
    }

    /// Position of the crtc in the device's resource list
    pub fn index(&self) -> usize {
        self.index
    }

    /// The primary plane assigned to this crtc (atomic mode only)
    pub fn primary_plane(&self) -> Option<plane::Handle> {
        self.primary_plane
    }
}
