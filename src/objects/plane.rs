//! Plane model.

use drm::control::{crtc, plane, Device as ControlDevice, PlaneType};
use drm_fourcc::DrmFourcc;

use crate::error::{AccessError, Error};
use crate::fd::{DevPath, GpuFd};

use super::{map_props, PropMap};

fn raw_prop(fd: &GpuFd, handle: plane::Handle, name: &str) -> Option<u64> {
    let props = fd.get_properties(handle).ok()?;
    props.into_iter().find_map(|(prop, value)| {
        let info = fd.get_property(prop).ok()?;
        (info.name().to_str() == Ok(name)).then_some(value)
    })
}

/// A scan-out surface, queried once at resource discovery.
#[derive(Debug)]
pub struct Plane {
    handle: plane::Handle,
    kind: PlaneType,
    formats: Vec<DrmFourcc>,
    compatible_crtcs: Vec<crtc::Handle>,
    current_crtc: Option<crtc::Handle>,
    pub(crate) props: PropMap,
}

impl Plane {
    pub(crate) fn new(fd: &GpuFd, handle: plane::Handle) -> Result<Self, Error> {
        let info = fd.get_plane(handle).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to get plane info",
                dev: fd.dev_path(),
                source,
            })
        })?;
        let res_handles = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source,
            })
        })?;

        // the `type` property is an enum, compare the raw value
        let kind = raw_prop(fd, handle, "type")
            .map(|v| match v {
                v if v == PlaneType::Primary as u64 => PlaneType::Primary,
                v if v == PlaneType::Cursor as u64 => PlaneType::Cursor,
                _ => PlaneType::Overlay,
            })
            .unwrap_or(PlaneType::Overlay);

        let formats = info
            .formats()
            .iter()
            .filter_map(|format| DrmFourcc::try_from(*format).ok())
            .collect();

        Ok(Plane {
            handle,
            kind,
            formats,
            compatible_crtcs: res_handles.filter_crtcs(info.possible_crtcs()),
            current_crtc: info.crtc(),
            props: map_props(fd, handle)?,
        })
    }

    /// Handle of the plane
    pub fn handle(&self) -> plane::Handle {
        self.handle
    }

    /// Primary, cursor or overlay
    pub fn kind(&self) -> PlaneType {
        self.kind
    }

    /// Pixel formats accepted for scan-out
    pub fn formats(&self) -> &[DrmFourcc] {
        &self.formats
    }

    /// Whether the plane can be routed to the given crtc
    pub fn supports_crtc(&self, crtc: crtc::Handle) -> bool {
        self.compatible_crtcs.contains(&crtc)
    }

    /// The crtc the plane was bound to when the device was opened
    pub(crate) fn current_crtc(&self) -> Option<crtc::Handle> {
        self.current_crtc
    }
}
