//! Connector model.

use drm::control::{connector, crtc, property, Device as ControlDevice, Mode, ModeTypeFlags};
use smallvec::SmallVec;

use tracing::debug;

use crate::error::{AccessError, Error};
use crate::fd::{DevPath, GpuFd};

use super::{map_props, read_prop, PropMap};

/// One encoder of a connector together with the crtcs it can drive.
#[derive(Debug, Clone)]
pub struct EncoderCaps {
    /// Handle of the encoder
    pub handle: drm::control::encoder::Handle,
    /// Crtcs this encoder can be routed to
    pub crtcs: Vec<crtc::Handle>,
}

/// A physical display output port.
///
/// Created on first enumeration or on hot-plug, destroyed on hot-unplug
/// after its output has been torn down. All fields are refreshed from the
/// kernel by [`Connector::update`].
#[derive(Debug)]
pub struct Connector {
    handle: connector::Handle,
    name: String,
    connected: bool,
    non_desktop: bool,
    crtc_hint: Option<crtc::Handle>,
    encoders: SmallVec<[EncoderCaps; 2]>,
    modes: Vec<Mode>,
    pub(crate) props: PropMap,
}

impl Connector {
    /// Creates and initializes the model for a connector handle.
    pub(crate) fn new(fd: &GpuFd, handle: connector::Handle) -> Result<Self, Error> {
        let props = map_props(fd, handle)?;
        let mut conn = Connector {
            handle,
            name: String::new(),
            connected: false,
            non_desktop: false,
            crtc_hint: None,
            encoders: SmallVec::new(),
            modes: Vec::new(),
            props,
        };
        conn.update(fd)?;
        debug!(name = conn.name, connected = conn.connected, "Initialized connector");
        Ok(conn)
    }

    /// Re-reads connection state and mutable properties from the kernel.
    pub(crate) fn update(&mut self, fd: &GpuFd) -> Result<(), Error> {
        let info = fd.get_connector(self.handle, false).map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading connector info",
                dev: fd.dev_path(),
                source,
            })
        })?;

        self.name = format!("{}-{}", info.interface().as_str(), info.interface_id());
        self.connected = info.state() == connector::State::Connected;
        self.modes = info.modes().to_vec();

        let res_handles = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading drm resources",
                dev: fd.dev_path(),
                source,
            })
        })?;
        self.encoders = info
            .encoders()
            .iter()
            .filter_map(|enc| fd.get_encoder(*enc).ok())
            .map(|enc_info| EncoderCaps {
                handle: enc_info.handle(),
                crtcs: res_handles.filter_crtcs(enc_info.possible_crtcs()),
            })
            .collect();

        self.non_desktop = read_prop(fd, self.handle, "non-desktop", |v| v.as_boolean())
            .unwrap_or(false);
        self.crtc_hint = read_prop(fd, self.handle, "CRTC_ID", |v| match v {
            property::Value::CRTC(c) => Some(c),
            _ => None,
        })
        .flatten();

        Ok(())
    }

    /// Handle of the connector
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Human readable name, e.g. `DP-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a display is attached
    pub fn connected(&self) -> bool {
        self.connected
    }

    /// Whether the port drives a non-desktop display (e.g. a VR headset)
    ///
    /// Non-desktop connectors are routed to lease outputs instead of
    /// desktop outputs.
    pub fn non_desktop(&self) -> bool {
        self.non_desktop
    }

    /// The crtc this connector is currently routed to, according to the
    /// kernel's `CRTC_ID` property. Used as the preferred binding during
    /// negotiation to minimize disruptive reassignment.
    pub fn crtc_hint(&self) -> Option<crtc::Handle> {
        self.crtc_hint
    }

    /// Compatible encoders with their reachable crtcs
    pub fn encoders(&self) -> &[EncoderCaps] {
        &self.encoders
    }

    /// Modes reported by the display
    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    /// The mode a fresh pipeline for this connector gets configured with.
    pub fn preferred_mode(&self) -> Result<Mode, Error> {
        self.modes
            .iter()
            .find(|mode| mode.mode_type().contains(ModeTypeFlags::PREFERRED))
            .or_else(|| self.modes.first())
            .copied()
            .ok_or(Error::NoModes(self.handle))
    }
}
