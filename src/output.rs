//! Output objects managed by the device.
//!
//! Three kinds of outputs exist. [`Output`] is a desktop output backed by
//! a committed pipeline. [`LeaseOutput`] wraps a non-desktop connector
//! (e.g. a VR headset) that is offered to clients for leasing instead of
//! being composited. [`VirtualOutput`] has no hardware backing at all and
//! exists purely by request of the compositor.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use drm::buffer::DrmFourcc;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{connector, crtc, Device as ControlDevice, Mode};
use tracing::warn;

use crate::fd::GpuFd;

/// Display power state of an output, as requested by the compositor.
///
/// There is no separate enabled flag; an output counts as enabled
/// exactly when its power state [`is_on`](Self::is_on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpmsMode {
    /// Output is scanning out
    On,
    /// Display in standby, pipeline kept
    Standby,
    /// Display suspended, pipeline kept
    Suspend,
    /// Output fully off
    Off,
}

impl DpmsMode {
    /// Whether the pipeline should be actively driven in this state
    pub fn is_on(self) -> bool {
        matches!(self, DpmsMode::On)
    }
}

/// Rotation and reflection of an output's content.
///
/// Purely output state from the engine's point of view; the renderer
/// applies it. Preserved when a refresh reattaches the output to a
/// different crtc.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Upright
    #[default]
    Normal,
    /// Rotated by 90 degrees counter-clockwise
    Rotate90,
    /// Rotated by 180 degrees
    Rotate180,
    /// Rotated by 270 degrees counter-clockwise
    Rotate270,
    /// Mirrored along the vertical axis
    Flipped,
    /// Mirrored, then rotated by 90 degrees
    Flipped90,
    /// Mirrored, then rotated by 180 degrees
    Flipped180,
    /// Mirrored, then rotated by 270 degrees
    Flipped270,
}

/// Flags shared across all devices of the platform.
///
/// Passed explicitly to every device instead of living in a global, so
/// tests can run with isolated instances.
#[derive(Debug, Default, Clone)]
pub struct PlatformFlags {
    software_cursor_forced: Arc<AtomicBool>,
}

impl PlatformFlags {
    /// Creates a fresh set of flags, to be shared between devices.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any device failed to set up a hardware cursor.
    ///
    /// Once set this never clears; mixing hardware and software cursors
    /// across screens gives visibly inconsistent latency.
    pub fn software_cursor_forced(&self) -> bool {
        self.software_cursor_forced.load(Ordering::Relaxed)
    }

    pub(crate) fn force_software_cursor(&self) {
        self.software_cursor_forced.store(true, Ordering::Relaxed);
    }
}

/// A desktop output driven by a committed pipeline.
#[derive(Debug)]
pub struct Output {
    connector: connector::Handle,
    crtc: crtc::Handle,
    name: String,
    mode: Mode,
    dpms: DpmsMode,
    transform: Transform,
    flip_pending: bool,
    render_ready: bool,
    cursor: Option<DumbBuffer>,
}

impl Output {
    pub(crate) fn new(
        connector: connector::Handle,
        crtc: crtc::Handle,
        name: String,
        mode: Mode,
    ) -> Self {
        Output {
            connector,
            crtc,
            name,
            mode,
            dpms: DpmsMode::On,
            transform: Transform::Normal,
            flip_pending: false,
            render_ready: false,
            cursor: None,
        }
    }

    /// Tries to bring up a hardware cursor for this output.
    ///
    /// On failure the platform-wide software cursor flag is raised and
    /// the output continues without one.
    pub(crate) fn init_cursor(&mut self, fd: &GpuFd, size: (u32, u32), platform: &PlatformFlags) {
        let buffer = fd
            .create_dumb_buffer(size, DrmFourcc::Argb8888, 32)
            .and_then(|buffer| fd.set_cursor(self.crtc, Some(&buffer)).map(|_| buffer));
        match buffer {
            Ok(buffer) => self.cursor = Some(buffer),
            Err(err) => {
                warn!(output = self.name, "Hardware cursor unavailable: {}", err);
                platform.force_software_cursor();
            }
        }
    }

    pub(crate) fn destroy(&mut self, fd: &GpuFd) {
        if let Some(cursor) = self.cursor.take() {
            let _ = fd.set_cursor(self.crtc, Option::<&DumbBuffer>::None);
            let _ = fd.destroy_dumb_buffer(cursor);
        }
    }

    /// Connector this output presents on
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Crtc driving the output
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Human readable name, e.g. `DP-1`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Currently committed mode
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub(crate) fn set_route(&mut self, crtc: crtc::Handle) {
        self.crtc = crtc;
    }

    /// Current power state
    pub fn dpms(&self) -> DpmsMode {
        self.dpms
    }

    pub(crate) fn set_dpms(&mut self, dpms: DpmsMode) {
        self.dpms = dpms;
    }

    /// Rotation and reflection applied by the renderer
    pub fn transform(&self) -> Transform {
        self.transform
    }

    /// Sets the output's transform. The engine only stores it; it
    /// survives route changes on refresh.
    pub fn set_transform(&mut self, transform: Transform) {
        self.transform = transform;
    }

    /// Whether a submitted frame has not yet been presented
    pub fn frame_pending(&self) -> bool {
        self.flip_pending
    }

    pub(crate) fn set_frame_pending(&mut self, pending: bool) {
        self.flip_pending = pending;
    }

    /// Whether the renderer has acknowledged this output.
    ///
    /// Frames are rejected until the compositor calls
    /// [`ack_render_ready`](Self::ack_render_ready) after allocating its
    /// render resources for the new output.
    pub fn render_ready(&self) -> bool {
        self.render_ready
    }

    /// Marks the output ready to receive frames.
    pub fn ack_render_ready(&mut self) {
        self.render_ready = true;
    }
}

/// A non-desktop connector offered for leasing.
#[derive(Debug)]
pub struct LeaseOutput {
    connector: connector::Handle,
    crtc: crtc::Handle,
    name: String,
    lessee: Option<NonZeroU32>,
}

impl LeaseOutput {
    pub(crate) fn new(connector: connector::Handle, crtc: crtc::Handle, name: String) -> Self {
        LeaseOutput {
            connector,
            crtc,
            name,
            lessee: None,
        }
    }

    /// Connector offered by this lease output
    pub fn connector(&self) -> connector::Handle {
        self.connector
    }

    /// Crtc reserved for the lease
    pub fn crtc(&self) -> crtc::Handle {
        self.crtc
    }

    /// Human readable name of the underlying connector
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the lessee currently holding this output, if leased
    pub fn lessee(&self) -> Option<NonZeroU32> {
        self.lessee
    }

    pub(crate) fn set_lessee(&mut self, lessee: Option<NonZeroU32>) {
        self.lessee = lessee;
    }

    pub(crate) fn set_route(&mut self, crtc: crtc::Handle) {
        self.crtc = crtc;
    }

    /// Whether the output is currently handed out to a client
    pub fn is_leased(&self) -> bool {
        self.lessee.is_some()
    }
}

/// A purely software backed output without any hardware pipeline.
#[derive(Debug)]
pub struct VirtualOutput {
    id: u32,
    name: String,
    size: (u32, u32),
}

impl VirtualOutput {
    pub(crate) fn new(id: u32, name: String, size: (u32, u32)) -> Self {
        VirtualOutput { id, name, size }
    }

    /// Device-local id of the virtual output
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pixel size given at creation
    pub fn size(&self) -> (u32, u32) {
        self.size
    }
}

/// Output set changes produced by a refresh or by explicit requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputEvent {
    /// A new desktop output appeared
    OutputAdded(connector::Handle),
    /// A desktop output was removed
    OutputRemoved(connector::Handle),
    /// A refresh reattached an output that is powered down; the output
    /// keeps its routing but is not scanning out
    OutputDisabled(connector::Handle),
    /// A new lease output appeared
    LeaseOutputAdded(connector::Handle),
    /// A lease output was removed
    LeaseOutputRemoved(connector::Handle),
    /// A virtual output was created
    VirtualOutputAdded(u32),
    /// A virtual output was removed
    VirtualOutputRemoved(u32),
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use super::*;

    fn mode_1080p() -> Mode {
        Mode::from(drm_ffi::drm_mode_modeinfo {
            clock: 148_500,
            hdisplay: 1920,
            hsync_start: 2008,
            hsync_end: 2052,
            htotal: 2200,
            vdisplay: 1080,
            vsync_start: 1084,
            vsync_end: 1089,
            vtotal: 1125,
            vrefresh: 60,
            flags: 0,
            type_: 0,
            name: [0; 32],
            hskew: 0,
            vscan: 0,
        })
    }

    fn crtc(raw: u32) -> crtc::Handle {
        crtc::Handle::from(NonZeroU32::new(raw).unwrap())
    }

    fn output() -> Output {
        Output::new(
            connector::Handle::from(NonZeroU32::new(10).unwrap()),
            crtc(1),
            "DP-1".into(),
            mode_1080p(),
        )
    }

    #[test]
    fn transform_survives_a_route_change() {
        let mut output = output();
        assert_eq!(output.transform(), Transform::Normal);

        output.set_transform(Transform::Rotate90);
        output.set_route(crtc(2));
        assert_eq!(output.crtc(), crtc(2));
        assert_eq!(output.transform(), Transform::Rotate90);
    }

    #[test]
    fn dpms_on_is_the_enabled_state() {
        let mut output = output();
        assert!(output.dpms().is_on());
        output.set_dpms(DpmsMode::Standby);
        assert!(!output.dpms().is_on());
    }
}
