//! The per-device engine tying discovery, negotiation, commits, outputs
//! and leases together.
//!
//! A [`Gpu`] owns one drm node. It probes the device's capabilities once
//! at creation, keeps arenas of the discovered hardware objects and, on
//! every [`refresh_outputs`](Gpu::refresh_outputs), renegotiates the
//! connector to crtc routing and reconciles the output set with the
//! result. All of it runs on the calloop thread; the only blocking wait
//! is the bounded idle drain before a renegotiation.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::{Interest, Mode as TriggerMode};
use drm::control::{connector, crtc, plane, Device as ControlDevice, Event, Mode, PlaneType};
use drm::{ClientCapability, Device as BasicDevice, DriverCapability};
use drm_fourcc::DrmFourcc;
use indexmap::IndexMap;
use rustix::event::{PollFd, PollFlags};
use tracing::{debug, info, info_span, warn};

use crate::error::{AccessError, Error};
use crate::events::GpuEvent;
use crate::fd::{DevPath, GpuFd};
use crate::lease::{self, LeaseGrant, LeaseRequest};
use crate::negotiate::{negotiate, sort_bound_first, Assignment, SearchConnector};
use crate::objects::{Connector, Crtc, Plane};
use crate::output::{DpmsMode, LeaseOutput, Output, OutputEvent, PlatformFlags, VirtualOutput};
use crate::pipeline::{self, Pipeline, PipelineConfig, ScratchFramebuffer};
use crate::reconcile::{self, OutputAction};
use crate::time::{convert_timestamp, ClockDomain};

/// How long a refresh waits for in-flight page flips before it gives up
/// and proceeds with the renegotiation.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Bookkeeping for a lease handed out to a client. The client-facing fd
/// lives in the [`LeaseGrant`]; only the ids stay here.
#[derive(Debug)]
struct ActiveLease {
    lessee_id: NonZeroU32,
    connectors: Vec<connector::Handle>,
    crtcs: Vec<crtc::Handle>,
}

/// One GPU as seen by the engine.
pub struct Gpu {
    pub(crate) fd: GpuFd,
    platform: PlatformFlags,
    pub(crate) active: bool,
    atomic: bool,
    cursor_size: (u32, u32),
    pub(crate) clock: ClockDomain,
    pub(crate) connectors: IndexMap<connector::Handle, Connector>,
    crtcs: IndexMap<crtc::Handle, Crtc>,
    planes: IndexMap<plane::Handle, Plane>,
    pipelines: Vec<Pipeline>,
    outputs: IndexMap<connector::Handle, Output>,
    lease_outputs: IndexMap<connector::Handle, LeaseOutput>,
    virtual_outputs: Vec<VirtualOutput>,
    next_virtual_id: u32,
    leases: Vec<ActiveLease>,
    blank_buffers: HashMap<crtc::Handle, ScratchFramebuffer>,
    /// Events drained inline by `wait_idle`, delivered on the next turn
    /// of the event loop.
    pub(crate) queued_events: Vec<GpuEvent>,
    pub(crate) source: Generic<GpuFd>,
    pub(crate) span: tracing::Span,
}

impl Gpu {
    /// Probes the device and prepares it for mode setting.
    ///
    /// Atomic mode setting is negotiated if the driver offers it and
    /// every crtc can be paired with a primary plane; otherwise the
    /// device permanently falls back to the legacy api. The only fatal
    /// condition is a device without crtcs. Connectors are discovered by
    /// the first [`refresh_outputs`](Self::refresh_outputs).
    pub fn new(fd: GpuFd, platform: PlatformFlags) -> Result<Self, Error> {
        let span = info_span!("scanout_device", device = ?fd.dev_path());
        let _guard = span.enter();

        let force_legacy = std::env::var("SCANOUT_USE_LEGACY")
            .map(|x| {
                x == "1" || x.to_lowercase() == "true" || x.to_lowercase() == "yes"
            })
            .unwrap_or(false);
        if force_legacy {
            info!("SCANOUT_USE_LEGACY is set. Forcing the legacy api.");
        }

        let universal_planes = fd
            .set_client_capability(ClientCapability::UniversalPlanes, true)
            .is_ok();
        let mut atomic = !force_legacy
            && universal_planes
            && fd.set_client_capability(ClientCapability::Atomic, true).is_ok();

        let clock = if fd
            .get_driver_capability(DriverCapability::MonotonicTimestamp)
            .unwrap_or(0)
            == 1
        {
            ClockDomain::Monotonic
        } else {
            ClockDomain::Realtime
        };
        let cursor_size = (
            fd.get_driver_capability(DriverCapability::CursorWidth)
                .unwrap_or(64) as u32,
            fd.get_driver_capability(DriverCapability::CursorHeight)
                .unwrap_or(64) as u32,
        );

        let res_handles = fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading resource handles",
                dev: fd.dev_path(),
                source,
            })
        })?;
        let crtc_handles = res_handles.crtcs().to_vec();
        if crtc_handles.is_empty() {
            return Err(Error::NoCrtcs(fd.dev_path()));
        }

        let mut planes = IndexMap::new();
        if atomic {
            match fd.plane_handles() {
                Ok(handles) => {
                    for handle in handles {
                        match Plane::new(&fd, handle) {
                            Ok(plane) => {
                                planes.insert(handle, plane);
                            }
                            Err(err) => warn!(?handle, "Skipping plane: {}", err),
                        }
                    }
                }
                Err(err) => {
                    warn!("Failed to enumerate planes, using the legacy api: {}", err);
                    atomic = false;
                }
            }
        }

        let crtcs = if atomic {
            match build_crtcs(&fd, &crtc_handles, &planes, true)? {
                Some(crtcs) => crtcs,
                None => {
                    warn!("Not every crtc has a primary plane, using the legacy api");
                    atomic = false;
                    planes.clear();
                    build_crtcs(&fd, &crtc_handles, &planes, false)?
                        .unwrap_or_default()
                }
            }
        } else {
            planes.clear();
            build_crtcs(&fd, &crtc_handles, &planes, false)?.unwrap_or_default()
        };

        info!(
            atomic,
            ?clock,
            crtcs = crtcs.len(),
            "Initialized scanout device"
        );

        let source = Generic::new(fd.clone(), Interest::READ, TriggerMode::Level);
        drop(_guard);
        Ok(Gpu {
            fd,
            platform,
            active: true,
            atomic,
            cursor_size,
            clock,
            connectors: IndexMap::new(),
            crtcs,
            planes,
            pipelines: Vec::new(),
            outputs: IndexMap::new(),
            lease_outputs: IndexMap::new(),
            virtual_outputs: Vec::new(),
            next_virtual_id: 0,
            leases: Vec::new(),
            blank_buffers: HashMap::new(),
            queued_events: Vec::new(),
            source,
            span,
        })
    }

    /// Re-scans connectors, renegotiates the routing and reconciles the
    /// output set with the result.
    ///
    /// When no candidate configuration passes validation the previously
    /// committed configuration stays in place untouched. Leased
    /// connectors and their crtcs never participate.
    #[profiling::function]
    pub fn refresh_outputs(&mut self) -> Result<Vec<OutputEvent>, Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let span = self.span.clone();
        let _guard = span.enter();

        self.wait_idle();
        self.reconcile_leases();

        let res_handles = self.fd.resource_handles().map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Error loading resource handles",
                dev: self.fd.dev_path(),
                source,
            })
        })?;
        let current: Vec<connector::Handle> = res_handles.connectors().to_vec();

        for &handle in &current {
            if let Some(conn) = self.connectors.get_mut(&handle) {
                if let Err(err) = conn.update(&self.fd) {
                    warn!(?handle, "Failed to update connector: {}", err);
                }
            } else {
                match Connector::new(&self.fd, handle) {
                    Ok(conn) => {
                        debug!(name = conn.name(), "Discovered connector");
                        self.connectors.insert(handle, conn);
                    }
                    Err(err) => warn!(?handle, "Skipping connector: {}", err),
                }
            }
        }

        // a vanished or unplugged connector terminates its lease
        let mut events = Vec::new();
        let dead_leases: Vec<connector::Handle> = self
            .lease_outputs
            .values()
            .filter(|lo| lo.is_leased())
            .map(|lo| lo.connector())
            .filter(|conn| {
                !current.contains(conn)
                    || !self.connectors.get(conn).map(|c| c.connected()).unwrap_or(false)
            })
            .collect();
        for conn in dead_leases {
            if let Some(lo) = self.lease_outputs.shift_remove(&conn) {
                if let Some(id) = lo.lessee() {
                    self.revoke_lease(id);
                }
                events.push(OutputEvent::LeaseOutputRemoved(conn));
            }
        }

        // outputs of unplugged or vanished connectors are torn down
        // before the search runs; a failed negotiation rolls back to the
        // surviving set only
        let connected: Vec<connector::Handle> = self
            .connectors
            .values()
            .filter(|conn| conn.connected() && current.contains(&conn.handle()))
            .map(|conn| conn.handle())
            .collect();
        let existing_outputs: Vec<connector::Handle> = self.outputs.keys().copied().collect();
        for conn in reconcile::vanished(&existing_outputs, &connected) {
            if let Some(mut output) = self.outputs.shift_remove(&conn) {
                info!(name = output.name(), "Removing output");
                output.destroy(&self.fd);
                events.push(OutputEvent::OutputRemoved(conn));
            }
        }
        let existing_lease_outputs: Vec<connector::Handle> = self
            .lease_outputs
            .values()
            .filter(|lo| !lo.is_leased())
            .map(|lo| lo.connector())
            .collect();
        for conn in reconcile::vanished(&existing_lease_outputs, &connected) {
            if self.lease_outputs.shift_remove(&conn).is_some() {
                events.push(OutputEvent::LeaseOutputRemoved(conn));
            }
        }

        let leased_conns: Vec<connector::Handle> = self
            .leases
            .iter()
            .flat_map(|l| l.connectors.iter().copied())
            .collect();
        let leased_crtcs: Vec<crtc::Handle> = self
            .leases
            .iter()
            .flat_map(|l| l.crtcs.iter().copied())
            .collect();

        let mut search: Vec<SearchConnector> = self
            .connectors
            .values()
            .filter(|conn| {
                conn.connected()
                    && current.contains(&conn.handle())
                    && !leased_conns.contains(&conn.handle())
            })
            .map(|conn| SearchConnector {
                handle: conn.handle(),
                crtc_hint: conn.crtc_hint(),
                encoders: conn.encoders().iter().map(|enc| enc.crtcs.clone()).collect(),
            })
            .collect();
        sort_bound_first(&mut search);

        let free_crtcs: Vec<crtc::Handle> = self
            .crtcs
            .keys()
            .copied()
            .filter(|handle| !leased_crtcs.contains(handle))
            .collect();

        let previous = std::mem::take(&mut self.pipelines);

        // pick a mode per candidate up front, keeping working modes
        let mut modes: HashMap<connector::Handle, Mode> = HashMap::new();
        for candidate in &search {
            let conn = &self.connectors[&candidate.handle];
            let kept = previous
                .iter()
                .find(|p| p.connector == candidate.handle)
                .map(|p| p.mode)
                .filter(|mode| conn.modes().contains(mode));
            match kept.map(Ok).unwrap_or_else(|| conn.preferred_mode()) {
                Ok(mode) => {
                    modes.insert(candidate.handle, mode);
                }
                Err(err) => warn!(name = conn.name(), "Skipping connector: {}", err),
            }
        }
        search.retain(|candidate| modes.contains_key(&candidate.handle));

        let fd = &self.fd;
        let atomic = self.atomic;
        let connectors = &self.connectors;
        let crtcs = &self.crtcs;
        let planes = &self.planes;
        let mut validate = |set: &[Assignment]| {
            let configs: Vec<PipelineConfig<'_>> = set
                .iter()
                .map(|a| PipelineConfig {
                    connector: &connectors[&a.connector],
                    crtc: &crtcs[&a.crtc],
                    plane: crtcs[&a.crtc].primary_plane().map(|p| &planes[&p]),
                    mode: modes[&a.connector],
                    active: true,
                })
                .collect();
            match pipeline::test_configuration(fd, atomic, &configs) {
                Ok(()) => true,
                Err(err) => {
                    debug!("Candidate configuration rejected: {}", err);
                    false
                }
            }
        };
        let accepted = negotiate(&search, &free_crtcs, atomic, &mut validate);

        if accepted.is_empty() && !search.is_empty() {
            warn!("No working configuration found, keeping the previous one");
            self.pipelines = previous
                .into_iter()
                .filter(|p| self.outputs.contains_key(&p.connector))
                .collect();
            self.connectors.retain(|handle, _| current.contains(handle));
            return Ok(events);
        }

        let non_desktop: Vec<connector::Handle> = self
            .connectors
            .values()
            .filter(|conn| conn.non_desktop())
            .map(|conn| conn.handle())
            .collect();

        // commit the new desktop routing; lease routes are only reserved.
        // outputs that were powered down stay that way
        let new_pipelines: Vec<Pipeline> = accepted
            .iter()
            .filter(|a| !non_desktop.contains(&a.connector))
            .map(|a| Pipeline {
                connector: a.connector,
                crtc: a.crtc,
                mode: modes[&a.connector],
                active: self
                    .outputs
                    .get(&a.connector)
                    .map(|o| o.dpms().is_on())
                    .unwrap_or(true),
            })
            .collect();

        let mut configs: Vec<PipelineConfig<'_>> = Vec::new();
        for old in &previous {
            let still_driven = new_pipelines.iter().any(|p| p.crtc == old.crtc);
            if !still_driven && self.connectors.contains_key(&old.connector) {
                configs.push(PipelineConfig {
                    connector: &self.connectors[&old.connector],
                    crtc: &self.crtcs[&old.crtc],
                    plane: self.crtcs[&old.crtc].primary_plane().map(|p| &self.planes[&p]),
                    mode: old.mode,
                    active: false,
                });
            }
        }
        for pipeline in &new_pipelines {
            configs.push(PipelineConfig {
                connector: &self.connectors[&pipeline.connector],
                crtc: &self.crtcs[&pipeline.crtc],
                plane: self.crtcs[&pipeline.crtc]
                    .primary_plane()
                    .map(|p| &self.planes[&p]),
                mode: pipeline.mode,
                active: pipeline.active,
            });
        }

        let blanks = pipeline::apply_configuration(&self.fd, self.atomic, &configs)?;
        drop(configs);
        for (crtc, blank) in blanks {
            if let Some(old) = self.blank_buffers.insert(crtc, blank) {
                old.destroy(&self.fd);
            }
        }

        // not leased means available for planning; leased outputs above
        // already survived or were torn down
        let outputs_order: Vec<connector::Handle> = self.outputs.keys().copied().collect();
        let leases_order: Vec<connector::Handle> = self
            .lease_outputs
            .values()
            .filter(|lo| !lo.is_leased())
            .map(|lo| lo.connector())
            .collect();
        let disabled: Vec<connector::Handle> = self
            .outputs
            .values()
            .filter(|output| !output.dpms().is_on())
            .map(|output| output.connector())
            .collect();
        let plan = reconcile::plan(&accepted, &non_desktop, &disabled, &outputs_order, &leases_order);

        for action in plan {
            match action {
                OutputAction::RemoveOutput(conn) => {
                    if let Some(mut output) = self.outputs.shift_remove(&conn) {
                        info!(name = output.name(), "Removing output");
                        output.destroy(&self.fd);
                        events.push(OutputEvent::OutputRemoved(conn));
                    }
                }
                OutputAction::RemoveLease(conn) => {
                    if self.lease_outputs.shift_remove(&conn).is_some() {
                        events.push(OutputEvent::LeaseOutputRemoved(conn));
                    }
                }
                OutputAction::AddOutput(conn, crtc) => {
                    let name = self.connectors[&conn].name().to_owned();
                    info!(name, "Adding output");
                    let mut output = Output::new(conn, crtc, name, modes[&conn]);
                    output.init_cursor(&self.fd, self.cursor_size, &self.platform);
                    self.outputs.insert(conn, output);
                    events.push(OutputEvent::OutputAdded(conn));
                }
                OutputAction::AddLease(conn, crtc) => {
                    let name = self.connectors[&conn].name().to_owned();
                    info!(name, "Offering connector for leasing");
                    self.lease_outputs
                        .insert(conn, LeaseOutput::new(conn, crtc, name));
                    events.push(OutputEvent::LeaseOutputAdded(conn));
                }
                OutputAction::Reattach(conn, crtc) => {
                    if let Some(output) = self.outputs.get_mut(&conn) {
                        output.set_route(crtc);
                        output.set_mode(modes[&conn]);
                    }
                }
                OutputAction::ReattachLease(conn, crtc) => {
                    if let Some(lo) = self.lease_outputs.get_mut(&conn) {
                        lo.set_route(crtc);
                    }
                }
                OutputAction::NotifyDisabled(conn) => {
                    events.push(OutputEvent::OutputDisabled(conn));
                }
            }
        }

        self.pipelines = new_pipelines;
        self.connectors.retain(|handle, _| current.contains(handle));
        Ok(events)
    }

    /// Drains in-flight page flips before state is torn down or rebuilt.
    ///
    /// Bounded by [`IDLE_TIMEOUT`]; on timeout or error the pending
    /// flags are cleared and the refresh proceeds anyway. Events read
    /// here are queued and delivered on the next event loop turn.
    pub(crate) fn wait_idle(&mut self) {
        let start = ClockDomain::Monotonic.now();
        while self.outputs.values().any(|output| output.frame_pending()) {
            let elapsed = ClockDomain::Monotonic.now().saturating_sub(start);
            let Some(remaining) = IDLE_TIMEOUT.checked_sub(elapsed) else {
                warn!("Timed out waiting for pending page flips");
                self.clear_pending_flags();
                break;
            };

            let ready = {
                let mut fds = [PollFd::new(&self.fd, PollFlags::IN)];
                rustix::event::poll(&mut fds, remaining.as_millis() as i32)
            };
            match ready {
                Ok(0) => {
                    warn!("Timed out waiting for pending page flips");
                    self.clear_pending_flags();
                    break;
                }
                Ok(_) => match self.fd.receive_events() {
                    Ok(kernel_events) => {
                        let kernel_events: Vec<Event> = kernel_events.collect();
                        let decoded = self.process_kernel_events(kernel_events);
                        self.queued_events.extend(decoded);
                    }
                    Err(err) => {
                        warn!("Error reading drm events while draining: {}", err);
                        self.clear_pending_flags();
                        break;
                    }
                },
                Err(rustix::io::Errno::INTR) => continue,
                Err(err) => {
                    warn!("Error waiting for pending page flips: {}", err);
                    self.clear_pending_flags();
                    break;
                }
            }
        }
    }

    fn clear_pending_flags(&mut self) {
        for output in self.outputs.values_mut() {
            output.set_frame_pending(false);
        }
    }

    /// Decodes raw kernel events into [`GpuEvent`]s, clearing pending
    /// flags and retiring blank framebuffers along the way.
    pub(crate) fn process_kernel_events(
        &mut self,
        kernel_events: impl IntoIterator<Item = Event>,
    ) -> Vec<GpuEvent> {
        let mut decoded = Vec::new();
        for event in kernel_events {
            let Event::PageFlip(flip) = event else {
                continue;
            };
            let Some(pipeline) = self.pipelines.iter().find(|p| p.crtc == flip.crtc) else {
                debug!(crtc = ?flip.crtc, "Page flip for unknown crtc");
                continue;
            };
            let connector = pipeline.connector;
            if let Some(output) = self.outputs.get_mut(&connector) {
                output.set_frame_pending(false);
            }
            // the blank frame is off screen once the first flip retires
            if let Some(blank) = self.blank_buffers.remove(&flip.crtc) {
                blank.destroy(&self.fd);
            }
            // zero means the driver supplied no timestamp, substituted
            // before conversion so the sentinel is never domain-shifted
            let time = if flip.duration.is_zero() {
                ClockDomain::Monotonic.now()
            } else {
                convert_timestamp(self.clock, ClockDomain::Monotonic, flip.duration)
            };
            decoded.push(GpuEvent::PageFlipped {
                connector,
                crtc: flip.crtc,
                time,
                sequence: flip.frame,
            });
        }
        decoded
    }

    /// Submits a frame for presentation on the given connector.
    ///
    /// Completion is reported as a [`GpuEvent::PageFlipped`] through the
    /// event loop. At most one frame may be in flight per output.
    #[profiling::function]
    pub fn queue_frame(
        &mut self,
        connector: connector::Handle,
        fb: drm::control::framebuffer::Handle,
    ) -> Result<(), Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let pipeline = self
            .pipelines
            .iter()
            .find(|p| p.connector == connector)
            .copied()
            .ok_or(Error::NoPipeline(connector))?;
        {
            let output = self
                .outputs
                .get(&connector)
                .ok_or(Error::NoPipeline(connector))?;
            if !output.render_ready() || !output.dpms().is_on() {
                return Err(Error::OutputNotReady(connector));
            }
            if output.frame_pending() {
                return Err(Error::FramePending(connector));
            }
        }

        let crtc = &self.crtcs[&pipeline.crtc];
        let config = PipelineConfig {
            connector: &self.connectors[&connector],
            crtc,
            plane: crtc.primary_plane().map(|p| &self.planes[&p]),
            mode: pipeline.mode,
            active: true,
        };
        pipeline::queue_frame(&self.fd, self.atomic, &config, fb)?;
        if let Some(output) = self.outputs.get_mut(&connector) {
            output.set_frame_pending(true);
        }
        Ok(())
    }

    /// Changes the power state of an output.
    ///
    /// Turning an output off disables its pipeline but keeps the
    /// connector/crtc routing, so turning it back on is a plain enable
    /// commit without renegotiation.
    pub fn set_dpms(&mut self, connector: connector::Handle, dpms: DpmsMode) -> Result<(), Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let index = self
            .pipelines
            .iter()
            .position(|p| p.connector == connector)
            .ok_or(Error::NoPipeline(connector))?;
        let on = dpms.is_on();
        if self.pipelines[index].active != on {
            let pipeline = self.pipelines[index];
            let crtc = &self.crtcs[&pipeline.crtc];
            let configs = [PipelineConfig {
                connector: &self.connectors[&connector],
                crtc,
                plane: crtc.primary_plane().map(|p| &self.planes[&p]),
                mode: pipeline.mode,
                active: on,
            }];
            let blanks = pipeline::apply_configuration(&self.fd, self.atomic, &configs)?;
            drop(configs);
            for (crtc, blank) in blanks {
                if let Some(old) = self.blank_buffers.insert(crtc, blank) {
                    old.destroy(&self.fd);
                }
            }
            if !on {
                if let Some(blank) = self.blank_buffers.remove(&pipeline.crtc) {
                    blank.destroy(&self.fd);
                }
            }
            self.pipelines[index].active = on;
        }
        if let Some(output) = self.outputs.get_mut(&connector) {
            output.set_dpms(dpms);
            if !on {
                output.set_frame_pending(false);
            }
        }
        Ok(())
    }

    /// Grants a lease over the requested connectors.
    ///
    /// Each connector must be offered by an unleased [`LeaseOutput`];
    /// the reserved crtc and its primary plane are included in the
    /// lease. Existing leases are never disturbed by a rejected request.
    pub fn lease(&mut self, request: &LeaseRequest) -> Result<LeaseGrant, Error> {
        if !self.active {
            return Err(Error::DeviceInactive);
        }
        let offered: Vec<(connector::Handle, bool)> = self
            .lease_outputs
            .values()
            .map(|lo| (lo.connector(), lo.is_leased()))
            .collect();
        lease::validate(request, &offered)?;

        let mut crtcs = Vec::with_capacity(request.connectors.len());
        let mut planes = Vec::new();
        for conn in &request.connectors {
            let lo = &self.lease_outputs[conn];
            crtcs.push(lo.crtc());
            if let Some(plane) = self.crtcs[&lo.crtc()].primary_plane() {
                planes.push(plane);
            }
        }

        let grant = lease::grant(&self.fd, &request.connectors, &crtcs, &planes)
            .map_err(Error::LeaseRejected)?;
        for conn in &request.connectors {
            if let Some(lo) = self.lease_outputs.get_mut(conn) {
                lo.set_lessee(Some(grant.lessee_id));
            }
        }
        self.leases.push(ActiveLease {
            lessee_id: grant.lessee_id,
            connectors: grant.connectors.clone(),
            crtcs: grant.crtcs.clone(),
        });
        Ok(grant)
    }

    /// Revokes an active lease, returning its resources to the pool on
    /// the next refresh.
    pub fn revoke_lease(&mut self, lessee_id: NonZeroU32) {
        lease::revoke(&self.fd, lessee_id);
        self.release_lease_record(lessee_id);
    }

    fn release_lease_record(&mut self, lessee_id: NonZeroU32) {
        self.leases.retain(|l| l.lessee_id != lessee_id);
        for lo in self.lease_outputs.values_mut() {
            if lo.lessee() == Some(lessee_id) {
                lo.set_lessee(None);
            }
        }
    }

    /// Drops tracked grants whose lessee the kernel no longer knows,
    /// e.g. because the client closed its fd.
    fn reconcile_leases(&mut self) {
        match lease::kernel_lessees(&self.fd) {
            Ok(ids) => {
                let dead: Vec<NonZeroU32> = self
                    .leases
                    .iter()
                    .map(|l| l.lessee_id)
                    .filter(|id| !ids.contains(&id.get()))
                    .collect();
                for lessee_id in dead {
                    info!(?lessee_id, "Lease ended by lessee");
                    self.release_lease_record(lessee_id);
                }
            }
            Err(err) => warn!("Failed to list lessees: {}", err),
        }
    }

    /// Suspends the device around a session switch. Commits and event
    /// dispatch are rejected until [`activate`](Self::activate).
    pub fn pause(&mut self) {
        self.active = false;
    }

    /// Resumes the device after a session switch, reclaiming the master
    /// lock the session manager dropped while we were away.
    pub fn activate(&mut self) {
        if self.fd.is_privileged() {
            if let Err(err) = self.fd.acquire_master_lock() {
                warn!("Failed to reclaim drm master: {}", err);
            }
        }
        self.active = true;
    }

    /// Creates a software only output.
    pub fn create_virtual_output(
        &mut self,
        name: impl Into<String>,
        size: (u32, u32),
    ) -> OutputEvent {
        let id = self.next_virtual_id;
        self.next_virtual_id += 1;
        self.virtual_outputs
            .push(VirtualOutput::new(id, name.into(), size));
        OutputEvent::VirtualOutputAdded(id)
    }

    /// Removes a virtual output by id.
    pub fn remove_virtual_output(&mut self, id: u32) -> Option<OutputEvent> {
        let len = self.virtual_outputs.len();
        self.virtual_outputs.retain(|v| v.id() != id);
        (self.virtual_outputs.len() != len).then_some(OutputEvent::VirtualOutputRemoved(id))
    }

    /// Whether scan-out buffers of this format work on every output.
    ///
    /// The legacy api gives no way to ask, so only the two formats every
    /// driver handles are reported there.
    pub fn is_format_supported(&self, format: DrmFourcc) -> bool {
        if !self.atomic {
            return matches!(format, DrmFourcc::Xrgb8888 | DrmFourcc::Argb8888);
        }
        self.crtcs
            .values()
            .filter_map(|crtc| crtc.primary_plane())
            .all(|plane| self.planes[&plane].formats().contains(&format))
    }

    /// Whether the device uses atomic mode setting
    pub fn atomic_mode_setting(&self) -> bool {
        self.atomic
    }

    /// Largest supported cursor buffer, in pixels
    pub fn cursor_size(&self) -> (u32, u32) {
        self.cursor_size
    }

    /// Clock domain presentation timestamps are reported in by the
    /// driver. Events delivered by this crate are always converted to
    /// [`ClockDomain::Monotonic`].
    pub fn presentation_clock(&self) -> ClockDomain {
        self.clock
    }

    /// Whether the device currently accepts commits
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The underlying device fd
    pub fn device_fd(&self) -> &GpuFd {
        &self.fd
    }

    /// Currently committed pipelines, in commit order
    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }

    /// Desktop outputs by connector
    pub fn outputs(&self) -> impl Iterator<Item = &Output> {
        self.outputs.values()
    }

    /// Mutable access to a desktop output
    pub fn output_mut(&mut self, connector: connector::Handle) -> Option<&mut Output> {
        self.outputs.get_mut(&connector)
    }

    /// Lease outputs by connector
    pub fn lease_outputs(&self) -> impl Iterator<Item = &LeaseOutput> {
        self.lease_outputs.values()
    }

    /// Virtual outputs in creation order
    pub fn virtual_outputs(&self) -> &[VirtualOutput] {
        &self.virtual_outputs
    }

    /// The discovered connectors
    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }
}

impl Drop for Gpu {
    fn drop(&mut self) {
        let _guard = self.span.clone();
        let _guard = _guard.enter();
        let lessees: Vec<NonZeroU32> = self.leases.iter().map(|l| l.lessee_id).collect();
        for lessee_id in lessees {
            lease::revoke(&self.fd, lessee_id);
        }
        self.wait_idle();
        let fd = self.fd.clone();
        for (_, mut output) in std::mem::take(&mut self.outputs) {
            output.destroy(&fd);
        }
        for (_, blank) in std::mem::take(&mut self.blank_buffers) {
            blank.destroy(&fd);
        }
    }
}

/// Builds the crtc arena, pairing each crtc with a primary plane in
/// atomic mode. Prefers the plane the kernel already routed to the crtc.
/// Returns `None` when atomic pairing is impossible.
fn build_crtcs(
    fd: &GpuFd,
    handles: &[crtc::Handle],
    planes: &IndexMap<plane::Handle, Plane>,
    atomic: bool,
) -> Result<Option<IndexMap<crtc::Handle, Crtc>>, Error> {
    let mut crtcs = IndexMap::new();
    let mut assigned: Vec<plane::Handle> = Vec::new();

    for (index, &handle) in handles.iter().enumerate() {
        let primary = if atomic {
            let plane = planes
                .values()
                .filter(|plane| {
                    plane.kind() == PlaneType::Primary
                        && plane.supports_crtc(handle)
                        && !assigned.contains(&plane.handle())
                })
                .max_by_key(|plane| plane.current_crtc() == Some(handle))
                .map(|plane| plane.handle());
            match plane {
                Some(plane) => {
                    assigned.push(plane);
                    Some(plane)
                }
                None => return Ok(None),
            }
        } else {
            None
        };
        crtcs.insert(handle, Crtc::new(fd, handle, index, primary)?);
    }
    Ok(Some(crtcs))
}
