//! Pipelines and the commit paths that drive them.
//!
//! A [`Pipeline`] is the unit of mode setting: one connector routed
//! through one crtc with one mode. The functions here translate sets of
//! pipelines into kernel commits. In atomic mode every transaction is a
//! single `AtomicModeReq` across all affected objects, validated first
//! with `TEST_ONLY | ALLOW_MODESET` against throwaway dumb buffer
//! framebuffers. The legacy path cannot batch or test ahead of time; it
//! validates structurally and commits one `set_crtc` per pipeline.

use drm::buffer::DrmFourcc;
use drm::control::atomic::AtomicModeReq;
use drm::control::dumbbuffer::DumbBuffer;
use drm::control::{
    framebuffer, property, AtomicCommitFlags, Device as ControlDevice, Mode, PageFlipFlags,
};
use tracing::{debug, warn};

use crate::error::{AccessError, Error};
use crate::fd::{DevPath, GpuFd};
use crate::objects::{prop_handle, Connector, Crtc, Plane};

/// One connector to crtc route with its committed mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pipeline {
    /// Connector at the end of the route
    pub connector: drm::control::connector::Handle,
    /// Crtc generating the timings
    pub crtc: drm::control::crtc::Handle,
    /// Mode the pipeline is driven with
    pub mode: Mode,
    /// Whether the pipeline is scanning out
    pub active: bool,
}

/// Everything a commit needs to know about one pipeline.
pub(crate) struct PipelineConfig<'a> {
    pub connector: &'a Connector,
    pub crtc: &'a Crtc,
    /// Primary plane of the crtc, present in atomic mode
    pub plane: Option<&'a Plane>,
    pub mode: Mode,
    pub active: bool,
}

/// A dumb buffer wrapped in a framebuffer, used for test commits and as
/// the blank frame right after a mode set.
#[derive(Debug)]
pub(crate) struct ScratchFramebuffer {
    db: DumbBuffer,
    pub fb: framebuffer::Handle,
}

impl ScratchFramebuffer {
    pub(crate) fn create(fd: &GpuFd, size: (u32, u32)) -> Result<Self, Error> {
        let db = fd
            .create_dumb_buffer(size, DrmFourcc::Argb8888, 32)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to create dumb buffer",
                    dev: fd.dev_path(),
                    source,
                })
            })?;
        match fd.add_framebuffer(&db, 32, 32) {
            Ok(fb) => Ok(ScratchFramebuffer { db, fb }),
            Err(source) => {
                let _ = fd.destroy_dumb_buffer(db);
                Err(Error::Access(AccessError {
                    errmsg: "Failed to create framebuffer",
                    dev: fd.dev_path(),
                    source,
                }))
            }
        }
    }

    pub(crate) fn destroy(self, fd: &GpuFd) {
        let _ = fd.destroy_framebuffer(self.fb);
        let _ = fd.destroy_dumb_buffer(self.db);
    }
}

/// Adds one pipeline to an atomic request.
///
/// Active pipelines get their full route programmed; inactive ones are
/// detached from their crtc and plane. Returns the mode blob so the
/// caller can destroy it once the request is retired.
fn add_to_request(
    fd: &GpuFd,
    req: &mut AtomicModeReq,
    config: &PipelineConfig<'_>,
    fb: Option<framebuffer::Handle>,
) -> Result<Option<property::Value<'static>>, Error> {
    let conn = config.connector;
    let crtc = config.crtc;

    if !config.active {
        req.add_property(
            conn.handle(),
            prop_handle(&conn.props, conn.handle(), "CRTC_ID")?,
            property::Value::CRTC(None),
        );
        req.add_property(
            crtc.handle(),
            prop_handle(&crtc.props, crtc.handle(), "ACTIVE")?,
            property::Value::Boolean(false),
        );
        req.add_property(
            crtc.handle(),
            prop_handle(&crtc.props, crtc.handle(), "MODE_ID")?,
            property::Value::Unknown(0),
        );
        if let Some(plane) = config.plane {
            req.add_property(
                plane.handle(),
                prop_handle(&plane.props, plane.handle(), "CRTC_ID")?,
                property::Value::CRTC(None),
            );
            req.add_property(
                plane.handle(),
                prop_handle(&plane.props, plane.handle(), "FB_ID")?,
                property::Value::Framebuffer(None),
            );
        }
        return Ok(None);
    }

    let blob = fd.create_property_blob(&config.mode).map_err(|source| {
        Error::Access(AccessError {
            errmsg: "Failed to create property blob for mode",
            dev: fd.dev_path(),
            source,
        })
    })?;

    req.add_property(
        conn.handle(),
        prop_handle(&conn.props, conn.handle(), "CRTC_ID")?,
        property::Value::CRTC(Some(crtc.handle())),
    );
    req.add_property(
        crtc.handle(),
        prop_handle(&crtc.props, crtc.handle(), "MODE_ID")?,
        blob,
    );
    req.add_property(
        crtc.handle(),
        prop_handle(&crtc.props, crtc.handle(), "ACTIVE")?,
        property::Value::Boolean(true),
    );

    if let Some(plane) = config.plane {
        let (w, h) = config.mode.size();
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "CRTC_ID")?,
            property::Value::CRTC(Some(crtc.handle())),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "FB_ID")?,
            property::Value::Framebuffer(fb),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "SRC_X")?,
            property::Value::UnsignedRange(0),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "SRC_Y")?,
            property::Value::UnsignedRange(0),
        );
        // src coordinates are 16.16 fixed point
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "SRC_W")?,
            property::Value::UnsignedRange((w as u64) << 16),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "SRC_H")?,
            property::Value::UnsignedRange((h as u64) << 16),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "CRTC_X")?,
            property::Value::SignedRange(0),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "CRTC_Y")?,
            property::Value::SignedRange(0),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "CRTC_W")?,
            property::Value::UnsignedRange(w as u64),
        );
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "CRTC_H")?,
            property::Value::UnsignedRange(h as u64),
        );
    }

    Ok(Some(blob))
}

fn destroy_blobs(fd: &GpuFd, blobs: Vec<property::Value<'static>>) {
    for blob in blobs {
        if let Err(err) = fd.destroy_property_blob(blob.into()) {
            warn!("Failed to destroy mode property blob: {}", err);
        }
    }
}

/// Asks the driver whether a candidate configuration would work, without
/// changing any state.
///
/// The atomic path issues a real `TEST_ONLY` commit against throwaway
/// framebuffers. The legacy api has no test facility; the candidate is
/// only checked against the encoder capability graph.
pub(crate) fn test_configuration(
    fd: &GpuFd,
    atomic: bool,
    configs: &[PipelineConfig<'_>],
) -> Result<(), Error> {
    if !atomic {
        for config in configs.iter().filter(|c| c.active) {
            let reachable = config
                .connector
                .encoders()
                .iter()
                .any(|enc| enc.crtcs.contains(&config.crtc.handle()));
            if !reachable {
                return Err(Error::TestFailed(config.mode));
            }
        }
        return Ok(());
    }

    let mut req = AtomicModeReq::new();
    let mut blobs = Vec::new();
    let mut scratch = Vec::new();

    let build = configs.iter().try_for_each(|config| {
        let fb = if config.active {
            let (w, h) = config.mode.size();
            let buffer = ScratchFramebuffer::create(fd, (w as u32, h as u32))?;
            let fb = buffer.fb;
            scratch.push(buffer);
            Some(fb)
        } else {
            None
        };
        if let Some(blob) = add_to_request(fd, &mut req, config, fb)? {
            blobs.push(blob);
        }
        Ok(())
    });

    let first_active = configs.iter().find(|c| c.active).map(|c| c.mode);
    let result = build.and_then(|()| {
        fd.atomic_commit(
            AtomicCommitFlags::TEST_ONLY | AtomicCommitFlags::ALLOW_MODESET,
            req,
        )
        .map_err(|err| {
            debug!("Atomic test rejected: {}", err);
            match first_active {
                Some(mode) => Error::TestFailed(mode),
                None => Error::Access(AccessError {
                    errmsg: "Atomic test rejected",
                    dev: fd.dev_path(),
                    source: err,
                }),
            }
        })
    });

    destroy_blobs(fd, blobs);
    for buffer in scratch {
        buffer.destroy(fd);
    }
    result
}

/// Commits a configuration for real, putting a blank frame on every
/// newly enabled pipeline.
///
/// Returns the blank framebuffers, which must stay alive until the first
/// real frame replaces them. The caller owns them keyed by crtc.
pub(crate) fn apply_configuration(
    fd: &GpuFd,
    atomic: bool,
    configs: &[PipelineConfig<'_>],
) -> Result<Vec<(drm::control::crtc::Handle, ScratchFramebuffer)>, Error> {
    let mut blanks = Vec::new();

    if atomic {
        let mut req = AtomicModeReq::new();
        let mut blobs = Vec::new();

        let build = configs.iter().try_for_each(|config| {
            let fb = if config.active {
                let (w, h) = config.mode.size();
                let buffer = ScratchFramebuffer::create(fd, (w as u32, h as u32))?;
                let fb = buffer.fb;
                blanks.push((config.crtc.handle(), buffer));
                Some(fb)
            } else {
                None
            };
            if let Some(blob) = add_to_request(fd, &mut req, config, fb)? {
                blobs.push(blob);
            }
            Ok(())
        });

        let result = build.and_then(|()| {
            fd.atomic_commit(AtomicCommitFlags::ALLOW_MODESET, req)
                .map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Failed to commit new configuration",
                        dev: fd.dev_path(),
                        source,
                    })
                })
        });
        destroy_blobs(fd, blobs);
        if let Err(err) = result {
            for (_, buffer) in blanks {
                buffer.destroy(fd);
            }
            return Err(err);
        }
        return Ok(blanks);
    }

    for config in configs {
        if config.active {
            let (w, h) = config.mode.size();
            let buffer = ScratchFramebuffer::create(fd, (w as u32, h as u32))?;
            let commit = fd.set_crtc(
                config.crtc.handle(),
                Some(buffer.fb),
                (0, 0),
                &[config.connector.handle()],
                Some(config.mode),
            );
            match commit {
                Ok(()) => blanks.push((config.crtc.handle(), buffer)),
                Err(source) => {
                    buffer.destroy(fd);
                    return Err(Error::Access(AccessError {
                        errmsg: "Error setting crtc",
                        dev: fd.dev_path(),
                        source,
                    }));
                }
            }
        } else {
            fd.set_crtc(config.crtc.handle(), None, (0, 0), &[], None)
                .map_err(|source| {
                    Error::Access(AccessError {
                        errmsg: "Error disabling crtc",
                        dev: fd.dev_path(),
                        source,
                    })
                })?;
        }
    }
    Ok(blanks)
}

/// Queues one frame for presentation on an already committed pipeline.
/// Completion is reported through the page flip event.
pub(crate) fn queue_frame(
    fd: &GpuFd,
    atomic: bool,
    config: &PipelineConfig<'_>,
    fb: framebuffer::Handle,
) -> Result<(), Error> {
    if atomic {
        let plane = config
            .plane
            .ok_or(Error::NoPrimaryPlane(config.crtc.handle()))?;
        let mut req = AtomicModeReq::new();
        req.add_property(
            plane.handle(),
            prop_handle(&plane.props, plane.handle(), "FB_ID")?,
            property::Value::Framebuffer(Some(fb)),
        );
        fd.atomic_commit(
            AtomicCommitFlags::PAGE_FLIP_EVENT | AtomicCommitFlags::NONBLOCK,
            req,
        )
        .map_err(|source| {
            Error::Access(AccessError {
                errmsg: "Failed to queue page flip",
                dev: fd.dev_path(),
                source,
            })
        })
    } else {
        fd.page_flip(config.crtc.handle(), fb, PageFlipFlags::EVENT, None)
            .map_err(|source| {
                Error::Access(AccessError {
                    errmsg: "Failed to queue page flip",
                    dev: fd.dev_path(),
                    source,
                })
            })
    }
}
