//! Leasing of non-desktop connectors to clients.
//!
//! A lease hands a connector, its reserved crtc and the crtc's primary
//! plane to a client as a new restricted drm fd. The kernel keeps the
//! lease alive until it is revoked or the lessee closes the fd; during
//! every refresh the tracked grants are reconciled against the kernel's
//! lessee list to notice the latter.

use std::num::NonZeroU32;
use std::os::unix::io::{AsFd, OwnedFd};

use drm::control::{connector, crtc, plane, Device as ControlDevice, RawResourceHandle};
use rustix::fs::OFlags;
use tracing::{info, warn};

use crate::error::LeaseRejected;
use crate::fd::GpuFd;

/// A client's request for exclusive access to a set of connectors.
#[derive(Debug, Clone)]
pub struct LeaseRequest {
    /// The connectors the client wants to drive
    pub connectors: Vec<connector::Handle>,
}

/// An active lease granted to a client.
#[derive(Debug)]
pub struct LeaseGrant {
    /// The restricted drm fd to hand to the client
    pub fd: OwnedFd,
    /// Kernel id of the lessee, used for revocation
    pub lessee_id: NonZeroU32,
    /// Connectors covered by the lease
    pub connectors: Vec<connector::Handle>,
    /// Crtcs covered by the lease
    pub crtcs: Vec<crtc::Handle>,
}

/// Checks a request against the offered lease outputs.
///
/// `offered` carries one entry per lease output with its current leased
/// state. Granting must not disturb existing leases, so any overlap with
/// a leased connector rejects the whole request.
pub(crate) fn validate(
    request: &LeaseRequest,
    offered: &[(connector::Handle, bool)],
) -> Result<(), LeaseRejected> {
    if request.connectors.is_empty() {
        return Err(LeaseRejected::Empty);
    }
    let mut seen: Vec<connector::Handle> = Vec::with_capacity(request.connectors.len());
    for &conn in &request.connectors {
        let Some((_, leased)) = offered.iter().find(|(c, _)| *c == conn) else {
            return Err(LeaseRejected::NotLeasable(conn));
        };
        if *leased || seen.contains(&conn) {
            return Err(LeaseRejected::AlreadyLeased(conn));
        }
        seen.push(conn);
    }
    Ok(())
}

/// Issues the kernel lease for an already validated object set.
pub(crate) fn grant(
    fd: &GpuFd,
    connectors: &[connector::Handle],
    crtcs: &[crtc::Handle],
    planes: &[plane::Handle],
) -> Result<LeaseGrant, LeaseRejected> {
    let objects: Vec<RawResourceHandle> = connectors
        .iter()
        .copied()
        .map(Into::into)
        .chain(crtcs.iter().copied().map(Into::into))
        .chain(planes.iter().copied().map(Into::into))
        .collect();

    let (lessee_id, lease_fd) = fd
        .create_lease(&objects, OFlags::CLOEXEC.bits())
        .map_err(LeaseRejected::Kernel)?;
    info!(?lessee_id, ?connectors, "Granted lease");

    Ok(LeaseGrant {
        fd: lease_fd,
        lessee_id,
        connectors: connectors.to_vec(),
        crtcs: crtcs.to_vec(),
    })
}

/// Revokes a lease by lessee id. Failure only means the lessee is
/// already gone, so it is logged and swallowed.
pub(crate) fn revoke(fd: &GpuFd, lessee_id: NonZeroU32) {
    info!(?lessee_id, "Revoking lease");
    if let Err(err) = fd.revoke_lease(lessee_id) {
        warn!(?lessee_id, "Error revoking lease: {}", err);
    }
}

/// Lists the lessee ids the kernel currently knows for this device.
pub(crate) fn kernel_lessees(fd: &GpuFd) -> std::io::Result<Vec<u32>> {
    let mut ids = Vec::new();
    drm_ffi::mode::list_lessees(fd.as_fd(), Some(&mut ids))?;
    Ok(ids)
}

#[cfg(test)]
mod test {
    use super::*;

    fn conn(raw: u32) -> connector::Handle {
        connector::Handle::from(std::num::NonZeroU32::new(raw).unwrap())
    }

    fn request(conns: &[u32]) -> LeaseRequest {
        LeaseRequest {
            connectors: conns.iter().copied().map(conn).collect(),
        }
    }

    #[test]
    fn empty_request_is_rejected() {
        assert!(matches!(
            validate(&request(&[]), &[(conn(10), false)]),
            Err(LeaseRejected::Empty)
        ));
    }

    #[test]
    fn unknown_connector_is_rejected() {
        assert!(matches!(
            validate(&request(&[11]), &[(conn(10), false)]),
            Err(LeaseRejected::NotLeasable(c)) if c == conn(11)
        ));
    }

    #[test]
    fn valid_request_passes() {
        let offered = [(conn(10), false), (conn(11), false)];
        assert!(validate(&request(&[10, 11]), &offered).is_ok());
    }

    #[test]
    fn second_lease_on_same_connector_is_rejected() {
        // connector 10 is already handed out; the first lease stays valid
        let offered = [(conn(10), true), (conn(11), false)];
        assert!(matches!(
            validate(&request(&[10]), &offered),
            Err(LeaseRejected::AlreadyLeased(c)) if c == conn(10)
        ));
        assert!(validate(&request(&[11]), &offered).is_ok());
    }

    #[test]
    fn duplicate_connector_in_request_is_rejected() {
        let offered = [(conn(10), false)];
        assert!(matches!(
            validate(&request(&[10, 10]), &offered),
            Err(LeaseRejected::AlreadyLeased(_))
        ));
    }
}
