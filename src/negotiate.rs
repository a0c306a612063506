//! Connector to crtc negotiation.
//!
//! A deterministic backtracking search over the hardware capability
//! graph. The search itself is pure; whether a candidate set is actually
//! acceptable to the driver is decided by a validator callback, which the
//! device implements as a single atomic test commit. Keeping the two
//! apart means the search order and tie-break rules can be tested without
//! hardware.
//!
//! The search accepts the first branch whose full candidate set
//! validates, it does not look for a globally optimal assignment (e.g.
//! one maximizing the number of enabled outputs). The connector pre-sort
//! is tuned around these first-fit semantics, so this is deliberate
//! behavior, not an optimization opportunity.

use drm::control::{connector, crtc};
use smallvec::SmallVec;

/// A connector as seen by the negotiation search.
#[derive(Debug, Clone)]
pub(crate) struct SearchConnector {
    pub handle: connector::Handle,
    /// Crtc currently driving this connector, if any
    pub crtc_hint: Option<crtc::Handle>,
    /// For each compatible encoder, the crtcs it can reach
    pub encoders: SmallVec<[Vec<crtc::Handle>; 2]>,
}

/// One connector to crtc binding produced by the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
}

/// Sorts connectors so that ones already driven by some crtc are tried
/// before unbound ones. Already working configurations then win the
/// first-fit race, which avoids visible flicker on a refresh.
pub(crate) fn sort_bound_first(connectors: &mut [SearchConnector]) {
    connectors.sort_by_key(|conn| conn.crtc_hint.is_none());
}

/// Finds a valid assignment of `connectors` onto the free `crtcs`.
///
/// Returns the first candidate set accepted by `validate`, or an empty
/// vector if no combination validates. An empty result with a non-empty
/// connector list signals total failure; the caller is responsible for
/// restoring the previous configuration.
pub(crate) fn negotiate(
    connectors: &[SearchConnector],
    crtcs: &[crtc::Handle],
    atomic: bool,
    validate: &mut dyn FnMut(&[Assignment]) -> bool,
) -> Vec<Assignment> {
    search(&[], connectors, crtcs, atomic, validate)
}

fn search(
    assigned: &[Assignment],
    connectors: &[SearchConnector],
    crtcs: &[crtc::Handle],
    atomic: bool,
    validate: &mut dyn FnMut(&[Assignment]) -> bool,
) -> Vec<Assignment> {
    let Some((connector, remaining_connectors)) = connectors.split_first() else {
        // no further pipelines can be added, test the configuration
        if assigned.is_empty() || validate(assigned) {
            return assigned.to_vec();
        }
        return Vec::new();
    };
    if crtcs.is_empty() {
        if assigned.is_empty() || validate(assigned) {
            return assigned.to_vec();
        }
        return Vec::new();
    }

    // try the crtc this connector is already routed to first
    let mut pool: Vec<crtc::Handle> = crtcs.to_vec();
    if atomic {
        if let Some(hint) = connector.crtc_hint {
            pool.sort_by_key(|crtc| *crtc != hint);
        }
    }

    for encoder_crtcs in &connector.encoders {
        for &crtc in &pool {
            if !encoder_crtcs.contains(&crtc) {
                continue;
            }
            let mut candidate: Vec<Assignment> = assigned.to_vec();
            candidate.push(Assignment {
                connector: connector.handle,
                crtc,
            });
            let remaining_crtcs: Vec<crtc::Handle> =
                pool.iter().copied().filter(|c| *c != crtc).collect();
            let found = search(
                &candidate,
                remaining_connectors,
                &remaining_crtcs,
                atomic,
                validate,
            );
            if !found.is_empty() {
                return found;
            }
        }
    }
    Vec::new()
}

#[cfg(test)]
mod test {
    use std::num::NonZeroU32;

    use super::*;

    fn conn(raw: u32) -> connector::Handle {
        connector::Handle::from(NonZeroU32::new(raw).unwrap())
    }

    fn crtc(raw: u32) -> crtc::Handle {
        crtc::Handle::from(NonZeroU32::new(raw).unwrap())
    }

    fn connector_for(raw: u32, hint: Option<u32>, reachable: &[u32]) -> SearchConnector {
        SearchConnector {
            handle: conn(raw),
            crtc_hint: hint.map(crtc),
            encoders: smallvec::smallvec![reachable.iter().copied().map(crtc).collect()],
        }
    }

    fn accept_all(_: &[Assignment]) -> bool {
        true
    }

    #[test]
    fn no_connector_or_crtc_shared() {
        let connectors = [
            connector_for(10, None, &[1, 2]),
            connector_for(11, None, &[1, 2]),
        ];
        let crtcs = [crtc(1), crtc(2)];
        let result = negotiate(&connectors, &crtcs, true, &mut accept_all);

        assert_eq!(result.len(), 2);
        let mut conns: Vec<_> = result.iter().map(|a| a.connector).collect();
        let mut crtcs: Vec<_> = result.iter().map(|a| a.crtc).collect();
        conns.dedup();
        crtcs.dedup();
        assert_eq!(conns.len(), 2);
        assert_eq!(crtcs.len(), 2);
    }

    #[test]
    fn hint_wins_the_tie_break() {
        // both crtcs reachable, the hint names the second one
        let connectors = [connector_for(10, Some(2), &[1, 2])];
        let crtcs = [crtc(1), crtc(2)];

        let result = negotiate(&connectors, &crtcs, true, &mut accept_all);
        assert_eq!(result, vec![Assignment {
            connector: conn(10),
            crtc: crtc(2),
        }]);

        // legacy mode does not reorder
        let result = negotiate(&connectors, &crtcs, false, &mut accept_all);
        assert_eq!(result[0].crtc, crtc(1));
    }

    #[test]
    fn idempotent_on_unchanged_graph() {
        let connectors = [
            connector_for(10, Some(2), &[1, 2]),
            connector_for(11, None, &[1, 2]),
        ];
        let crtcs = [crtc(1), crtc(2)];
        let first = negotiate(&connectors, &crtcs, true, &mut accept_all);
        let second = negotiate(&connectors, &crtcs, true, &mut accept_all);
        assert_eq!(first, second);
    }

    #[test]
    fn backtracks_over_rejected_candidates() {
        // both connectors reach both crtcs, so the first full candidate
        // is (10->1, 11->2); the validator rejects every set binding
        // connector 10 to crtc 1, forcing a backtrack to (10->2, 11->1)
        let connectors = [
            connector_for(10, None, &[1, 2]),
            connector_for(11, None, &[1, 2]),
        ];
        let crtcs = [crtc(1), crtc(2)];
        let mut tests = 0;
        let result = negotiate(&connectors, &crtcs, true, &mut |set| {
            tests += 1;
            !set.iter()
                .any(|a| a.connector == conn(10) && a.crtc == crtc(1))
        });

        assert!(tests > 1);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], Assignment {
            connector: conn(10),
            crtc: crtc(2),
        });
        assert_eq!(result[1], Assignment {
            connector: conn(11),
            crtc: crtc(1),
        });
    }

    #[test]
    fn total_failure_returns_empty() {
        let connectors = [connector_for(10, None, &[1])];
        let crtcs = [crtc(1)];
        let result = negotiate(&connectors, &crtcs, true, &mut |_| false);
        assert!(result.is_empty());
    }

    #[test]
    fn encoder_restricts_candidates() {
        // connector 10 can only reach crtc 2 through its encoder
        let connectors = [connector_for(10, None, &[2])];
        let crtcs = [crtc(1), crtc(2)];
        let result = negotiate(&connectors, &crtcs, true, &mut accept_all);
        assert_eq!(result[0].crtc, crtc(2));
    }

    #[test]
    fn more_connectors_than_crtcs_lights_up_a_subset() {
        let connectors = [
            connector_for(10, None, &[1]),
            connector_for(11, None, &[1]),
        ];
        let crtcs = [crtc(1)];
        let result = negotiate(&connectors, &crtcs, true, &mut accept_all);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].connector, conn(10));
    }

    #[test]
    fn bound_connectors_sort_first() {
        let mut connectors = vec![
            connector_for(10, None, &[1, 2]),
            connector_for(11, Some(1), &[1, 2]),
            connector_for(12, None, &[1, 2]),
        ];
        sort_bound_first(&mut connectors);
        assert_eq!(connectors[0].handle, conn(11));
        // stable for the rest
        assert_eq!(connectors[1].handle, conn(10));
        assert_eq!(connectors[2].handle, conn(12));
    }
}
