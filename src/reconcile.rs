//! Planning of output set changes after a refresh.
//!
//! Once negotiation has produced the accepted pipeline set, the existing
//! outputs have to be reconciled with it. The planning step is pure and
//! ordering sensitive: removals run in reverse creation order so that
//! dependent state is torn down before what it depends on, additions run
//! in pipeline commit order. The device executes the resulting actions
//! against hardware afterwards.

use drm::control::{connector, crtc};

use crate::negotiate::Assignment;

/// One step of an output reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputAction {
    /// Tear down a desktop output
    RemoveOutput(connector::Handle),
    /// Withdraw a lease output
    RemoveLease(connector::Handle),
    /// Create a desktop output on the given route
    AddOutput(connector::Handle, crtc::Handle),
    /// Offer a non-desktop connector for leasing on the given route
    AddLease(connector::Handle, crtc::Handle),
    /// Keep an existing desktop output, possibly on a new crtc
    Reattach(connector::Handle, crtc::Handle),
    /// Keep an existing lease output, possibly on a new reserved crtc
    ReattachLease(connector::Handle, crtc::Handle),
    /// Report that a reattached output is powered down
    NotifyDisabled(connector::Handle),
}

/// Computes the ordered action list turning the current output sets into
/// the ones implied by `accepted`.
///
/// `outputs` and `leases` are the current sets in creation order;
/// `non_desktop` names the connectors that must become lease outputs
/// rather than desktop outputs; `disabled` names the outputs that are
/// currently powered down.
pub(crate) fn plan(
    accepted: &[Assignment],
    non_desktop: &[connector::Handle],
    disabled: &[connector::Handle],
    outputs: &[connector::Handle],
    leases: &[connector::Handle],
) -> Vec<OutputAction> {
    let is_non_desktop = |conn: connector::Handle| non_desktop.contains(&conn);
    let accepted_desktop = |conn: connector::Handle| {
        accepted
            .iter()
            .any(|a| a.connector == conn && !is_non_desktop(conn))
    };
    let accepted_lease = |conn: connector::Handle| {
        accepted
            .iter()
            .any(|a| a.connector == conn && is_non_desktop(conn))
    };

    let mut actions = Vec::new();

    // teardown first, newest first
    for &conn in outputs.iter().rev() {
        if !accepted_desktop(conn) {
            actions.push(OutputAction::RemoveOutput(conn));
        }
    }
    for &conn in leases.iter().rev() {
        if !accepted_lease(conn) {
            actions.push(OutputAction::RemoveLease(conn));
        }
    }

    for assignment in accepted {
        let conn = assignment.connector;
        if is_non_desktop(conn) {
            // a surviving lease output follows the accepted route, or a
            // later lease would hand out a crtc a desktop output now uses
            if leases.contains(&conn) {
                actions.push(OutputAction::ReattachLease(conn, assignment.crtc));
            } else {
                actions.push(OutputAction::AddLease(conn, assignment.crtc));
            }
        } else if outputs.contains(&conn) {
            actions.push(OutputAction::Reattach(conn, assignment.crtc));
            if disabled.contains(&conn) {
                actions.push(OutputAction::NotifyDisabled(conn));
            }
        } else {
            actions.push(OutputAction::AddOutput(conn, assignment.crtc));
        }
    }

    actions
}

/// Connectors whose outputs have to be torn down before negotiation
/// runs, newest first. `connected` holds the connectors that are still
/// present and have a display attached.
pub(crate) fn vanished(
    existing: &[connector::Handle],
    connected: &[connector::Handle],
) -> Vec<connector::Handle> {
    existing
        .iter()
        .rev()
        .copied()
        .filter(|conn| !connected.contains(conn))
        .collect()
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

    fn assign(c: u32, t: u32) -> Assignment {
        Assignment {
            connector: conn(c),
            crtc: crtc(t),
        }
    }

    #[test]
    fn single_connected_connector_creates_one_output() {
        // two ports, one display attached, two crtcs available
        let accepted = [assign(10, 1)];
        let actions = plan(&accepted, &[], &[], &[], &[]);
        assert_eq!(actions, vec![OutputAction::AddOutput(conn(10), crtc(1))]);
    }

    #[test]
    fn non_desktop_connector_becomes_lease_output() {
        let accepted = [assign(10, 1), assign(11, 2)];
        let actions = plan(&accepted, &[conn(11)], &[], &[], &[]);
        assert_eq!(actions, vec![
            OutputAction::AddOutput(conn(10), crtc(1)),
            OutputAction::AddLease(conn(11), crtc(2)),
        ]);
    }

    #[test]
    fn hot_unplug_removes_exactly_one_output() {
        // connector 11 vanished, 10 keeps its route
        let accepted = [assign(10, 1)];
        let actions = plan(&accepted, &[], &[], &[conn(10), conn(11)], &[]);
        assert_eq!(actions, vec![
            OutputAction::RemoveOutput(conn(11)),
            OutputAction::Reattach(conn(10), crtc(1)),
        ]);
    }

    #[test]
    fn removals_run_in_reverse_creation_order() {
        let actions = plan(&[], &[], &[], &[conn(10), conn(11), conn(12)], &[]);
        assert_eq!(actions, vec![
            OutputAction::RemoveOutput(conn(12)),
            OutputAction::RemoveOutput(conn(11)),
            OutputAction::RemoveOutput(conn(10)),
        ]);
    }

    #[test]
    fn surviving_lease_output_follows_the_accepted_route() {
        // negotiation moved the lease output from crtc 2 to crtc 3
        let accepted = [assign(10, 2), assign(11, 3)];
        let actions = plan(&accepted, &[conn(11)], &[], &[conn(10)], &[conn(11)]);
        assert_eq!(actions, vec![
            OutputAction::Reattach(conn(10), crtc(2)),
            OutputAction::ReattachLease(conn(11), crtc(3)),
        ]);
    }

    #[test]
    fn desktop_to_non_desktop_flip_replaces_the_output() {
        // the same connector changed its non-desktop property
        let accepted = [assign(10, 1)];
        let actions = plan(&accepted, &[conn(10)], &[], &[conn(10)], &[]);
        assert_eq!(actions, vec![
            OutputAction::RemoveOutput(conn(10)),
            OutputAction::AddLease(conn(10), crtc(1)),
        ]);
    }

    #[test]
    fn unchanged_set_only_reattaches() {
        let accepted = [assign(10, 1), assign(11, 2)];
        let actions = plan(&accepted, &[], &[], &[conn(10), conn(11)], &[]);
        assert_eq!(actions, vec![
            OutputAction::Reattach(conn(10), crtc(1)),
            OutputAction::Reattach(conn(11), crtc(2)),
        ]);
    }

    #[test]
    fn reattach_of_a_powered_down_output_notifies_disabled() {
        let accepted = [assign(10, 1)];
        let actions = plan(&accepted, &[], &[conn(10)], &[conn(10)], &[]);
        assert_eq!(actions, vec![
            OutputAction::Reattach(conn(10), crtc(1)),
            OutputAction::NotifyDisabled(conn(10)),
        ]);
    }

    #[test]
    fn unplugged_connectors_are_listed_newest_first() {
        let gone = vanished(&[conn(10), conn(11), conn(12)], &[conn(11)]);
        assert_eq!(gone, vec![conn(12), conn(10)]);
    }
}
