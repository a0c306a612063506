//! Event loop integration.
//!
//! [`Gpu`] is a [`calloop::EventSource`] emitting one [`GpuEvent`] per
//! retired page flip. Timestamps are always reported on the monotonic
//! clock; conversion from a realtime driver clock and substitution of
//! zero timestamps happen before the callback sees the event. While the
//! session is inactive processing is a no-op and events stay queued in
//! the kernel.

use std::io;
use std::time::Duration;

use calloop::{EventSource, Poll, PostAction, Readiness, Token, TokenFactory};
use drm::control::{connector, crtc, Device as ControlDevice, Event};

use crate::gpu::Gpu;

/// Events emitted by a [`Gpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuEvent {
    /// A queued frame reached the screen.
    PageFlipped {
        /// Connector the frame was presented on
        connector: connector::Handle,
        /// Crtc that retired the flip
        crtc: crtc::Handle,
        /// Presentation time on the monotonic clock
        time: Duration,
        /// Hardware frame counter at presentation
        sequence: u32,
    },
}

impl EventSource for Gpu {
    type Event = GpuEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        readiness: Readiness,
        token: Token,
        mut callback: F,
    ) -> io::Result<PostAction>
    where
        F: FnMut(Self::Event, &mut Self::Metadata) -> Self::Ret,
    {
        let span = self.span.clone();
        let _guard = span.enter();

        // events drained inline by the idle wait come first
        for event in std::mem::take(&mut self.queued_events) {
            callback(event, &mut ());
        }

        if !self.active {
            return Ok(PostAction::Continue);
        }

        let mut kernel_events: Vec<Event> = Vec::new();
        self.source.process_events(readiness, token, |_, fd| {
            kernel_events.extend(fd.receive_events()?);
            Ok(PostAction::Continue)
        })?;

        for event in self.process_kernel_events(kernel_events) {
            callback(event, &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, token_factory: &mut TokenFactory) -> calloop::Result<()> {
        self.source.register(poll, token_factory)
    }

    fn reregister(
        &mut self,
        poll: &mut Poll,
        token_factory: &mut TokenFactory,
    ) -> calloop::Result<()> {
        self.source.reregister(poll, token_factory)
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.source.unregister(poll)
    }
}
