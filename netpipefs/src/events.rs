// SPDX-License-Identifier: MPL-2.0

use bitflags::bitflags;

bitflags! {
    /// I/O events reported by `poll`.
    ///
    /// The bit values are the Linux `poll(2)` values, so they travel through
    /// the FUSE poll reply unchanged.
    pub struct IoEvents: u32 {
        const IN    = 0x0001;
        const PRI   = 0x0002;
        const OUT   = 0x0004;
        const ERR   = 0x0008;
        const HUP   = 0x0010;
        const RDHUP = 0x2000;
    }
}

/// A single-shot observer registered by a `poll` call.
///
/// The engine fires `on_events` at most once, on the first state change
/// after registration, and then drops the observer. Observing further
/// changes requires registering again.
pub trait PollObserver: Send {
    fn on_events(&self, events: IoEvents);
}

impl<F> PollObserver for F
where
    F: Fn(IoEvents) + Send,
{
    fn on_events(&self, events: IoEvents) {
        self(events)
    }
}
