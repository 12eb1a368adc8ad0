//! Host platform signals.
//!
//! The library is host-agnostic: whoever embeds it owns the actual
//! low-memory and lifecycle notifications and forwards them over an
//! injected broadcast channel. See
//! [`MemoryCache::observe_platform_events`](crate::MemoryCache::observe_platform_events).

/// An event delivered by the host platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlatformEvent {
    /// The host is under memory pressure.
    MemoryPressure,
    /// The host process moved to the background.
    DidEnterBackground,
}
