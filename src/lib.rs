//! PhaseHound core — the substrate of a modular software-radio host.
//!
//! Four subsystems make module composition possible:
//!
//! - [`broker`] — a local-socket message broker routing framed JSON
//!   between clients on named feeds, relaying ancillary descriptors;
//! - [`plugin`] — discovery, versioned loading, and lifecycle of
//!   dynamically loaded modules under a stable binary contract;
//! - [`shm`] — sealed, memory-mapped ring buffers with absolute 64-bit
//!   producer/consumer counters for zero-copy sample transport;
//! - [`ctrl`] — the control-plane convention every module speaks over the
//!   broker (feed naming, command dispatch, replies, ring publication).
//!
//! DSP, device binding, and playback live in addons; the core knows them
//! only through a ring handle and a control-plane context.

// Library modules
pub mod broker;
pub mod constants;
pub mod ctrl;
pub mod plugin;
pub mod shm;
pub mod socket;

// Re-export commonly used types
pub use broker::feeds::FeedTable;
pub use broker::BrokerConfig;
pub use ctrl::{CtrlContext, ShmMapInfo};
pub use plugin::loader::{LoadOutcome, PluginRegistry};
pub use plugin::{PluginCaps, PluginCtx};
pub use shm::blob::ShmBlob;
pub use shm::ring::{OverflowPolicy, PushOutcome, RingConfig, RingKind, SampleFormat, StreamRing};
pub use socket::framing::{Frame, RecvOutcome};
