//! Packet-radio mesh node core.
//! Host-driven: no I/O of its own; the host supplies a transceiver, a serial stream and a clock,
//! and calls `poll` from its control loop.

pub mod clock;
pub mod contacts;
pub mod dedup;
pub mod dispatcher;
pub mod identity;
pub mod integrity;
pub mod modem;
pub mod node;
pub mod noise_floor;
pub mod packet;
pub mod protocol;
pub mod radio;
pub mod reliability;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use clock::{ClockSync, RtcClock, VolatileRtcClock};
pub use contacts::{ContactBook, ContactRecord, NodePrefs};
pub use dispatcher::{Dispatcher, DispatcherConfig, ReceivedFrame};
pub use identity::LocalIdentity;
pub use modem::{KissModem, ModemLoop, ModemStats};
pub use node::{Node, NodeError, NodeEvent};
pub use radio::{EventQueue, RadioEvent, RadioParams, RadioState, RadioTransport, Transceiver};
pub use reliability::{ReliableMessenger, RetryPolicy};
pub use wire::{encode_frame, FrameDecoder, FrameEncodeError, FrameHandler, KissPort, SerialStream};
