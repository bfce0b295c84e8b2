//! Point-to-point communication between workers: the message tag space, the
//! non-blocking message queue with large-message fragmentation and
//! self-loopback, and the transports that carry raw frames between ranks.

mod handle;
mod queue;
mod tags;
mod transport;

pub use handle::MessageHandle;
pub use queue::{CommLink, MessageQueue, SendId};
pub use tags::{Tag, OFFSET_BATCHED};
pub use transport::{channel_mesh, ChannelTransport, Frame, TcpTransport, Transport};
