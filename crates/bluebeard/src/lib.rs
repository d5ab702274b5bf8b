pub mod callback;
pub mod master;
pub mod net;
pub mod sched;

pub use callback::{CallbackGroup, Console, Observable};
pub use net::{NetworkPeer, Packet, PacketKind, SharedTransport, Transport};
pub use sched::{Scheduler, TaskId};
