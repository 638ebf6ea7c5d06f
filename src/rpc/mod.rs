//! JSON-RPC demultiplexing over a per-VM duplex control stream.

pub mod demux;
pub mod message;

pub use demux::{Demultiplexer, GuestRequestHandler, NotificationHandler};
