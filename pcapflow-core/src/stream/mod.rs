//! Flow identification and TCP stream reconstruction.
//!
//! - [`FlowId`] - protocol plus both endpoints of a transport packet
//! - [`transition`] - the TCP lifecycle state machine, as a pure function
//! - [`TcpStreamHandler`] - feeds decoded records through per-stream state machines

mod flow;
mod fsm;
mod handler;

pub use flow::FlowId;
pub use fsm::{transition, HalfClose, TcpFlowData, TcpSegment, TcpState};
pub use handler::{FragmentListener, StreamConfig, StreamListener, TcpStream, TcpStreamHandler};
