//! Network transport shared by every protocol in the crate

pub mod socket;

pub use socket::{create_tcp_listener, create_udp_socket, is_disconnect, FramedSocket};
