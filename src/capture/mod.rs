//! Packet capture abstraction.
//!
//! Monitors depend on [`CaptureOpener`] rather than on pnet directly so the
//! flow pipeline can be driven by recorded frames in tests.

mod pnet_capture;

pub use pnet_capture::{PnetCapture, PnetOpener};

use std::net::Ipv4Addr;

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::graph::AppLayerContent;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("interface `{0}` not found")]
    InterfaceNotFound(String),
    #[error("failed to open capture on `{interface}`: {source}")]
    Open {
        interface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("interface `{0}` does not provide an ethernet channel")]
    UnsupportedChannel(String),
    #[error("capture read on `{interface}` failed: {source}")]
    Read {
        interface: String,
        #[source]
        source: std::io::Error,
    },
    #[error("capture source closed")]
    Closed,
}

/// A live stream of raw link-layer frames from one interface.
pub trait CaptureSource: Send {
    /// Blocks until the next frame arrives. `Ok(None)` means the read timed
    /// out without a frame, which gives the caller a chance to check for
    /// cancellation. [`CaptureError::Closed`] ends the stream.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError>;

    fn interface_name(&self) -> &str;
}

pub trait CaptureOpener: Send + Sync {
    /// Opens a promiscuous capture on `interface`.
    fn open(&self, interface: &str) -> Result<Box<dyn CaptureSource>, CaptureError>;
}

/// Network-layer endpoints of one frame plus its transport payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub content: AppLayerContent,
}

/// Extracts the IPv4 endpoints of an ethernet frame. Frames without an IPv4
/// header (ARP, IPv6, truncated data) yield `None`.
pub fn parse_frame(frame: &[u8]) -> Option<Observation> {
    let ethernet = EthernetPacket::new(frame)?;
    if ethernet.get_ethertype() != EtherTypes::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new(ethernet.payload())?;

    let content = match ip.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ip.payload());
            AppLayerContent::from_payload(tcp.as_ref().map(|p| p.payload()))
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ip.payload());
            AppLayerContent::from_payload(udp.as_ref().map(|p| p.payload()))
        }
        _ => AppLayerContent::Absent,
    };

    Some(Observation {
        src: ip.get_source(),
        dst: ip.get_destination(),
        content,
    })
}
