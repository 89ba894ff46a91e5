use std::io::ErrorKind;
use std::time::Duration;

use log::debug;
use pnet::datalink::{self, Channel, Config, DataLinkReceiver};

use super::{CaptureError, CaptureOpener, CaptureSource};

/// Linux errno reported by packet sockets once the interface is gone.
const ENETDOWN: i32 = 100;

/// Opens pnet datalink channels in promiscuous mode.
///
/// Reads time out after `read_timeout` so a blocked capture thread wakes up
/// regularly even on an idle interface.
#[derive(Debug, Clone)]
pub struct PnetOpener {
    read_timeout: Duration,
}

impl PnetOpener {
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl CaptureOpener for PnetOpener {
    fn open(&self, interface: &str) -> Result<Box<dyn CaptureSource>, CaptureError> {
        let iface = datalink::interfaces()
            .into_iter()
            .find(|i| i.name == interface)
            .ok_or_else(|| CaptureError::InterfaceNotFound(interface.to_string()))?;

        let config = Config {
            promiscuous: true,
            read_timeout: Some(self.read_timeout),
            ..Default::default()
        };
        match datalink::channel(&iface, config) {
            // Only the receive half is used; the sender is dropped here.
            Ok(Channel::Ethernet(_tx, rx)) => {
                debug!("opened capture on {}", interface);
                Ok(Box::new(PnetCapture {
                    interface: interface.to_string(),
                    rx,
                }))
            }
            Ok(_) => Err(CaptureError::UnsupportedChannel(interface.to_string())),
            Err(source) => Err(CaptureError::Open {
                interface: interface.to_string(),
                source,
            }),
        }
    }
}

/// A live capture on one interface. The socket is released on drop.
pub struct PnetCapture {
    interface: String,
    rx: Box<dyn DataLinkReceiver>,
}

impl CaptureSource for PnetCapture {
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, CaptureError> {
        match self.rx.next() {
            Ok(frame) => Ok(Some(frame.to_vec())),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            // The veth vanished with its container.
            Err(e) if e.raw_os_error() == Some(ENETDOWN) => Err(CaptureError::Closed),
            Err(source) => Err(CaptureError::Read {
                interface: self.interface.clone(),
                source,
            }),
        }
    }

    fn interface_name(&self) -> &str {
        &self.interface
    }
}
