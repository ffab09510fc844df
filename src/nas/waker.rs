//! Wake-on-LAN magic packets.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use thiserror::Error;

use crate::config::MacAddress;

/// Size of a magic packet: 6 sync bytes plus 16 copies of the address.
pub const MAGIC_PACKET_LEN: usize = 6 + 16 * 6;

/// The wake signal could not be sent. Says nothing about whether the device woke.
#[derive(Error, Debug)]
pub enum WakeError {
    #[error("Failed to open UDP socket: {0}")]
    Socket(#[source] std::io::Error),

    #[error("Failed to enable broadcast: {0}")]
    Broadcast(#[source] std::io::Error),

    #[error("Failed to send WOL packet to {target}: {source}")]
    Send {
        target: SocketAddrV4,
        #[source]
        source: std::io::Error,
    },

    #[error("Short write sending WOL packet: {sent} of {MAGIC_PACKET_LEN} bytes")]
    ShortWrite { sent: usize },
}

/// Sends the wake signal for a hardware address. Fire-and-forget.
pub trait NetworkWaker {
    fn wake(&self, mac: &MacAddress) -> Result<(), WakeError>;
}

/// Build the 102-byte magic packet for `mac`.
pub fn magic_packet(mac: &MacAddress) -> [u8; MAGIC_PACKET_LEN] {
    let mut packet = [0xFF; MAGIC_PACKET_LEN];
    let octets = mac.octets();
    for chunk in packet[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&octets);
    }
    packet
}

/// Broadcasts magic packets over UDP.
#[derive(Debug, Clone)]
pub struct MagicPacketWaker {
    target: SocketAddrV4,
}

impl MagicPacketWaker {
    pub fn new(broadcast: Ipv4Addr, port: u16) -> Self {
        Self {
            target: SocketAddrV4::new(broadcast, port),
        }
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }
}

impl NetworkWaker for MagicPacketWaker {
    fn wake(&self, mac: &MacAddress) -> Result<(), WakeError> {
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(WakeError::Socket)?;
        socket.set_broadcast(true).map_err(WakeError::Broadcast)?;

        let packet = magic_packet(mac);
        let sent = socket
            .send_to(&packet, self.target)
            .map_err(|source| WakeError::Send {
                target: self.target,
                source,
            })?;
        if sent != packet.len() {
            return Err(WakeError::ShortWrite { sent });
        }

        tracing::info!(mac = %mac, target = %self.target, "WOL packet sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MAC: MacAddress = MacAddress::new([0x00, 0x11, 0x32, 0xAA, 0xBB, 0xCC]);

    #[test]
    fn test_magic_packet_layout() {
        let packet = magic_packet(&MAC);
        assert_eq!(packet.len(), 102);
        assert!(packet[..6].iter().all(|b| *b == 0xFF));
        for repeat in packet[6..].chunks(6) {
            assert_eq!(repeat, &MAC.octets());
        }
    }

    #[test]
    fn test_wake_delivers_packet_to_listener() {
        let listener = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let waker = MagicPacketWaker::new(Ipv4Addr::LOCALHOST, port);
        // Stateless: repeated wakes behave the same.
        waker.wake(&MAC).unwrap();
        waker.wake(&MAC).unwrap();

        let mut buf = [0u8; 256];
        for _ in 0..2 {
            let (len, _) = listener.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..len], &magic_packet(&MAC)[..]);
        }
    }
}
