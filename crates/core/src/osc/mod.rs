//! Best-effort OSC delivery over UDP.
//!
//! Sending never returns an error to the caller: a failed datagram is logged
//! and dropped so the audio thread keeps its timing. The destination can be
//! changed from another thread at any time; every send observes either the
//! complete old binding or the complete new one.

use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use rosc::{encoder, OscMessage, OscPacket, OscType};

use crate::mapping::{normalize_tempo, ValueMapping};
use crate::{BeatSyncError, Result};

/// Host and port of the OSC controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OscEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for OscEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Single numeric OSC argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OscValue {
    Int(i32),
    Float(f32),
}

impl OscValue {
    fn as_f32(self) -> f32 {
        match self {
            Self::Int(value) => value as f32,
            Self::Float(value) => value,
        }
    }
}

impl From<i32> for OscValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f32> for OscValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<OscValue> for OscType {
    fn from(value: OscValue) -> Self {
        match value {
            OscValue::Int(value) => OscType::Int(value),
            OscValue::Float(value) => OscType::Float(value),
        }
    }
}

/// What happened to a single [`OscSender::send`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The datagram was handed to the socket.
    Sent,
    /// The value fell outside the normalisation range and nothing was sent.
    OutOfRange,
    /// Encoding or the socket failed. The failure has been logged.
    Failed,
}

struct Binding {
    endpoint: OscEndpoint,
    target: SocketAddr,
    socket: UdpSocket,
}

impl Binding {
    fn open(host: &str, port: u16) -> Result<Self> {
        let host: String = host.chars().filter(|c| !c.is_whitespace()).collect();
        let endpoint_error = |reason: String| BeatSyncError::Endpoint {
            host: host.clone(),
            port,
            reason,
        };

        if host.is_empty() {
            return Err(endpoint_error("host is empty".to_string()));
        }
        if port == 0 {
            return Err(endpoint_error("port 0 is not a valid destination".to_string()));
        }

        let target = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|err| endpoint_error(err.to_string()))?
            .next()
            .ok_or_else(|| endpoint_error("host did not resolve to any address".to_string()))?;

        let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            endpoint: OscEndpoint { host, port },
            target,
            socket,
        })
    }

    fn transmit(&self, address: &str, value: OscValue) -> Result<()> {
        self.write(address, value)
            .map_err(|err| BeatSyncError::Transport {
                host: self.endpoint.host.clone(),
                port: self.endpoint.port,
                address: address.to_string(),
                reason: err.to_string(),
            })
    }

    fn write(&self, address: &str, value: OscValue) -> Result<()> {
        let packet = OscPacket::Message(OscMessage {
            addr: address.to_string(),
            args: vec![value.into()],
        });
        let bytes = encoder::encode(&packet)?;
        self.socket.send_to(&bytes, self.target)?;
        Ok(())
    }
}

/// UDP client that sends one address/value pair per datagram.
pub struct OscSender {
    binding: ArcSwap<Binding>,
    rebuild: Mutex<()>,
}

impl OscSender {
    /// Resolves `host:port` and binds a local socket. Fails fast on a
    /// malformed destination.
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let binding = Binding::open(host, port)?;
        tracing::info!(endpoint = %binding.endpoint, "OSC sender ready");
        Ok(Self {
            binding: ArcSwap::from_pointee(binding),
            rebuild: Mutex::new(()),
        })
    }

    pub fn endpoint(&self) -> OscEndpoint {
        self.binding.load().endpoint.clone()
    }

    pub fn set_host(&self, host: &str) -> Result<()> {
        let _guard = self.rebuild.lock();
        let port = self.binding.load().endpoint.port;
        self.swap_binding(Binding::open(host, port)?);
        Ok(())
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        let _guard = self.rebuild.lock();
        let host = self.binding.load().endpoint.host.clone();
        self.swap_binding(Binding::open(&host, port)?);
        Ok(())
    }

    /// Replaces host and port together. On error the previous binding stays active.
    pub fn set_endpoint(&self, host: &str, port: u16) -> Result<()> {
        let _guard = self.rebuild.lock();
        self.swap_binding(Binding::open(host, port)?);
        Ok(())
    }

    fn swap_binding(&self, binding: Binding) {
        tracing::info!(endpoint = %binding.endpoint, "OSC endpoint rebuilt");
        self.binding.store(Arc::new(binding));
    }

    /// Sends `value` to `address`.
    ///
    /// With `normalize` set, only values in `(20, 500)` are sent, remapped to
    /// `[0, 1)` as a float. Transport failures are logged and reported as
    /// [`SendOutcome::Failed`]; they never propagate.
    pub fn send(&self, address: &str, value: impl Into<OscValue>, normalize: bool) -> SendOutcome {
        let value = value.into();
        let value = match ValueMapping::from_flag(normalize) {
            ValueMapping::Verbatim => value,
            ValueMapping::Normalized => match normalize_tempo(value.as_f32()) {
                Some(mapped) => OscValue::Float(mapped),
                None => return SendOutcome::OutOfRange,
            },
        };

        let binding = self.binding.load_full();
        match binding.transmit(address, value) {
            Ok(()) => {
                tracing::trace!(address, ?value, endpoint = %binding.endpoint, "OSC sent");
                SendOutcome::Sent
            }
            Err(err) => {
                tracing::warn!(error = %err, "OSC message dropped");
                SendOutcome::Failed
            }
        }
    }
}

impl std::fmt::Debug for OscSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OscSender")
            .field("endpoint", &self.binding.load().endpoint)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::time::Duration;

    use rosc::decoder;

    use super::*;

    pub(crate) fn receiver() -> (UdpSocket, u16) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    pub(crate) fn recv_message(socket: &UdpSocket) -> Option<OscMessage> {
        let mut buf = [0_u8; 1024];
        let len = socket.recv(&mut buf).ok()?;
        match decoder::decode_udp(&buf[..len]).ok()?.1 {
            OscPacket::Message(message) => Some(message),
            OscPacket::Bundle(_) => None,
        }
    }

    #[test]
    fn sends_verbatim_values() {
        let (socket, port) = receiver();
        let sender = OscSender::new("127.0.0.1", port).unwrap();

        assert_eq!(sender.send("/tempo", 128, false), SendOutcome::Sent);

        let message = recv_message(&socket).expect("datagram");
        assert_eq!(message.addr, "/tempo");
        assert_eq!(message.args, vec![OscType::Int(128)]);
    }

    #[test]
    fn normalizes_into_unit_range() {
        let (socket, port) = receiver();
        let sender = OscSender::new("127.0.0.1", port).unwrap();

        assert_eq!(sender.send("/tempo", 260, true), SendOutcome::Sent);

        let message = recv_message(&socket).expect("datagram");
        assert_eq!(message.args, vec![OscType::Float(0.5)]);
    }

    #[test]
    fn drops_values_outside_normalization_range() {
        let (socket, port) = receiver();
        let sender = OscSender::new("127.0.0.1", port).unwrap();

        assert_eq!(sender.send("/tempo", 19, true), SendOutcome::OutOfRange);
        assert_eq!(sender.send("/tempo", 500, true), SendOutcome::OutOfRange);
        assert!(recv_message(&socket).is_none());
    }

    #[test]
    fn rebuilding_the_port_redirects_traffic() {
        let (first, first_port) = receiver();
        let (second, second_port) = receiver();
        let sender = OscSender::new("127.0.0.1", first_port).unwrap();

        sender.set_port(second_port).unwrap();
        sender.send("/resync", 1, false);

        assert!(recv_message(&second).is_some());
        assert!(recv_message(&first).is_none());
        assert_eq!(
            sender.endpoint(),
            OscEndpoint {
                host: "127.0.0.1".to_string(),
                port: second_port
            }
        );
    }

    #[test]
    fn failed_rebuild_keeps_previous_binding() {
        let (socket, port) = receiver();
        let sender = OscSender::new("127.0.0.1", port).unwrap();

        assert!(sender.set_host("   ").is_err());
        sender.send("/tempo", 90, false);

        assert!(recv_message(&socket).is_some());
        assert_eq!(sender.endpoint().host, "127.0.0.1");
    }

    #[test]
    fn strips_whitespace_from_host() {
        let (socket, port) = receiver();
        let sender = OscSender::new(" 127.0.0.1 ", port).unwrap();

        assert_eq!(sender.endpoint().host, "127.0.0.1");
        sender.send("/tempo", 100, false);
        assert!(recv_message(&socket).is_some());
    }

    #[test]
    fn malformed_destination_fails_at_construction() {
        let err = OscSender::new("", 7000).unwrap_err();
        assert!(matches!(err, BeatSyncError::Endpoint { .. }));

        let err = OscSender::new("127.0.0.1", 0).unwrap_err();
        assert!(matches!(err, BeatSyncError::Endpoint { .. }));
    }

    #[test]
    fn unreachable_destination_does_not_propagate() {
        let (socket, port) = receiver();
        drop(socket);
        let sender = OscSender::new("127.0.0.1", port).unwrap();

        for _ in 0..3 {
            let outcome = sender.send("/tempo", 120, false);
            assert_ne!(outcome, SendOutcome::OutOfRange);
        }
    }

    #[test]
    fn socket_failure_is_reported_as_transport_error() {
        let (_socket, port) = receiver();
        // an IPv4 socket cannot reach an IPv6 target
        let binding = Binding {
            endpoint: OscEndpoint {
                host: "::1".to_string(),
                port,
            },
            target: SocketAddr::from((std::net::Ipv6Addr::LOCALHOST, port)),
            socket: UdpSocket::bind("127.0.0.1:0").unwrap(),
        };

        match binding.transmit("/tempo", OscValue::Int(120)).unwrap_err() {
            err @ BeatSyncError::Transport { .. } => {
                let text = err.to_string();
                assert!(text.contains("/tempo"));
                assert!(text.contains(&format!("::1:{port}")));
            }
            other => panic!("unexpected error {other:?}"),
        }

        let sender = OscSender {
            binding: ArcSwap::from_pointee(binding),
            rebuild: Mutex::new(()),
        };
        assert_eq!(sender.send("/tempo", 120, false), SendOutcome::Failed);
    }
}
