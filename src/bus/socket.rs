//! Carries bus topics to subscribers in other processes over TCP.
//!
//! Wire format, both directions: a little-endian `u32` length followed by a
//! `bincode` body. The client opens with one frame holding the topic
//! (`String`); the server then streams [`Envelope`]s for that topic and ends
//! with [`Payload::Stop`] when the bus shuts down.

use super::{BroadcastBus, Envelope, Payload, WeakBus};
use nanotrack_core::{AppResult, DaqError, StopSignal};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest frame accepted from the wire.
const MAX_FRAME: u32 = 256 * 1024 * 1024;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Timeouts applied to each accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// How long a new connection may take to send its topic
    pub handshake_timeout: Duration,
    /// How long one envelope write may block before the peer is dropped
    pub write_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

fn invalid(e: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e.to_string())
}

fn write_frame<T: Serialize>(stream: &mut impl Write, value: &T) -> io::Result<()> {
    let body = bincode::serialize(value).map_err(invalid)?;
    let len = u32::try_from(body.len()).map_err(invalid)?;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

/// `Ok(None)` on a clean end of stream.
fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> io::Result<Option<T>> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len);
    if len > MAX_FRAME {
        return Err(invalid(format!("frame of {len} bytes exceeds limit")));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    bincode::deserialize(&body).map(Some).map_err(invalid)
}

/// TCP endpoint that attaches one bus subscription per connection.
pub struct BusBridge {
    addr: SocketAddr,
    stop: StopSignal,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl BusBridge {
    /// Listen on `addr` and serve `bus` until [`shutdown`](Self::shutdown)
    /// or until the bus is dropped.
    pub fn serve(bus: &BroadcastBus, addr: impl ToSocketAddrs) -> AppResult<Self> {
        Self::serve_with(bus, addr, BridgeConfig::default())
    }

    /// [`serve`](Self::serve) with explicit connection timeouts.
    pub fn serve_with(
        bus: &BroadcastBus,
        addr: impl ToSocketAddrs,
        config: BridgeConfig,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;
        let stop = StopSignal::new();

        let bus = bus.downgrade();
        let accept_stop = stop.clone();
        let acceptor = thread::Builder::new()
            .name("bus-bridge".into())
            .spawn(move || accept_loop(&listener, &bus, &accept_stop, config))?;

        info!(%addr, "Bus bridge listening");
        Ok(Self {
            addr,
            stop,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Bound address, useful when serving on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting connections. Open connections end when the bus stops.
    pub fn shutdown(&self) {
        self.stop.trigger();
        if let Some(handle) = self.acceptor.lock().take() {
            if handle.join().is_err() {
                warn!("Bus bridge acceptor panicked");
            }
        }
    }
}

impl Drop for BusBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &TcpListener, bus: &WeakBus, stop: &StopSignal, config: BridgeConfig) {
    while !stop.is_triggered() {
        if bus.upgrade().is_none() {
            info!("Bus dropped, bridge stops accepting");
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let bus = bus.clone();
                let spawned = thread::Builder::new()
                    .name(format!("bus-peer-{peer}"))
                    .spawn(move || {
                        if let Err(e) = serve_peer(stream, &bus, config) {
                            debug!(%peer, error = %e, "Bus peer disconnected");
                        }
                    });
                if let Err(e) = spawned {
                    warn!(%peer, error = %e, "Could not spawn bus peer thread");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                stop.sleep(ACCEPT_POLL);
            }
            Err(e) => {
                warn!(error = %e, "Bus bridge accept failed");
                stop.sleep(ACCEPT_POLL);
            }
        }
    }
    debug!("Bus bridge acceptor exiting");
}

fn serve_peer(mut stream: TcpStream, bus: &WeakBus, config: BridgeConfig) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(config.handshake_timeout))?;
    stream.set_write_timeout(Some(config.write_timeout))?;
    let Some(topic) = read_frame::<String>(&mut stream)? else {
        return Ok(());
    };
    // the subscription alone does not keep the bus running
    let mut subscription = match bus.upgrade() {
        Some(bus) => bus.subscribe(&topic),
        None => return Ok(()),
    };
    debug!(topic, "Remote subscriber attached");
    while let Some(envelope) = subscription.recv() {
        write_frame(&mut stream, envelope.as_ref())?;
    }
    write_frame(
        &mut stream,
        &Envelope {
            topic,
            payload: Payload::Stop,
        },
    )
}

/// Client side of a [`BusBridge`] connection.
pub struct RemoteSubscriber {
    topic: String,
    stream: TcpStream,
    ended: bool,
}

impl RemoteSubscriber {
    /// Connect to a bridge and subscribe to `topic`.
    pub fn connect(addr: impl ToSocketAddrs, topic: &str) -> AppResult<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &topic.to_string())?;
        Ok(Self {
            topic: topic.to_string(),
            stream,
            ended: false,
        })
    }

    /// Topic this subscriber listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Block for the next message. `Ok(None)` once the bus has stopped or the
    /// connection closed.
    pub fn recv(&mut self) -> AppResult<Option<Envelope>> {
        while !self.ended {
            let Some(envelope) = read_frame::<Envelope>(&mut self.stream)? else {
                self.ended = true;
                break;
            };
            if envelope.payload.is_stop() {
                self.ended = true;
                break;
            }
            if envelope.topic != self.topic {
                continue;
            }
            return Ok(Some(envelope));
        }
        Ok(None)
    }

    /// Give up waiting after `timeout` on each read.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> AppResult<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(DaqError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusConfig;
    use nanotrack_core::{Frame, TrackedPoint};
    use std::sync::Arc;

    #[test]
    fn test_frame_roundtrip_through_buffer() {
        let envelope = Envelope {
            topic: "tracks".into(),
            payload: Payload::Points {
                frame_index: 7,
                points: vec![TrackedPoint::new(1.5, 2.5)],
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &envelope).unwrap();
        let decoded: Envelope = read_frame(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(decoded, envelope);
        let mut empty: &[u8] = &[];
        assert!(read_frame::<Envelope>(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let bytes = (MAX_FRAME + 1).to_le_bytes();
        let err = read_frame::<Envelope>(&mut bytes.as_slice()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_remote_subscriber_receives_until_stop() {
        let bus = BroadcastBus::start(BusConfig {
            grace: Duration::from_millis(20),
            ..Default::default()
        })
        .unwrap();
        let bridge = BusBridge::serve(&bus, "127.0.0.1:0").unwrap();
        let mut remote = RemoteSubscriber::connect(bridge.local_addr(), "frames").unwrap();
        remote
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        // wait until the bridge has attached the subscription
        for _ in 0..500 {
            if bus.stats().subscribers == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let frame = Arc::new(Frame::zeros(3, 4, 2));
        bus.publish("frames", Payload::Frame(Arc::clone(&frame)));
        bus.publish("frames", Payload::Text("hello".into()));

        let first = remote.recv().unwrap().unwrap();
        assert_eq!(first.payload, Payload::Frame(frame));
        let second = remote.recv().unwrap().unwrap();
        assert_eq!(second.payload, Payload::Text("hello".into()));

        bus.stop();
        assert!(remote.recv().unwrap().is_none());
        bridge.shutdown();
    }

    #[test]
    fn test_silent_client_is_disconnected() {
        let bus = BroadcastBus::start(BusConfig::default()).unwrap();
        let bridge = BusBridge::serve_with(
            &bus,
            "127.0.0.1:0",
            BridgeConfig {
                handshake_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap();

        let mut idle = TcpStream::connect(bridge.local_addr()).unwrap();
        idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut buf = [0u8; 1];
        // the server side closes without sending anything
        assert_eq!(idle.read(&mut buf).unwrap(), 0);
        assert_eq!(bus.stats().subscribers, 0);
        bridge.shutdown();
    }

    #[test]
    fn test_dropping_the_bus_ends_remote_subscribers() {
        let bus = BroadcastBus::start(BusConfig {
            grace: Duration::from_millis(10),
            ..Default::default()
        })
        .unwrap();
        let bridge = BusBridge::serve(&bus, "127.0.0.1:0").unwrap();
        let mut remote = RemoteSubscriber::connect(bridge.local_addr(), "tracks").unwrap();
        remote
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..500 {
            if bus.stats().subscribers == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        let weak = bus.downgrade();

        drop(bus);
        assert!(remote.recv().unwrap().is_none());
        assert!(weak.upgrade().is_none());
        bridge.shutdown();
    }
}
