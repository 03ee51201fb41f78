//! In-process MQTT 3.1.1 broker for session tests
//!
//! Speaks just enough of the protocol to drive a real `MqttSession`:
//! CONNACK (always `session_present = 0`), PUBACK, the QoS 2 handshake,
//! SUBACK, UNSUBACK and PINGRESP. Every packet the client sends is logged
//! so tests can assert on what went over the wire.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// A packet the broker received from a client
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Connect {
        client_id: String,
    },
    Publish {
        topic: String,
        qos: u8,
        pkid: u16,
        payload: Vec<u8>,
    },
    PubRel {
        pkid: u16,
    },
    Subscribe {
        pkid: u16,
        filters: Vec<(String, u8)>,
    },
    Unsubscribe {
        pkid: u16,
    },
    PingReq,
    Disconnect,
}

/// How the broker answers
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    /// Accept connections but never answer anything
    pub silent: bool,
    /// Hold QoS 1 acknowledgements until this many are pending, then send
    /// them newest first (0 acknowledges at once)
    pub batch_acks: usize,
}

#[derive(Debug, Clone)]
enum Control {
    DropConnections,
    Deliver { topic: String, payload: Vec<u8> },
}

struct BrokerState {
    behaviour: Behaviour,
    connections: AtomicUsize,
    log: Mutex<Vec<Received>>,
    control: broadcast::Sender<Control>,
}

impl BrokerState {
    fn record(&self, packet: Received) {
        self.log.lock().unwrap().push(packet);
    }
}

pub struct FakeBroker {
    addr: SocketAddr,
    state: Arc<BrokerState>,
    acceptor: JoinHandle<()>,
}

impl FakeBroker {
    pub async fn start() -> Self {
        Self::with_behaviour(Behaviour::default()).await
    }

    pub async fn with_behaviour(behaviour: Behaviour) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (control, _) = broadcast::channel(16);
        let state = Arc::new(BrokerState {
            behaviour,
            connections: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            control,
        });

        let accepting = state.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accepting.connections.fetch_add(1, Ordering::SeqCst);
                let control = accepting.control.subscribe();
                tokio::spawn(serve_connection(stream, accepting.clone(), control));
            }
        });

        Self {
            addr,
            state,
            acceptor,
        }
    }

    /// `host:port` for `BrokerAddress` parsing
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted so far
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|packet| matches!(packet, Received::Publish { .. }))
            .collect()
    }

    /// Close every open client connection
    pub fn drop_connections(&self) {
        let _ = self.state.control.send(Control::DropConnections);
    }

    /// Send a QoS 0 PUBLISH to every connected client
    pub fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let _ = self.state.control.send(Control::Deliver {
            topic: topic.to_string(),
            payload,
        });
    }

    /// Poll the log until `check` holds or `timeout` passes
    pub async fn wait_until<F>(&self, timeout: Duration, check: F) -> bool
    where
        F: Fn(&[Received]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(&self.received()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<BrokerState>,
    control: broadcast::Receiver<Control>,
) {
    let (mut reader, writer) = stream.into_split();
    let (packets_tx, packets) = mpsc::unbounded_channel();
    let reading = tokio::spawn(async move {
        while let Some(packet) = read_packet(&mut reader).await {
            if packets_tx.send(packet).is_err() {
                break;
            }
        }
    });

    exchange(writer, packets, state, control).await;
    // Dropping the read half closes the socket
    reading.abort();
}

async fn exchange(
    mut writer: OwnedWriteHalf,
    mut packets: mpsc::UnboundedReceiver<(u8, Vec<u8>)>,
    state: Arc<BrokerState>,
    mut control: broadcast::Receiver<Control>,
) {
    let mut held_acks: Vec<u16> = Vec::new();

    loop {
        let (header, body) = tokio::select! {
            packet = packets.recv() => match packet {
                Some(packet) => packet,
                None => return,
            },
            command = control.recv() => match command {
                Ok(Control::DropConnections) | Err(broadcast::error::RecvError::Closed) => return,
                Ok(Control::Deliver { topic, payload }) => {
                    if writer.write_all(&publish_frame(&topic, &payload)).await.is_err() {
                        return;
                    }
                    continue;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
            },
        };

        let packet = match decode(header, &body) {
            Some(packet) => packet,
            None => return,
        };
        state.record(packet.clone());
        if state.behaviour.silent {
            continue;
        }

        let mut reply = Vec::new();
        match packet {
            Received::Connect { .. } => reply.extend([0x20, 0x02, 0x00, 0x00]),
            Received::Publish { qos: 1, pkid, .. } => {
                if state.behaviour.batch_acks == 0 {
                    reply.extend(ack(0x40, pkid));
                } else {
                    held_acks.push(pkid);
                    if held_acks.len() >= state.behaviour.batch_acks {
                        for pkid in held_acks.drain(..).rev() {
                            reply.extend(ack(0x40, pkid));
                        }
                    }
                }
            }
            Received::Publish { qos: 2, pkid, .. } => reply.extend(ack(0x50, pkid)),
            Received::Publish { .. } => {}
            Received::PubRel { pkid } => reply.extend(ack(0x70, pkid)),
            Received::Subscribe { pkid, filters } => {
                let [hi, lo] = pkid.to_be_bytes();
                reply.push(0x90);
                reply.extend(remaining_length(2 + filters.len()));
                reply.extend([hi, lo]);
                reply.extend(filters.iter().map(|(_, qos)| *qos));
            }
            Received::Unsubscribe { pkid } => reply.extend(ack(0xb0, pkid)),
            Received::PingReq => reply.extend([0xd0, 0x00]),
            Received::Disconnect => return,
        }

        if !reply.is_empty() && writer.write_all(&reply).await.is_err() {
            return;
        }
    }
}

async fn read_packet<R: AsyncRead + Unpin>(stream: &mut R) -> Option<(u8, Vec<u8>)> {
    let header = stream.read_u8().await.ok()?;
    let mut length = 0usize;
    for shift in 0..4 {
        let byte = stream.read_u8().await.ok()?;
        length |= usize::from(byte & 0x7f) << (7 * shift);
        if byte & 0x80 == 0 {
            let mut body = vec![0u8; length];
            stream.read_exact(&mut body).await.ok()?;
            return Some((header, body));
        }
    }
    None
}

fn decode(header: u8, body: &[u8]) -> Option<Received> {
    let mut reader = Reader(body);
    let packet = match header >> 4 {
        1 => {
            reader.string()?; // protocol name
            reader.take(4)?; // level, flags, keepalive
            Received::Connect {
                client_id: reader.string()?,
            }
        }
        3 => {
            let qos = (header >> 1) & 0x03;
            let topic = reader.string()?;
            let pkid = if qos > 0 { reader.u16()? } else { 0 };
            Received::Publish {
                topic,
                qos,
                pkid,
                payload: reader.0.to_vec(),
            }
        }
        6 => Received::PubRel { pkid: reader.u16()? },
        8 => {
            let pkid = reader.u16()?;
            let mut filters = Vec::new();
            while !reader.0.is_empty() {
                let filter = reader.string()?;
                let qos = reader.take(1)?[0];
                filters.push((filter, qos));
            }
            Received::Subscribe { pkid, filters }
        }
        10 => Received::Unsubscribe { pkid: reader.u16()? },
        12 => Received::PingReq,
        14 => Received::Disconnect,
        _ => return None,
    };
    Some(packet)
}

struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Option<&'a [u8]> {
        if self.0.len() < count {
            return None;
        }
        let (head, tail) = self.0.split_at(count);
        self.0 = tail;
        Some(head)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn string(&mut self) -> Option<String> {
        let len = usize::from(self.u16()?);
        String::from_utf8(self.take(len)?.to_vec()).ok()
    }
}

fn ack(packet_type: u8, pkid: u16) -> [u8; 4] {
    let [hi, lo] = pkid.to_be_bytes();
    [packet_type, 0x02, hi, lo]
}

fn remaining_length(mut length: usize) -> Vec<u8> {
    let mut encoded = Vec::new();
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        encoded.push(byte);
        if length == 0 {
            return encoded;
        }
    }
}

fn publish_frame(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x30];
    frame.extend(remaining_length(2 + topic.len() + payload.len()));
    frame.extend((topic.len() as u16).to_be_bytes());
    frame.extend(topic.as_bytes());
    frame.extend(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_length_encoding() {
        assert_eq!(remaining_length(0), vec![0x00]);
        assert_eq!(remaining_length(127), vec![0x7f]);
        assert_eq!(remaining_length(128), vec![0x80, 0x01]);
        assert_eq!(remaining_length(20_480), vec![0x80, 0xa0, 0x01]);
    }

    #[test]
    fn test_decode_subscribe() {
        let body = [0x00, 0x07, 0x00, 0x03, b'a', b'/', b'+', 0x01];
        assert_eq!(
            decode(0x82, &body),
            Some(Received::Subscribe {
                pkid: 7,
                filters: vec![("a/+".to_string(), 1)],
            })
        );
    }
}
