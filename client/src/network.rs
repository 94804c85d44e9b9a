use log::{debug, info, trace, warn};
use rand::Rng;
use shared::frame::{self, AckEntry};
use shared::{
    opcode, Frame, MessageType, ProtocolClock, CONNECT_TOKEN_LEN, RELIABLE_CHANNELS,
    SCENE_CHANNEL,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub type ClientResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A frame received from the server, detached from its datagram
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFrame {
    pub type_byte: u8,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl ReceivedFrame {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_byte(self.type_byte)
    }

    /// Whether this is an ordered frame on 1-based `channel` starting with `opcode`
    pub fn is_ordered(&self, channel: u8, opcode: u8) -> bool {
        self.message_type() == Some(MessageType::ordered(channel))
            && self.payload.first() == Some(&opcode)
    }
}

/// Headless protocol client
///
/// Performs the handshake, acknowledges every ordered frame it receives and
/// answers pings, so a server sees it as a well-behaved peer.
pub struct BotClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    token: [u8; CONNECT_TOKEN_LEN],
    sequences: [u16; RELIABLE_CHANNELS],
    ping_counter: u8,
    connected: bool,
    netview_id: Option<u16>,
    clock: ProtocolClock,
    inbox: VecDeque<ReceivedFrame>,
}

impl BotClient {
    pub async fn new(server_addr: &str) -> ClientResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        let mut token = [0u8; CONNECT_TOKEN_LEN];
        rand::thread_rng().fill(&mut token[..]);

        Ok(BotClient {
            socket,
            server_addr,
            token,
            sequences: [0; RELIABLE_CHANNELS],
            ping_counter: 0,
            connected: false,
            netview_id: None,
            clock: ProtocolClock::new(),
            inbox: VecDeque::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Entity id the server assigned, once the set-id frame arrived
    pub fn netview_id(&self) -> Option<u16> {
        self.netview_id
    }

    pub fn token(&self) -> &[u8; CONNECT_TOKEN_LEN] {
        &self.token
    }

    /// Runs the SYN / response / established handshake
    pub async fn connect(&mut self, wait: Duration) -> ClientResult<()> {
        info!("Connecting to {}", self.server_addr);

        let syn = frame::encode(MessageType::Connect, 0, &self.token)?;
        self.send_raw(&syn).await?;

        let token = self.token;
        let response = self
            .wait_for(wait, |f| {
                f.message_type() == Some(MessageType::ConnectResponse)
                    && f.payload.get(..CONNECT_TOKEN_LEN) == Some(&token[..])
            })
            .await?;
        debug!("Connect response after {} payload bytes", response.payload.len());

        let established = frame::encode(MessageType::ConnectionEstablished, 0, &[])?;
        self.send_raw(&established).await?;
        self.connected = true;
        info!("Connected to {}", self.server_addr);
        Ok(())
    }

    pub async fn send_raw(&self, bytes: &[u8]) -> ClientResult<()> {
        self.socket.send_to(bytes, self.server_addr).await?;
        Ok(())
    }

    /// Sends `payload` on 1-based ordered `channel` with the next sequence
    ///
    /// Returns the sequence used so a test can replay it.
    pub async fn send_reliable(&mut self, channel: u8, payload: &[u8]) -> ClientResult<u16> {
        let index = (channel.saturating_sub(1) as usize).min(RELIABLE_CHANNELS - 1);
        let sequence = self.sequences[index];
        self.sequences[index] = sequence.wrapping_add(2);

        self.send_reliable_with(channel, sequence, payload).await?;
        Ok(sequence)
    }

    /// Sends an ordered frame with an explicit sequence, e.g. a retransmission
    pub async fn send_reliable_with(
        &self,
        channel: u8,
        sequence: u16,
        payload: &[u8],
    ) -> ClientResult<()> {
        let bytes = frame::encode(MessageType::ordered(channel), sequence, payload)?;
        trace!("Sending seq {} on channel {}", sequence, channel);
        self.send_raw(&bytes).await
    }

    pub async fn send_unreliable(&self, payload: &[u8]) -> ClientResult<()> {
        let bytes = frame::encode(MessageType::Unreliable, 0, payload)?;
        self.send_raw(&bytes).await
    }

    pub async fn ping(&mut self) -> ClientResult<u8> {
        self.ping_counter = self.ping_counter.wrapping_add(1);
        self.send_raw(&frame::encode_ping(self.ping_counter)).await?;
        Ok(self.ping_counter)
    }

    pub async fn disconnect(&mut self, reason: &str) -> ClientResult<()> {
        self.send_raw(&frame::encode_disconnect(reason)).await?;
        self.connected = false;
        Ok(())
    }

    /// Receives one datagram and queues its frames
    ///
    /// Ordered frames are acknowledged and pings answered before they are
    /// queued. Returns how many frames were added.
    async fn receive(&mut self, wait: Duration) -> ClientResult<usize> {
        let mut buffer = [0u8; 65536];
        let (len, from) = timeout(wait, self.socket.recv_from(&mut buffer)).await??;
        if from != self.server_addr {
            warn!("Ignoring datagram from {}", from);
            return Ok(0);
        }

        let mut cursor = 0;
        let mut frames = Vec::new();
        while cursor < len {
            let (frame, consumed) = Frame::decode(&buffer[cursor..len])?;
            cursor += consumed;
            frames.push(ReceivedFrame {
                type_byte: frame.header.type_byte,
                sequence: frame.sequence(),
                payload: frame.payload.to_vec(),
            });
        }

        let count = frames.len();
        for received in frames {
            self.react(&received).await?;
            self.inbox.push_back(received);
        }
        Ok(count)
    }

    async fn react(&mut self, received: &ReceivedFrame) -> ClientResult<()> {
        match received.message_type() {
            Some(MessageType::ReliableOrdered(_)) => {
                let ack = AckEntry::for_sequence(received.type_byte, received.sequence);
                self.send_raw(&frame::encode_ack(&[ack])).await?;

                if received.is_ordered(SCENE_CHANNEL, opcode::SET_ID) && received.payload.len() >= 3 {
                    let id = u16::from_le_bytes([received.payload[1], received.payload[2]]);
                    info!("Assigned entity id {}", id);
                    self.netview_id = Some(id);
                }
            }
            Some(MessageType::Ping) => {
                let counter = received.payload.first().copied().unwrap_or(0);
                let pong = frame::encode_pong(counter, self.clock.timestamp());
                self.send_raw(&pong).await?;
            }
            Some(MessageType::Disconnect) => {
                info!(
                    "Disconnected by server: {}",
                    frame::disconnect_reason(&received.payload)
                );
                self.connected = false;
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns the next frame matching `predicate`, receiving as needed
    ///
    /// Frames that do not match stay queued for later calls.
    pub async fn wait_for<F>(&mut self, wait: Duration, predicate: F) -> ClientResult<ReceivedFrame>
    where
        F: Fn(&ReceivedFrame) -> bool,
    {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(index) = self.inbox.iter().position(&predicate) {
                if let Some(found) = self.inbox.remove(index) {
                    return Ok(found);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err("timed out waiting for frame".into());
            }
            self.receive(remaining).await?;
        }
    }

    /// Receives for `wait` and returns everything that arrived, oldest first
    pub async fn collect_for(&mut self, wait: Duration) -> Vec<ReceivedFrame> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || self.receive(remaining).await.is_err() {
                break;
            }
        }
        self.inbox.drain(..).collect()
    }
}
