//! EMMG/PDG ↔ MUX protocol
//!
//! Binary codec and client session for the DVB SimulCrypt EMMG/PDG to MUX
//! interface: a TCP control session negotiates a data channel and a data
//! stream, requests bandwidth, then carries EMM/private data as sections or
//! TS packets in data_provision messages. The engine acts as the EMMG side;
//! protocol versions 1 to 5 are supported (version 1 omits the client id
//! in data_provision over UDP, which this implementation does not use).

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tracing::{debug, info};

// Message types.
pub const MSG_CHANNEL_SETUP: u16 = 0x0011;
pub const MSG_CHANNEL_TEST: u16 = 0x0012;
pub const MSG_CHANNEL_STATUS: u16 = 0x0013;
pub const MSG_CHANNEL_CLOSE: u16 = 0x0014;
pub const MSG_CHANNEL_ERROR: u16 = 0x0015;
pub const MSG_STREAM_SETUP: u16 = 0x0111;
pub const MSG_STREAM_TEST: u16 = 0x0112;
pub const MSG_STREAM_STATUS: u16 = 0x0113;
pub const MSG_STREAM_CLOSE_REQUEST: u16 = 0x0114;
pub const MSG_STREAM_CLOSE_RESPONSE: u16 = 0x0115;
pub const MSG_STREAM_ERROR: u16 = 0x0116;
pub const MSG_STREAM_BW_REQUEST: u16 = 0x0117;
pub const MSG_STREAM_BW_ALLOCATION: u16 = 0x0118;
pub const MSG_DATA_PROVISION: u16 = 0x0211;

// Parameter types.
pub const PRM_CLIENT_ID: u16 = 0x0001;
pub const PRM_SECTION_TSPKT_FLAG: u16 = 0x0002;
pub const PRM_DATA_CHANNEL_ID: u16 = 0x0003;
pub const PRM_DATA_STREAM_ID: u16 = 0x0004;
pub const PRM_DATAGRAM: u16 = 0x0005;
pub const PRM_BANDWIDTH: u16 = 0x0006;
pub const PRM_DATA_TYPE: u16 = 0x0007;
pub const PRM_DATA_ID: u16 = 0x0008;
pub const PRM_ERROR_STATUS: u16 = 0x7000;
pub const PRM_ERROR_INFORMATION: u16 = 0x7001;

/// One TLV parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvParameter {
    pub tag: u16,
    pub value: Bytes,
}

impl TlvParameter {
    pub fn u16(tag: u16, value: u16) -> Self {
        Self {
            tag,
            value: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn u32(tag: u16, value: u32) -> Self {
        Self {
            tag,
            value: Bytes::copy_from_slice(&value.to_be_bytes()),
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        (self.value.len() == 2).then(|| u16::from_be_bytes([self.value[0], self.value[1]]))
    }

    pub fn as_u32(&self) -> Option<u32> {
        (self.value.len() == 4).then(|| {
            u32::from_be_bytes([self.value[0], self.value[1], self.value[2], self.value[3]])
        })
    }
}

/// One EMMG/PDG ↔ MUX message: version, type, TLV parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlvMessage {
    pub version: u8,
    pub msg_type: u16,
    pub params: Vec<TlvParameter>,
}

impl TlvMessage {
    pub fn new(version: u8, msg_type: u16) -> Self {
        Self {
            version,
            msg_type,
            params: Vec::new(),
        }
    }

    pub fn with(mut self, param: TlvParameter) -> Self {
        self.params.push(param);
        self
    }

    /// First parameter with the given tag.
    pub fn param(&self, tag: u16) -> Option<&TlvParameter> {
        self.params.iter().find(|p| p.tag == tag)
    }

    /// Serialize: version (1), type (2), length (2), then parameters as
    /// tag (2), length (2), value.
    pub fn serialize(&self) -> Vec<u8> {
        let body_len: usize = self.params.iter().map(|p| 4 + p.value.len()).sum();
        let mut out = Vec::with_capacity(5 + body_len);
        out.push(self.version);
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&(body_len as u16).to_be_bytes());
        for p in &self.params {
            out.extend_from_slice(&p.tag.to_be_bytes());
            out.extend_from_slice(&(p.value.len() as u16).to_be_bytes());
            out.extend_from_slice(&p.value);
        }
        out
    }

    /// Deserialize one complete message.
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            bail!("truncated TLV message header");
        }
        let version = data[0];
        let msg_type = u16::from_be_bytes([data[1], data[2]]);
        let body_len = u16::from_be_bytes([data[3], data[4]]) as usize;
        if data.len() < 5 + body_len {
            bail!("truncated TLV message body");
        }
        let mut params = Vec::new();
        let mut rest = &data[5..5 + body_len];
        while !rest.is_empty() {
            if rest.len() < 4 {
                bail!("truncated TLV parameter");
            }
            let tag = u16::from_be_bytes([rest[0], rest[1]]);
            let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
            if rest.len() < 4 + len {
                bail!("truncated TLV parameter value");
            }
            params.push(TlvParameter {
                tag,
                value: Bytes::copy_from_slice(&rest[4..4 + len]),
            });
            rest = &rest[4 + len..];
        }
        Ok(Self {
            version,
            msg_type,
            params,
        })
    }

    fn read_from(stream: &mut TcpStream) -> Result<Self> {
        let mut header = [0u8; 5];
        stream.read_exact(&mut header)?;
        let body_len = u16::from_be_bytes([header[3], header[4]]) as usize;
        let mut buf = vec![0u8; 5 + body_len];
        buf[..5].copy_from_slice(&header);
        stream.read_exact(&mut buf[5..])?;
        Self::deserialize(&buf)
    }
}

/// Session state of the EMMG client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Disconnected,
    ChannelOpen,
    StreamOpen,
}

/// Blocking EMMG-side client session over TCP.
///
/// Lifecycle: connect, `channel_setup`, `stream_setup`, optionally
/// `request_bandwidth`, any number of `data_provision`, then `close`.
pub struct EmmgClient {
    version: u8,
    client_id: u32,
    channel_id: u16,
    stream_id: u16,
    data_id: u16,
    /// True when data_provision carries sections, false for TS packets.
    section_mode: bool,
    stream: Option<TcpStream>,
    state: SessionState,
    allocated_bandwidth: Option<u16>,
}

impl EmmgClient {
    pub fn new(version: u8, client_id: u32, channel_id: u16, stream_id: u16, data_id: u16) -> Self {
        Self {
            version: version.clamp(1, 5),
            client_id,
            channel_id,
            stream_id,
            data_id,
            section_mode: true,
            stream: None,
            state: SessionState::Disconnected,
            allocated_bandwidth: None,
        }
    }

    pub fn set_section_mode(&mut self, sections: bool) {
        self.section_mode = sections;
    }

    /// Bandwidth granted by the MUX, when one was requested.
    pub fn allocated_bandwidth(&self) -> Option<u16> {
        self.allocated_bandwidth
    }

    /// Connect to the MUX and set up the data channel.
    pub fn connect(&mut self, addr: impl ToSocketAddrs, timeout: Duration) -> Result<()> {
        if self.state != SessionState::Disconnected {
            bail!("EMMG session already connected");
        }
        let addr = addr
            .to_socket_addrs()?
            .next()
            .context("cannot resolve MUX address")?;
        let stream = TcpStream::connect_timeout(&addr, timeout).context("cannot connect to MUX")?;
        stream.set_read_timeout(Some(timeout))?;
        self.stream = Some(stream);

        let setup = TlvMessage::new(self.version, MSG_CHANNEL_SETUP)
            .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
            .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id))
            .with(TlvParameter::u16(
                PRM_SECTION_TSPKT_FLAG,
                self.section_mode as u16,
            ));
        let status = self.exchange(&setup)?;
        if status.msg_type != MSG_CHANNEL_STATUS {
            bail!("MUX rejected channel setup (message {:#06X})", status.msg_type);
        }
        self.state = SessionState::ChannelOpen;
        info!(channel = self.channel_id, "EMMG data channel established");
        Ok(())
    }

    /// Set up the data stream inside the channel.
    pub fn stream_setup(&mut self) -> Result<()> {
        if self.state != SessionState::ChannelOpen {
            bail!("EMMG data channel is not open");
        }
        let setup = TlvMessage::new(self.version, MSG_STREAM_SETUP)
            .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
            .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id))
            .with(TlvParameter::u16(PRM_DATA_STREAM_ID, self.stream_id))
            .with(TlvParameter::u16(PRM_DATA_ID, self.data_id))
            .with(TlvParameter::u16(PRM_DATA_TYPE, 0)); // EMM
        let status = self.exchange(&setup)?;
        if status.msg_type != MSG_STREAM_STATUS {
            bail!("MUX rejected stream setup (message {:#06X})", status.msg_type);
        }
        self.state = SessionState::StreamOpen;
        info!(stream = self.stream_id, "EMMG data stream established");
        Ok(())
    }

    /// Request bandwidth in kb/s; remembers what the MUX allocates.
    pub fn request_bandwidth(&mut self, kbps: u16) -> Result<u16> {
        if self.state != SessionState::StreamOpen {
            bail!("EMMG data stream is not open");
        }
        let request = TlvMessage::new(self.version, MSG_STREAM_BW_REQUEST)
            .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
            .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id))
            .with(TlvParameter::u16(PRM_DATA_STREAM_ID, self.stream_id))
            .with(TlvParameter::u16(PRM_BANDWIDTH, kbps));
        let response = self.exchange(&request)?;
        if response.msg_type != MSG_STREAM_BW_ALLOCATION {
            bail!("MUX rejected bandwidth request (message {:#06X})", response.msg_type);
        }
        let allocated = response
            .param(PRM_BANDWIDTH)
            .and_then(TlvParameter::as_u16)
            .unwrap_or(kbps);
        self.allocated_bandwidth = Some(allocated);
        debug!(requested = kbps, allocated, "bandwidth allocation");
        Ok(allocated)
    }

    /// Send one data_provision message carrying sections or TS packets.
    pub fn data_provision(&mut self, datagrams: &[Bytes]) -> Result<()> {
        if self.state != SessionState::StreamOpen {
            bail!("EMMG data stream is not open");
        }
        let mut msg = TlvMessage::new(self.version, MSG_DATA_PROVISION)
            .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
            .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id))
            .with(TlvParameter::u16(PRM_DATA_STREAM_ID, self.stream_id))
            .with(TlvParameter::u16(PRM_DATA_ID, self.data_id));
        for datagram in datagrams {
            msg.params.push(TlvParameter {
                tag: PRM_DATAGRAM,
                value: datagram.clone(),
            });
        }
        self.send(&msg)
    }

    /// Close the stream and the channel, then disconnect.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::StreamOpen {
            let request = TlvMessage::new(self.version, MSG_STREAM_CLOSE_REQUEST)
                .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
                .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id))
                .with(TlvParameter::u16(PRM_DATA_STREAM_ID, self.stream_id));
            let response = self.exchange(&request)?;
            if response.msg_type != MSG_STREAM_CLOSE_RESPONSE {
                bail!("MUX rejected stream close (message {:#06X})", response.msg_type);
            }
            self.state = SessionState::ChannelOpen;
        }
        if self.state == SessionState::ChannelOpen {
            let close = TlvMessage::new(self.version, MSG_CHANNEL_CLOSE)
                .with(TlvParameter::u32(PRM_CLIENT_ID, self.client_id))
                .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, self.channel_id));
            self.send(&close)?;
            self.state = SessionState::Disconnected;
        }
        self.stream = None;
        Ok(())
    }

    fn send(&mut self, msg: &TlvMessage) -> Result<()> {
        let stream = self.stream.as_mut().context("EMMG session not connected")?;
        stream.write_all(&msg.serialize())?;
        Ok(())
    }

    fn exchange(&mut self, msg: &TlvMessage) -> Result<TlvMessage> {
        self.send(msg)?;
        let stream = self.stream.as_mut().context("EMMG session not connected")?;
        let response = TlvMessage::read_from(stream)?;
        if response.msg_type == MSG_CHANNEL_ERROR || response.msg_type == MSG_STREAM_ERROR {
            let status = response
                .param(PRM_ERROR_STATUS)
                .and_then(TlvParameter::as_u16)
                .unwrap_or(0);
            bail!("MUX error response, status {status:#06X}");
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = TlvMessage::new(3, MSG_STREAM_SETUP)
            .with(TlvParameter::u32(PRM_CLIENT_ID, 0x12345678))
            .with(TlvParameter::u16(PRM_DATA_CHANNEL_ID, 7))
            .with(TlvParameter {
                tag: PRM_DATAGRAM,
                value: Bytes::from_static(&[1, 2, 3, 4, 5]),
            });
        let wire = msg.serialize();
        let parsed = TlvMessage::deserialize(&wire).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.param(PRM_CLIENT_ID).unwrap().as_u32(), Some(0x12345678));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = TlvMessage::new(2, MSG_CHANNEL_TEST).with(TlvParameter::u16(PRM_BANDWIDTH, 100));
        let wire = msg.serialize();
        assert!(TlvMessage::deserialize(&wire[..wire.len() - 1]).is_err());
        assert!(TlvMessage::deserialize(&wire[..3]).is_err());
    }

    #[test]
    fn test_session_state_guards() {
        let mut client = EmmgClient::new(3, 1, 1, 1, 1);
        // The stream cannot open before the channel.
        assert!(client.stream_setup().is_err());
        assert!(client.request_bandwidth(100).is_err());
        assert!(client.data_provision(&[]).is_err());
        // Closing a disconnected session is a no-op.
        assert!(client.close().is_ok());
    }

    #[test]
    fn test_client_server_session() {
        use std::net::TcpListener;
        use std::thread;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // A minimal MUX side: answer setup messages with status, bandwidth
        // with allocation, stream close with response.
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut provisions = 0;
            loop {
                let msg = match TlvMessage::read_from(&mut stream) {
                    Ok(m) => m,
                    Err(_) => break,
                };
                let reply_type = match msg.msg_type {
                    MSG_CHANNEL_SETUP => Some(MSG_CHANNEL_STATUS),
                    MSG_STREAM_SETUP => Some(MSG_STREAM_STATUS),
                    MSG_STREAM_BW_REQUEST => Some(MSG_STREAM_BW_ALLOCATION),
                    MSG_STREAM_CLOSE_REQUEST => Some(MSG_STREAM_CLOSE_RESPONSE),
                    MSG_DATA_PROVISION => {
                        provisions += msg.params.iter().filter(|p| p.tag == PRM_DATAGRAM).count();
                        None
                    }
                    MSG_CHANNEL_CLOSE => break,
                    _ => None,
                };
                if let Some(reply_type) = reply_type {
                    let mut reply = TlvMessage::new(msg.version, reply_type);
                    if reply_type == MSG_STREAM_BW_ALLOCATION {
                        reply = reply.with(TlvParameter::u16(PRM_BANDWIDTH, 80));
                    }
                    stream.write_all(&reply.serialize()).unwrap();
                }
            }
            provisions
        });

        let mut client = EmmgClient::new(3, 0xCAFE, 1, 2, 3);
        client.connect(addr, Duration::from_secs(5)).unwrap();
        client.stream_setup().unwrap();
        assert_eq!(client.request_bandwidth(100).unwrap(), 80);
        client
            .data_provision(&[Bytes::from_static(&[1, 2, 3]), Bytes::from_static(&[4, 5])])
            .unwrap();
        client.close().unwrap();

        assert_eq!(server.join().unwrap(), 2);
    }
}
