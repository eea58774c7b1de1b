//! Mux frame codec.
//!
//! Every frame starts with a metadata block prefixed by its own length, and is
//! optionally followed by a length-prefixed payload. All integers are
//! big-endian.
//!
//! ```text
//! u16 metaLen | u16 sessionID | u8 status | u8 options
//!             | [New only]    u8 network | address bytes ...
//! [HasData]   u16 payloadLen | payload ...
//! ```

use std::fmt;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::mux::buf::Buffer;

/// Session identifier carried by every frame.
pub type SessionId = u16;

/// Minimum metadata length: session id, status, options.
pub const META_LEN_MIN: usize = 4;

/// Minimum metadata length of a New frame (network byte plus a 3-byte address).
pub const META_LEN_MIN_NEW: usize = 8;

/// Maximum metadata length accepted on decode.
pub const META_LEN_MAX: usize = 512;

/// Maximum payload length accepted on decode.
pub const PAYLOAD_LEN_MAX: usize = 64 * 1024 * 1024;

/// Largest payload a single frame can carry on the wire.
pub const MAX_CHUNK: usize = u16::MAX as usize;

/// Lifecycle status of the session a frame belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// First frame of a session, carries the destination
    New = 0x01,
    /// Data for an established session
    Keep = 0x02,
    /// Session teardown
    End = 0x03,
    /// Liveness no-op, not tied to a session
    KeepAlive = 0x04,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::New),
            0x02 => Ok(Self::Keep),
            0x03 => Ok(Self::End),
            0x04 => Ok(Self::KeepAlive),
            _ => Err(Error::invalid_frame(format!("unknown session status: 0x{:02x}", v))),
        }
    }
}

/// Frame option bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct FrameOption(u8);

impl FrameOption {
    /// No options
    pub const NONE: FrameOption = FrameOption(0x00);
    /// A length-prefixed payload follows the metadata
    pub const DATA: FrameOption = FrameOption(0x01);
    /// The session ended abnormally
    pub const ERROR: FrameOption = FrameOption(0x02);

    /// Build from the raw wire byte.
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw wire byte.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every bit of `other` is set.
    pub fn has(self, other: FrameOption) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: FrameOption) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for FrameOption {
    type Output = FrameOption;

    fn bitor(self, rhs: FrameOption) -> FrameOption {
        FrameOption(self.0 | rhs.0)
    }
}

/// Network kind of a destination or session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetNetwork {
    /// Not carried by the frame (anything but New)
    #[default]
    Unknown = 0x00,
    /// Stream flow
    Tcp = 0x01,
    /// Datagram flow
    Udp = 0x02,
}

impl TargetNetwork {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            0x01 => Ok(Self::Tcp),
            0x02 => Ok(Self::Udp),
            _ => Err(Error::invalid_frame(format!("unknown target network: 0x{:02x}", v))),
        }
    }
}

impl fmt::Display for TargetNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetNetwork::Unknown => f.write_str("unknown"),
            TargetNetwork::Tcp => f.write_str("tcp"),
            TargetNetwork::Udp => f.write_str("udp"),
        }
    }
}

/// Where a New frame asks the peer to connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Transport protocol
    pub network: TargetNetwork,
    /// `host:port`
    pub address: String,
}

impl Destination {
    /// TCP destination.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network: TargetNetwork::Tcp,
            address: address.into(),
        }
    }

    /// UDP destination.
    pub fn udp(address: impl Into<String>) -> Self {
        Self {
            network: TargetNetwork::Udp,
            address: address.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.address)
    }
}

/// Frame metadata block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Session the frame belongs to
    pub session_id: SessionId,
    /// Session status
    pub status: SessionStatus,
    /// Option bits
    pub option: FrameOption,
    /// Destination, present only when `status` is New
    pub target: Option<Destination>,
}

impl FrameMetadata {
    /// Metadata for a New frame.
    pub fn new_session(session_id: SessionId, target: Destination) -> Self {
        Self {
            session_id,
            status: SessionStatus::New,
            option: FrameOption::NONE,
            target: Some(target),
        }
    }

    /// Metadata for a Keep frame.
    pub fn keep(session_id: SessionId) -> Self {
        Self::bare(session_id, SessionStatus::Keep)
    }

    /// Metadata for an End frame, with the Error option if `error` is set.
    pub fn end(session_id: SessionId, error: bool) -> Self {
        let mut meta = Self::bare(session_id, SessionStatus::End);
        if error {
            meta.option = FrameOption::ERROR;
        }
        meta
    }

    /// Metadata for a KeepAlive frame.
    pub fn keep_alive() -> Self {
        Self::bare(0, SessionStatus::KeepAlive)
    }

    fn bare(session_id: SessionId, status: SessionStatus) -> Self {
        Self {
            session_id,
            status,
            option: FrameOption::NONE,
            target: None,
        }
    }

    /// Whether a payload follows the metadata.
    pub fn has_data(&self) -> bool {
        self.option.has(FrameOption::DATA)
    }

    /// Whether the Error option is set.
    pub fn has_error(&self) -> bool {
        self.option.has(FrameOption::ERROR)
    }

    /// Append the length-prefixed metadata block to `buf`.
    pub fn write_to(&self, buf: &mut Buffer) -> Result<()> {
        let len_at = buf.len();
        buf.extend(2);
        let start = buf.len();

        buf.put_u16(self.session_id);
        buf.put_u8(self.status as u8);
        buf.put_u8(self.option.bits());

        if self.status == SessionStatus::New {
            let target = self
                .target
                .as_ref()
                .ok_or_else(|| Error::invalid_frame("new frame without target"))?;
            if target.network == TargetNetwork::Unknown {
                return Err(Error::invalid_frame("new frame with unknown network"));
            }
            buf.put_u8(target.network as u8);
            buf.extend_from_slice(target.address.as_bytes());
        }

        let meta_len = buf.len() - start;
        if meta_len > META_LEN_MAX {
            return Err(Error::FrameTooLarge {
                field: "metaLen",
                len: meta_len,
                max: META_LEN_MAX,
            });
        }

        buf.bytes_mut()[len_at..start].copy_from_slice(&(meta_len as u16).to_be_bytes());
        Ok(())
    }

    /// Decode a metadata block (without its length prefix).
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() < META_LEN_MIN {
            return Err(Error::invalid_frame(format!(
                "metadata too short: {} bytes",
                block.len()
            )));
        }

        let session_id = u16::from_be_bytes([block[0], block[1]]);
        let status = SessionStatus::from_u8(block[2])?;
        let option = FrameOption::from_bits(block[3]);

        let target = if status == SessionStatus::New {
            if block.len() < META_LEN_MIN_NEW {
                return Err(Error::invalid_frame(format!(
                    "new frame metadata too short: {} bytes",
                    block.len()
                )));
            }
            let network = TargetNetwork::from_u8(block[4])?;
            let address = std::str::from_utf8(&block[5..])
                .map_err(|_| Error::invalid_frame("target address is not utf-8"))?;
            Some(Destination {
                network,
                address: address.to_owned(),
            })
        } else {
            None
        };

        Ok(Self {
            session_id,
            status,
            option,
            target,
        })
    }

    /// Read the next metadata block from a transport.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut len = [0u8; 2];
        let n = reader.read(&mut len).await.map_err(Error::Transport)?;
        if n == 0 {
            return Ok(None);
        }
        if n == 1 {
            reader
                .read_exact(&mut len[1..])
                .await
                .map_err(Error::from_frame_read)?;
        }

        let meta_len = u16::from_be_bytes(len) as usize;
        if meta_len > META_LEN_MAX {
            return Err(Error::FrameTooLarge {
                field: "metaLen",
                len: meta_len,
                max: META_LEN_MAX,
            });
        }
        if meta_len < META_LEN_MIN {
            return Err(Error::invalid_frame(format!("metaLen too small: {}", meta_len)));
        }

        let mut block = [0u8; META_LEN_MAX];
        reader
            .read_exact(&mut block[..meta_len])
            .await
            .map_err(Error::from_frame_read)?;

        Self::decode(&block[..meta_len]).map(Some)
    }
}

/// Read the length-prefixed payload that follows a HasData metadata block.
pub async fn read_payload<R>(reader: &mut R, buf: &mut Buffer) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_payload_len(reader).await?;
    buf.clear();
    buf.read_full_from(reader, len)
        .await
        .map_err(Error::from_frame_read)
}

/// Skip the payload of a HasData frame, keeping the stream aligned.
pub async fn discard_payload<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_payload_len(reader).await?;
    let copied = tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink())
        .await
        .map_err(Error::Transport)?;
    if copied < len as u64 {
        return Err(Error::invalid_frame("truncated payload"));
    }
    Ok(len)
}

async fn read_payload_len<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u16().await.map_err(Error::from_frame_read)? as usize;
    if len > PAYLOAD_LEN_MAX {
        return Err(Error::FrameTooLarge {
            field: "payloadLen",
            len,
            max: PAYLOAD_LEN_MAX,
        });
    }
    Ok(len)
}

/// Append the payload length prefix for `payload` to `buf`.
pub fn write_payload_len(buf: &mut Buffer, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_CHUNK {
        return Err(Error::FrameTooLarge {
            field: "payloadLen",
            len: payload.len(),
            max: MAX_CHUNK,
        });
    }
    buf.put_u16(payload.len() as u16);
    Ok(())
}

/// A complete frame: metadata plus optional payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Metadata block
    pub meta: FrameMetadata,
    /// Payload, present exactly when the Data option is set
    pub payload: Option<Bytes>,
}

impl Frame {
    /// Frame without payload.
    pub fn new(meta: FrameMetadata) -> Self {
        Self {
            meta,
            payload: None,
        }
    }

    /// Frame carrying `payload`; sets the Data option.
    pub fn with_payload(mut meta: FrameMetadata, payload: impl Into<Bytes>) -> Self {
        meta.option.insert(FrameOption::DATA);
        Self {
            meta,
            payload: Some(payload.into()),
        }
    }

    /// Encode the frame into bytes for transmission.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Buffer::new();
        self.meta.write_to(&mut buf)?;
        if self.meta.has_data() {
            let payload = self.payload.as_deref().unwrap_or_default();
            write_payload_len(&mut buf, payload)?;
            buf.extend_from_slice(payload);
        }
        Ok(buf.bytes().to_vec())
    }

    /// Read one whole frame from a transport.
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<Self>>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let Some(meta) = FrameMetadata::read_from(reader).await? else {
            return Ok(None);
        };
        let payload = if meta.has_data() {
            let mut buf = Buffer::new();
            read_payload(reader, &mut buf).await?;
            Some(Bytes::copy_from_slice(buf.bytes()))
        } else {
            None
        };
        Ok(Some(Self { meta, payload }))
    }
}
