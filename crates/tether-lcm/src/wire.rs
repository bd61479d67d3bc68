//! Packed binary codec for LCM IPC messages
//!
//! Every message is a little-endian packed record: string fields are
//! fixed-length and NUL-padded, counters are `u32`, and variable-count
//! arrays (codelet descriptors, channels, linked maps) are
//! count-prefixed with a hard upper bound. A message travels over the
//! socket as a `u32` length prefix followed by the payload; one request
//! and one response per connection.

use crate::api::{
    CodeletDesc, CodeletsetLoadReq, CodeletsetUnloadReq, IoChannelDesc, LinkedMapDesc,
    CODELETSET_NAME_LEN, CODELET_NAME_LEN, HOOK_NAME_LEN, IO_CHANNEL_NAME_LEN,
    MAX_CODELETS_IN_CODELETSET, MAX_ERR_MSG_SIZE, MAX_IO_CHANNEL, MAX_LINKED_MAPS, MAP_NAME_LEN,
    PATH_LEN,
};
use crate::stream_id::{StreamId, STREAM_ID_LEN};
use std::io::{Read, Write};

/// Message type tag for a codeletset load request.
pub const MSG_TYPE_LOAD: u32 = 0;
/// Message type tag for a codeletset unload request.
pub const MSG_TYPE_UNLOAD: u32 = 1;

/// Response outcome: request applied.
pub const OUTCOME_SUCCESS: u32 = 0;
/// Response outcome: request rejected; the error field carries details.
pub const OUTCOME_FAIL: u32 = 1;

/// Upper bound on a framed message, comfortably above the largest
/// possible load request.
pub const MAX_MSG_SIZE: usize = 1 << 22;

/// Decode failures for LCM wire messages.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Message ended before a field could be read.
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// A count field exceeds its fixed bound.
    #[error("{field} count {got} exceeds maximum {max}")]
    BadCount {
        /// Name of the offending field.
        field: &'static str,
        /// Count found in the message.
        got: u32,
        /// Permitted maximum.
        max: usize,
    },

    /// A string field holds invalid UTF-8.
    #[error("{0} is not valid UTF-8")]
    InvalidUtf8(&'static str),

    /// The message type tag is unknown.
    #[error("unknown message type {0}")]
    UnknownMsgType(u32),

    /// The length prefix is zero or exceeds [`MAX_MSG_SIZE`].
    #[error("invalid message length {0}")]
    BadLength(usize),

    /// Socket-level failure while framing a message.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded request, either variant of the union body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Codeletset load request.
    Load(CodeletsetLoadReq),
    /// Codeletset unload request.
    Unload(CodeletsetUnloadReq),
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Write `s` into a fixed `len`-byte field, NUL-padded. Oversized
    /// strings are truncated to `len - 1` bytes; a trailing NUL is
    /// always present.
    fn put_fixed_str(&mut self, s: &str, len: usize) {
        let bytes = s.as_bytes();
        let n = bytes.len().min(len - 1);
        self.buf.extend_from_slice(&bytes[..n]);
        self.buf.resize(self.buf.len() + (len - n), 0);
    }
}

struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::Truncated(field));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn get_u8(&mut self, field: &'static str) -> Result<u8, WireError> {
        Ok(self.take(1, field)?[0])
    }

    fn get_u32(&mut self, field: &'static str) -> Result<u32, WireError> {
        let raw = self.take(4, field)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn get_u64(&mut self, field: &'static str) -> Result<u64, WireError> {
        let raw = self.take(8, field)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn get_fixed_str(&mut self, len: usize, field: &'static str) -> Result<String, WireError> {
        let raw = self.take(len, field)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..end])
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidUtf8(field))
    }
}

fn put_channel(w: &mut WireWriter, ch: &IoChannelDesc) {
    w.put_fixed_str(&ch.name, IO_CHANNEL_NAME_LEN);
    w.put_bytes(ch.stream_id.as_bytes());
    w.put_u8(ch.serde_path.is_some() as u8);
    w.put_fixed_str(ch.serde_path.as_deref().unwrap_or(""), PATH_LEN);
}

fn get_channel(r: &mut WireReader<'_>) -> Result<IoChannelDesc, WireError> {
    let name = r.get_fixed_str(IO_CHANNEL_NAME_LEN, "io_channel.name")?;
    let mut id = [0u8; STREAM_ID_LEN];
    id.copy_from_slice(r.take(STREAM_ID_LEN, "io_channel.stream_id")?);
    let has_serde = r.get_u8("io_channel.has_serde")? != 0;
    let serde_path = r.get_fixed_str(PATH_LEN, "io_channel.serde_path")?;
    Ok(IoChannelDesc {
        name,
        stream_id: StreamId::from_bytes(id),
        serde_path: has_serde.then_some(serde_path),
    })
}

fn put_channels(w: &mut WireWriter, channels: &[IoChannelDesc]) {
    w.put_u32(channels.len() as u32);
    for ch in channels {
        put_channel(w, ch);
    }
}

fn get_channels(
    r: &mut WireReader<'_>,
    field: &'static str,
) -> Result<Vec<IoChannelDesc>, WireError> {
    let n = r.get_u32(field)?;
    if n as usize > MAX_IO_CHANNEL {
        return Err(WireError::BadCount {
            field,
            got: n,
            max: MAX_IO_CHANNEL,
        });
    }
    (0..n).map(|_| get_channel(r)).collect()
}

fn put_descriptor(w: &mut WireWriter, desc: &CodeletDesc) {
    w.put_fixed_str(&desc.codelet_name, CODELET_NAME_LEN);
    w.put_fixed_str(&desc.hook_name, HOOK_NAME_LEN);
    w.put_fixed_str(&desc.codelet_path, PATH_LEN);
    w.put_u32(desc.priority);
    w.put_u64(desc.runtime_threshold);
    put_channels(w, &desc.in_io_channels);
    put_channels(w, &desc.out_io_channels);
    w.put_u32(desc.linked_maps.len() as u32);
    for lm in &desc.linked_maps {
        w.put_fixed_str(&lm.map_name, MAP_NAME_LEN);
        w.put_fixed_str(&lm.linked_codelet_name, CODELET_NAME_LEN);
        w.put_fixed_str(&lm.linked_map_name, MAP_NAME_LEN);
    }
}

fn get_descriptor(r: &mut WireReader<'_>) -> Result<CodeletDesc, WireError> {
    let codelet_name = r.get_fixed_str(CODELET_NAME_LEN, "codelet_name")?;
    let hook_name = r.get_fixed_str(HOOK_NAME_LEN, "hook_name")?;
    let codelet_path = r.get_fixed_str(PATH_LEN, "codelet_path")?;
    let priority = r.get_u32("priority")?;
    let runtime_threshold = r.get_u64("runtime_threshold")?;
    let in_io_channels = get_channels(r, "num_in_io_channel")?;
    let out_io_channels = get_channels(r, "num_out_io_channel")?;
    let num_linked = r.get_u32("num_linked_maps")?;
    if num_linked as usize > MAX_LINKED_MAPS {
        return Err(WireError::BadCount {
            field: "num_linked_maps",
            got: num_linked,
            max: MAX_LINKED_MAPS,
        });
    }
    let mut linked_maps = Vec::with_capacity(num_linked as usize);
    for _ in 0..num_linked {
        linked_maps.push(LinkedMapDesc {
            map_name: r.get_fixed_str(MAP_NAME_LEN, "linked_maps.map_name")?,
            linked_codelet_name: r
                .get_fixed_str(CODELET_NAME_LEN, "linked_maps.linked_codelet_name")?,
            linked_map_name: r.get_fixed_str(MAP_NAME_LEN, "linked_maps.linked_map_name")?,
        });
    }
    Ok(CodeletDesc {
        codelet_name,
        hook_name,
        codelet_path,
        priority,
        runtime_threshold,
        in_io_channels,
        out_io_channels,
        linked_maps,
    })
}

/// Encode a load request into a request message.
pub fn encode_load_req(req: &CodeletsetLoadReq) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(MSG_TYPE_LOAD);
    w.put_fixed_str(&req.codeletset_id, CODELETSET_NAME_LEN);
    w.put_u32(req.codelets.len() as u32);
    for desc in &req.codelets {
        put_descriptor(&mut w, desc);
    }
    w.buf
}

/// Encode an unload request into a request message.
pub fn encode_unload_req(req: &CodeletsetUnloadReq) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(MSG_TYPE_UNLOAD);
    w.put_fixed_str(&req.codeletset_id, CODELETSET_NAME_LEN);
    w.buf
}

/// Decode a request message of either type.
pub fn decode_request(buf: &[u8]) -> Result<Request, WireError> {
    let mut r = WireReader::new(buf);
    let msg_type = r.get_u32("msg_type")?;
    match msg_type {
        MSG_TYPE_LOAD => {
            let codeletset_id = r.get_fixed_str(CODELETSET_NAME_LEN, "codeletset_id")?;
            let n = r.get_u32("num_codelet_descriptors")?;
            if n as usize > MAX_CODELETS_IN_CODELETSET {
                return Err(WireError::BadCount {
                    field: "num_codelet_descriptors",
                    got: n,
                    max: MAX_CODELETS_IN_CODELETSET,
                });
            }
            let codelets = (0..n)
                .map(|_| get_descriptor(&mut r))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Request::Load(CodeletsetLoadReq {
                codeletset_id,
                codelets,
            }))
        }
        MSG_TYPE_UNLOAD => {
            let codeletset_id = r.get_fixed_str(CODELETSET_NAME_LEN, "codeletset_id")?;
            Ok(Request::Unload(CodeletsetUnloadReq { codeletset_id }))
        }
        other => Err(WireError::UnknownMsgType(other)),
    }
}

/// Encode a response. Error messages longer than 1023 bytes are
/// silently truncated; the field always ends in NUL.
pub fn encode_response(outcome: u32, err_msg: &str) -> Vec<u8> {
    let mut w = WireWriter::new();
    w.put_u32(outcome);
    w.put_fixed_str(err_msg, MAX_ERR_MSG_SIZE);
    w.buf
}

/// Decode a response into `(success, message)`.
pub fn decode_response(buf: &[u8]) -> Result<(bool, String), WireError> {
    let mut r = WireReader::new(buf);
    let outcome = r.get_u32("outcome")?;
    let msg = r.get_fixed_str(MAX_ERR_MSG_SIZE, "err_msg")?;
    Ok((outcome == OUTCOME_SUCCESS, msg))
}

/// Write one length-prefixed message to a stream.
pub fn write_message(stream: &mut impl Write, payload: &[u8]) -> Result<(), WireError> {
    if payload.is_empty() || payload.len() > MAX_MSG_SIZE {
        return Err(WireError::BadLength(payload.len()));
    }
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one length-prefixed message from a stream.
pub fn read_message(stream: &mut impl Read) -> Result<Vec<u8>, WireError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MSG_SIZE {
        return Err(WireError::BadLength(len));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}
