//! ZooKeeper Wire Protocol
//!
//! Jute encoding for the requests and replies the client speaks. Framing
//! (a 4 byte big-endian length prefix) is left to the codec; everything here
//! works on a single frame body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coordination::{Acl, CreateMode, EventType, SessionState, Stat};
use crate::error::{Error, Result};

/// Protocol version sent in the handshake
pub const PROTOCOL_VERSION: i32 = 0;

/// Reply xid marking a watch notification
pub const WATCHER_EVENT_XID: i32 = -1;

/// Reply xid of a ping
pub const PING_XID: i32 = -2;

/// Reply xid of the watch re-registration sent after a reconnect
pub const SET_WATCHES_XID: i32 = -8;

/// Error code for a missing node
pub const NO_NODE: i32 = -101;

/// Length of the session password
pub const PASSWORD_LEN: usize = 16;

/// Request operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Create,
    Delete,
    Exists,
    SetData,
    GetChildren,
    Ping,
    SetWatches,
    CloseSession,
}

impl OpCode {
    pub fn code(&self) -> i32 {
        match self {
            OpCode::Create => 1,
            OpCode::Delete => 2,
            OpCode::Exists => 3,
            OpCode::SetData => 5,
            OpCode::GetChildren => 8,
            OpCode::Ping => 11,
            OpCode::SetWatches => 101,
            OpCode::CloseSession => -11,
        }
    }
}

/// Handshake sent on a fresh connection
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: [u8; PASSWORD_LEN],
    pub read_only: bool,
}

impl ConnectRequest {
    /// Request a brand new session
    pub fn new(timeout_ms: i32) -> Self {
        Self {
            last_zxid_seen: 0,
            timeout_ms,
            session_id: 0,
            passwd: [0u8; PASSWORD_LEN],
            read_only: false,
        }
    }

    /// Reattach to an existing session after losing its connection
    pub fn resume(timeout_ms: i32, session_id: i64, passwd: &[u8], last_zxid_seen: i64) -> Self {
        let mut request = Self::new(timeout_ms);
        request.session_id = session_id;
        request.last_zxid_seen = last_zxid_seen;
        let len = passwd.len().min(PASSWORD_LEN);
        request.passwd[..len].copy_from_slice(&passwd[..len]);
        request
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_i64(self.last_zxid_seen);
        buf.put_i32(self.timeout_ms);
        buf.put_i64(self.session_id);
        put_buffer(buf, Some(&self.passwd));
        buf.put_u8(self.read_only as u8);
    }
}

/// Handshake reply
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    /// Negotiated timeout; zero or less means the session is gone
    pub timeout_ms: i32,
    pub session_id: i64,
    pub passwd: Vec<u8>,
    pub read_only: bool,
}

impl ConnectResponse {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let protocol_version = get_i32(buf)?;
        let timeout_ms = get_i32(buf)?;
        let session_id = get_i64(buf)?;
        let passwd = get_buffer(buf)?.unwrap_or_default();
        // Servers older than 3.4 omit the flag
        let read_only = buf.has_remaining() && buf.get_u8() != 0;
        Ok(Self {
            protocol_version,
            timeout_ms,
            session_id,
            passwd,
            read_only,
        })
    }

    #[cfg(test)]
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.protocol_version);
        buf.put_i32(self.timeout_ms);
        buf.put_i64(self.session_id);
        put_buffer(buf, Some(&self.passwd));
        buf.put_u8(self.read_only as u8);
    }
}

/// Requests the client can issue
#[derive(Debug, Clone)]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        acl: Vec<Acl>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: Option<i32>,
    },
    Exists {
        path: String,
        watch: bool,
    },
    GetChildren {
        path: String,
        watch: bool,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: Option<i32>,
    },
    Ping,
    /// Re-register client watches with a server after a reconnect
    SetWatches {
        relative_zxid: i64,
        data: Vec<String>,
        exist: Vec<String>,
        child: Vec<String>,
    },
    CloseSession,
}

impl Request {
    pub fn op_code(&self) -> OpCode {
        match self {
            Request::Create { .. } => OpCode::Create,
            Request::Delete { .. } => OpCode::Delete,
            Request::Exists { .. } => OpCode::Exists,
            Request::GetChildren { .. } => OpCode::GetChildren,
            Request::SetData { .. } => OpCode::SetData,
            Request::Ping => OpCode::Ping,
            Request::SetWatches { .. } => OpCode::SetWatches,
            Request::CloseSession => OpCode::CloseSession,
        }
    }

    /// Path the request targets, empty for session requests
    pub fn path(&self) -> &str {
        match self {
            Request::Create { path, .. }
            | Request::Delete { path, .. }
            | Request::Exists { path, .. }
            | Request::GetChildren { path, .. }
            | Request::SetData { path, .. } => path,
            Request::Ping | Request::SetWatches { .. } | Request::CloseSession => "",
        }
    }

    /// Encode header and body
    pub fn encode(&self, xid: i32, buf: &mut BytesMut) {
        buf.put_i32(xid);
        buf.put_i32(self.op_code().code());

        match self {
            Request::Create {
                path,
                data,
                acl,
                mode,
            } => {
                put_string(buf, path);
                put_buffer(buf, Some(data));
                buf.put_i32(acl.len() as i32);
                for entry in acl {
                    buf.put_i32(entry.perms);
                    put_string(buf, &entry.scheme);
                    put_string(buf, &entry.id);
                }
                buf.put_i32(mode.flags());
            }
            Request::Delete { path, version } => {
                put_string(buf, path);
                buf.put_i32(version.unwrap_or(-1));
            }
            Request::Exists { path, watch } | Request::GetChildren { path, watch } => {
                put_string(buf, path);
                buf.put_u8(*watch as u8);
            }
            Request::SetData {
                path,
                data,
                version,
            } => {
                put_string(buf, path);
                put_buffer(buf, Some(data));
                buf.put_i32(version.unwrap_or(-1));
            }
            Request::SetWatches {
                relative_zxid,
                data,
                exist,
                child,
            } => {
                buf.put_i64(*relative_zxid);
                for paths in [data, exist, child] {
                    buf.put_i32(paths.len() as i32);
                    for path in paths {
                        put_string(buf, path);
                    }
                }
            }
            Request::Ping | Request::CloseSession => {}
        }
    }
}

/// Header preceding every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub const SIZE: usize = 16;

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        need(buf, Self::SIZE)?;
        Ok(Self {
            xid: get_i32(buf)?,
            zxid: get_i64(buf)?,
            err: get_i32(buf)?,
        })
    }

    #[cfg(test)]
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.xid);
        buf.put_i64(self.zxid);
        buf.put_i32(self.err);
    }
}

/// Body of a watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub event_type: EventType,
    pub state: SessionState,
    pub path: String,
}

impl WatcherEvent {
    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let type_code = get_i32(buf)?;
        let state_code = get_i32(buf)?;
        let path = get_string(buf)?.unwrap_or_default();

        let event_type = EventType::from_code(type_code)
            .ok_or_else(|| Error::Protocol(format!("unknown event type {}", type_code)))?;
        let state = SessionState::from_code(state_code)
            .ok_or_else(|| Error::Protocol(format!("unknown session state {}", state_code)))?;

        Ok(Self {
            event_type,
            state,
            path,
        })
    }
}

/// Decode a node Stat
pub fn decode_stat(buf: &mut Bytes) -> Result<Stat> {
    Ok(Stat {
        czxid: get_i64(buf)?,
        mzxid: get_i64(buf)?,
        ctime: get_i64(buf)?,
        mtime: get_i64(buf)?,
        version: get_i32(buf)?,
        cversion: get_i32(buf)?,
        aversion: get_i32(buf)?,
        ephemeral_owner: get_i64(buf)?,
        data_length: get_i32(buf)?,
        num_children: get_i32(buf)?,
        pzxid: get_i64(buf)?,
    })
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

pub fn put_buffer(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(data) => {
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
}

fn need(buf: &Bytes, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(Error::Protocol(format!(
            "truncated frame: need {} bytes, have {}",
            len,
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_i64(buf: &mut Bytes) -> Result<i64> {
    need(buf, 8)?;
    Ok(buf.get_i64())
}

/// Length-prefixed bytes; a negative length encodes null
pub fn get_buffer(buf: &mut Bytes) -> Result<Option<Vec<u8>>> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    need(buf, len as usize)?;
    Ok(Some(buf.split_to(len as usize).to_vec()))
}

pub fn get_string(buf: &mut Bytes) -> Result<Option<String>> {
    match get_buffer(buf)? {
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("invalid UTF-8 in string: {}", e))),
        None => Ok(None),
    }
}

pub fn get_string_vec(buf: &mut Bytes) -> Result<Vec<String>> {
    let count = get_i32(buf)?;
    if count < 0 {
        return Ok(Vec::new());
    }
    let mut items = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        items.push(get_string(buf)?.unwrap_or_default());
    }
    Ok(items)
}
