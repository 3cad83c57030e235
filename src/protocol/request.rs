use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::statement::Consistency;

use super::{FrameError, Opcode, types::*};

mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const TIMESTAMP: u8 = 0x20;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Logged,
    Unlogged,
    Counter,
}

impl From<BatchKind> for u8 {
    fn from(value: BatchKind) -> Self {
        match value {
            BatchKind::Logged => 0,
            BatchKind::Unlogged => 1,
            BatchKind::Counter => 2,
        }
    }
}

impl TryFrom<u8> for BatchKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(BatchKind::Logged),
            1 => Ok(BatchKind::Unlogged),
            2 => Ok(BatchKind::Counter),
            other => Err(FrameError::Body(format!("unknown batch type {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParameters {
    pub consistency: Consistency,
    pub values: Vec<Option<Bytes>>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
}

impl QueryParameters {
    fn encode(&self, dst: &mut BytesMut) {
        dst.put_u16(self.consistency.code());
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= query_flags::VALUES;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= query_flags::TIMESTAMP;
        }
        dst.put_u8(flags);

        if !self.values.is_empty() {
            put_values(dst, &self.values);
        }
        if let Some(page_size) = self.page_size {
            dst.put_i32(page_size);
        }
        if let Some(state) = &self.paging_state {
            put_bytes(dst, Some(&state[..]));
        }
        if let Some(serial) = self.serial_consistency {
            dst.put_u16(serial.code());
        }
        if let Some(timestamp) = self.timestamp {
            dst.put_i64(timestamp);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        let consistency = get_consistency(buf)?;
        let flags = get_u8(buf)?;
        let values = if flags & query_flags::VALUES != 0 {
            get_values(buf)?
        } else {
            Vec::new()
        };
        let page_size = if flags & query_flags::PAGE_SIZE != 0 {
            Some(get_i32(buf)?)
        } else {
            None
        };
        let paging_state = if flags & query_flags::PAGING_STATE != 0 {
            get_bytes(buf)?
        } else {
            None
        };
        let serial_consistency = if flags & query_flags::SERIAL_CONSISTENCY != 0 {
            Some(get_consistency(buf)?)
        } else {
            None
        };
        let timestamp = if flags & query_flags::TIMESTAMP != 0 {
            Some(get_i64(buf)?)
        } else {
            None
        };
        Ok(Self {
            consistency,
            values,
            page_size,
            paging_state,
            serial_consistency,
            timestamp,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchEntry {
    Query {
        query: String,
        values: Vec<Option<Bytes>>,
    },
    Prepared {
        id: Bytes,
        values: Vec<Option<Bytes>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRequest {
    pub kind: BatchKind,
    pub entries: Vec<BatchEntry>,
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Startup { options: BTreeMap<String, String> },
    Options,
    Query { query: String, params: QueryParameters },
    Prepare { query: String },
    Execute { id: Bytes, params: QueryParameters },
    Batch(BatchRequest),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup { .. } => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch(_) => Opcode::Batch,
        }
    }

    pub fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Request::Startup { options } => put_string_map(dst, options),
            Request::Options => {}
            Request::Query { query, params } => {
                put_long_string(dst, query);
                params.encode(dst);
            }
            Request::Prepare { query } => put_long_string(dst, query),
            Request::Execute { id, params } => {
                put_short_bytes(dst, id);
                params.encode(dst);
            }
            Request::Batch(batch) => {
                dst.put_u8(batch.kind.into());
                dst.put_u16(batch.entries.len() as u16);
                for entry in &batch.entries {
                    match entry {
                        BatchEntry::Query { query, values } => {
                            dst.put_u8(0);
                            put_long_string(dst, query);
                            put_values(dst, values);
                        }
                        BatchEntry::Prepared { id, values } => {
                            dst.put_u8(1);
                            put_short_bytes(dst, id);
                            put_values(dst, values);
                        }
                    }
                }
                dst.put_u16(batch.consistency.code());
                let mut flags = 0;
                if batch.serial_consistency.is_some() {
                    flags |= query_flags::SERIAL_CONSISTENCY;
                }
                if batch.timestamp.is_some() {
                    flags |= query_flags::TIMESTAMP;
                }
                dst.put_u8(flags);
                if let Some(serial) = batch.serial_consistency {
                    dst.put_u16(serial.code());
                }
                if let Some(timestamp) = batch.timestamp {
                    dst.put_i64(timestamp);
                }
            }
        }
    }

    /// Parse a request body; the node side of the protocol.
    pub fn decode(opcode: Opcode, mut body: Bytes) -> Result<Self, FrameError> {
        let buf = &mut body;
        Ok(match opcode {
            Opcode::Startup => Request::Startup {
                options: get_string_map(buf)?,
            },
            Opcode::Options => Request::Options,
            Opcode::Query => Request::Query {
                query: get_long_string(buf)?,
                params: QueryParameters::decode(buf)?,
            },
            Opcode::Prepare => Request::Prepare {
                query: get_long_string(buf)?,
            },
            Opcode::Execute => Request::Execute {
                id: get_short_bytes(buf)?,
                params: QueryParameters::decode(buf)?,
            },
            Opcode::Batch => {
                let kind = get_u8(buf)?.try_into()?;
                let n = get_u16(buf)?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let entry = match get_u8(buf)? {
                        0 => BatchEntry::Query {
                            query: get_long_string(buf)?,
                            values: get_values(buf)?,
                        },
                        1 => BatchEntry::Prepared {
                            id: get_short_bytes(buf)?,
                            values: get_values(buf)?,
                        },
                        other => {
                            return Err(FrameError::Body(format!(
                                "unknown batch entry kind {other}"
                            )));
                        }
                    };
                    entries.push(entry);
                }
                let consistency = get_consistency(buf)?;
                let flags = get_u8(buf)?;
                let serial_consistency = if flags & query_flags::SERIAL_CONSISTENCY != 0 {
                    Some(get_consistency(buf)?)
                } else {
                    None
                };
                let timestamp = if flags & query_flags::TIMESTAMP != 0 {
                    Some(get_i64(buf)?)
                } else {
                    None
                };
                Request::Batch(BatchRequest {
                    kind,
                    entries,
                    consistency,
                    serial_consistency,
                    timestamp,
                })
            }
            other => {
                return Err(FrameError::Body(format!(
                    "{other:?} is not a request opcode"
                )));
            }
        })
    }
}

pub(crate) fn get_consistency(buf: &mut Bytes) -> Result<Consistency, FrameError> {
    let code = get_u16(buf)?;
    Consistency::from_code(code)
        .ok_or_else(|| FrameError::Body(format!("unknown consistency {code:#06x}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> QueryParameters {
        QueryParameters {
            consistency: Consistency::Quorum,
            values: Vec::new(),
            page_size: None,
            paging_state: None,
            serial_consistency: None,
            timestamp: None,
        }
    }

    #[test]
    fn query_body_layout() {
        let request = Request::Query {
            query: "select".into(),
            params: params(),
        };
        let mut dst = BytesMut::new();
        request.encode_body(&mut dst);

        assert_eq!(
            &dst[..],
            b"\x00\x00\x00\x06select\x00\x04\x00".as_slice()
        );
    }

    #[test]
    fn execute_with_values_and_paging() {
        let request = Request::Execute {
            id: Bytes::from_static(b"\xca\xfe"),
            params: QueryParameters {
                values: vec![Some(Bytes::from_static(b"\x00\x00\x00\x01")), None],
                page_size: Some(5000),
                serial_consistency: Some(Consistency::LocalSerial),
                timestamp: Some(1_700_000_000_000_000),
                ..params()
            },
        };
        let mut dst = BytesMut::new();
        request.encode_body(&mut dst);

        assert_eq!(Request::decode(Opcode::Execute, dst.freeze()).unwrap(), request);
    }

    #[test]
    fn batch_body_decodes_on_the_node_side() {
        let request = Request::Batch(BatchRequest {
            kind: BatchKind::Unlogged,
            entries: vec![
                BatchEntry::Query {
                    query: "insert a".into(),
                    values: Vec::new(),
                },
                BatchEntry::Prepared {
                    id: Bytes::from_static(b"\x01"),
                    values: vec![None],
                },
            ],
            consistency: Consistency::One,
            serial_consistency: None,
            timestamp: Some(7),
        });
        let mut dst = BytesMut::new();
        request.encode_body(&mut dst);

        assert_eq!(Request::decode(Opcode::Batch, dst.freeze()).unwrap(), request);
    }

    #[test]
    fn response_opcodes_are_not_requests() {
        assert!(matches!(
            Request::decode(Opcode::Ready, Bytes::new()),
            Err(FrameError::Body(_))
        ));
    }
}
