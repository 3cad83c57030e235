use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    error::{ErrorKind, QueryError},
    statement::Consistency,
};

use super::{Frame, FrameError, Opcode, flags, request::get_consistency, types::*};

/// Error codes of ERROR response bodies.
pub mod error_codes {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const BAD_CREDENTIALS: i32 = 0x0100;
    pub const UNAVAILABLE: i32 = 0x1000;
    pub const OVERLOADED: i32 = 0x1001;
    pub const IS_BOOTSTRAPPING: i32 = 0x1002;
    pub const TRUNCATE_ERROR: i32 = 0x1003;
    pub const WRITE_TIMEOUT: i32 = 0x1100;
    pub const READ_TIMEOUT: i32 = 0x1200;
    pub const READ_FAILURE: i32 = 0x1300;
    pub const FUNCTION_FAILURE: i32 = 0x1400;
    pub const WRITE_FAILURE: i32 = 0x1500;
    pub const SYNTAX_ERROR: i32 = 0x2000;
    pub const UNAUTHORIZED: i32 = 0x2100;
    pub const INVALID: i32 = 0x2200;
    pub const CONFIG_ERROR: i32 = 0x2300;
    pub const ALREADY_EXISTS: i32 = 0x2400;
    pub const UNPREPARED: i32 = 0x2500;
}

/// Kind of write a write timeout or write failure refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    /// Write to the distributed batch log, done before the batch itself is applied.
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    fn from_name(name: &str) -> Self {
        match name {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_string()),
        }
    }

    fn name(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(name) => name,
        }
    }
}

/// Code-specific payload of an ERROR response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorDetails {
    #[default]
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        data_present: bool,
    },
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        failures: i32,
        write_type: WriteType,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Bytes,
    },
}

/// An ERROR response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: i32,
    pub message: String,
    pub details: ErrorDetails,
}

impl ServerError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::None,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Classify the error code.
    pub fn kind(&self) -> ErrorKind {
        use error_codes::*;

        match self.code {
            PROTOCOL_ERROR => ErrorKind::ProtocolError,
            UNAVAILABLE => ErrorKind::Unavailable,
            OVERLOADED => ErrorKind::Overloaded,
            IS_BOOTSTRAPPING => ErrorKind::Bootstrapping,
            WRITE_TIMEOUT => ErrorKind::AmbiguousWrite,
            READ_TIMEOUT => ErrorKind::Timeout,
            READ_FAILURE => ErrorKind::ReadFailure,
            FUNCTION_FAILURE => ErrorKind::FunctionError,
            WRITE_FAILURE => ErrorKind::WriteFailure,
            BAD_CREDENTIALS | SYNTAX_ERROR | UNAUTHORIZED | INVALID | CONFIG_ERROR
            | ALREADY_EXISTS => ErrorKind::Invalid,
            UNPREPARED => ErrorKind::Unprepared,
            _ => ErrorKind::ServerError,
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        use error_codes::*;

        let code = get_i32(buf)?;
        let message = get_string(buf)?;
        let details = match code {
            UNAVAILABLE => ErrorDetails::Unavailable {
                consistency: get_consistency(buf)?,
                required: get_i32(buf)?,
                alive: get_i32(buf)?,
            },
            WRITE_TIMEOUT => ErrorDetails::WriteTimeout {
                consistency: get_consistency(buf)?,
                received: get_i32(buf)?,
                block_for: get_i32(buf)?,
                write_type: WriteType::from_name(&get_string(buf)?),
            },
            READ_TIMEOUT => ErrorDetails::ReadTimeout {
                consistency: get_consistency(buf)?,
                received: get_i32(buf)?,
                block_for: get_i32(buf)?,
                data_present: get_u8(buf)? != 0,
            },
            READ_FAILURE => ErrorDetails::ReadFailure {
                consistency: get_consistency(buf)?,
                received: get_i32(buf)?,
                block_for: get_i32(buf)?,
                failures: get_i32(buf)?,
                data_present: get_u8(buf)? != 0,
            },
            FUNCTION_FAILURE => ErrorDetails::FunctionFailure {
                keyspace: get_string(buf)?,
                function: get_string(buf)?,
                arg_types: get_string_list(buf)?,
            },
            WRITE_FAILURE => ErrorDetails::WriteFailure {
                consistency: get_consistency(buf)?,
                received: get_i32(buf)?,
                block_for: get_i32(buf)?,
                failures: get_i32(buf)?,
                write_type: WriteType::from_name(&get_string(buf)?),
            },
            ALREADY_EXISTS => ErrorDetails::AlreadyExists {
                keyspace: get_string(buf)?,
                table: get_string(buf)?,
            },
            UNPREPARED => ErrorDetails::Unprepared {
                id: get_short_bytes(buf)?,
            },
            _ => ErrorDetails::None,
        };
        Ok(Self {
            code,
            message,
            details,
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        dst.put_i32(self.code);
        put_string(dst, &self.message);
        match &self.details {
            ErrorDetails::None => {}
            ErrorDetails::Unavailable {
                consistency,
                required,
                alive,
            } => {
                dst.put_u16(consistency.code());
                dst.put_i32(*required);
                dst.put_i32(*alive);
            }
            ErrorDetails::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type,
            } => {
                dst.put_u16(consistency.code());
                dst.put_i32(*received);
                dst.put_i32(*block_for);
                put_string(dst, write_type.name());
            }
            ErrorDetails::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => {
                dst.put_u16(consistency.code());
                dst.put_i32(*received);
                dst.put_i32(*block_for);
                dst.put_u8(*data_present as u8);
            }
            ErrorDetails::ReadFailure {
                consistency,
                received,
                block_for,
                failures,
                data_present,
            } => {
                dst.put_u16(consistency.code());
                dst.put_i32(*received);
                dst.put_i32(*block_for);
                dst.put_i32(*failures);
                dst.put_u8(*data_present as u8);
            }
            ErrorDetails::FunctionFailure {
                keyspace,
                function,
                arg_types,
            } => {
                put_string(dst, keyspace);
                put_string(dst, function);
                put_string_list(dst, arg_types);
            }
            ErrorDetails::WriteFailure {
                consistency,
                received,
                block_for,
                failures,
                write_type,
            } => {
                dst.put_u16(consistency.code());
                dst.put_i32(*received);
                dst.put_i32(*block_for);
                dst.put_i32(*failures);
                put_string(dst, write_type.name());
            }
            ErrorDetails::AlreadyExists { keyspace, table } => {
                put_string(dst, keyspace);
                put_string(dst, table);
            }
            ErrorDetails::Unprepared { id } => put_short_bytes(dst, id),
        }
    }
}

impl From<ServerError> for QueryError {
    fn from(value: ServerError) -> Self {
        QueryError::new(value.kind(), value.message).with_details(value.details)
    }
}

mod result_kinds {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
    pub const PREPARED: i32 = 0x0004;
    pub const SCHEMA_CHANGE: i32 = 0x0005;
}

/// A RESULT response body. Row and metadata payloads are kept raw; decoding them
/// into application types belongs to a codec layer outside this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultBody {
    Void,
    Rows(Bytes),
    SetKeyspace(String),
    Prepared { id: Bytes, metadata: Bytes },
    SchemaChange(Bytes),
}

impl ResultBody {
    fn decode(buf: &mut Bytes) -> Result<Self, FrameError> {
        use result_kinds::*;

        Ok(match get_i32(buf)? {
            VOID => ResultBody::Void,
            ROWS => ResultBody::Rows(buf.split_off(0)),
            SET_KEYSPACE => ResultBody::SetKeyspace(get_string(buf)?),
            PREPARED => ResultBody::Prepared {
                id: get_short_bytes(buf)?,
                metadata: buf.split_off(0),
            },
            SCHEMA_CHANGE => ResultBody::SchemaChange(buf.split_off(0)),
            other => return Err(FrameError::Body(format!("unknown result kind {other}"))),
        })
    }

    fn encode(&self, dst: &mut BytesMut) {
        use result_kinds::*;

        match self {
            ResultBody::Void => dst.put_i32(VOID),
            ResultBody::Rows(rows) => {
                dst.put_i32(ROWS);
                dst.put_slice(rows);
            }
            ResultBody::SetKeyspace(keyspace) => {
                dst.put_i32(SET_KEYSPACE);
                put_string(dst, keyspace);
            }
            ResultBody::Prepared { id, metadata } => {
                dst.put_i32(PREPARED);
                put_short_bytes(dst, id);
                dst.put_slice(metadata);
            }
            ResultBody::SchemaChange(change) => {
                dst.put_i32(SCHEMA_CHANGE);
                dst.put_slice(change);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(ServerError),
    Ready,
    Authenticate { authenticator: String },
    Supported { options: BTreeMap<String, Vec<String>> },
    Result(ResultBody),
    Event(Bytes),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Error(_) => Opcode::Error,
            Response::Ready => Opcode::Ready,
            Response::Authenticate { .. } => Opcode::Authenticate,
            Response::Supported { .. } => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Event(_) => Opcode::Event,
        }
    }

    pub fn encode_body(&self, dst: &mut BytesMut) {
        match self {
            Response::Error(error) => error.encode(dst),
            Response::Ready => {}
            Response::Authenticate { authenticator } => put_string(dst, authenticator),
            Response::Supported { options } => put_string_multimap(dst, options),
            Response::Result(result) => result.encode(dst),
            Response::Event(event) => dst.put_slice(event),
        }
    }

    fn decode(opcode: Opcode, buf: &mut Bytes) -> Result<Self, FrameError> {
        Ok(match opcode {
            Opcode::Error => Response::Error(ServerError::decode(buf)?),
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate {
                authenticator: get_string(buf)?,
            },
            Opcode::Supported => Response::Supported {
                options: get_string_multimap(buf)?,
            },
            Opcode::Result => Response::Result(ResultBody::decode(buf)?),
            Opcode::Event => Response::Event(buf.split_off(0)),
            other => {
                return Err(FrameError::Body(format!(
                    "{other:?} is not a response opcode"
                )));
            }
        })
    }
}

/// A response together with the envelope fields carried ahead of its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub response: Response,
    pub tracing_id: Option<[u8; 16]>,
    pub warnings: Vec<String>,
}

impl ResponseMessage {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            tracing_id: None,
            warnings: Vec::new(),
        }
    }

    pub fn decode(frame: Frame) -> Result<Self, FrameError> {
        let flags = frame.header.flags;
        let mut buf = frame.body;

        let tracing_id = if flags & flags::TRACING != 0 {
            let raw = get_fixed::<16>(&mut buf)?;
            Some(raw)
        } else {
            None
        };
        let warnings = if flags & flags::WARNING != 0 {
            get_string_list(&mut buf)?
        } else {
            Vec::new()
        };
        if flags & flags::CUSTOM_PAYLOAD != 0 {
            skip_bytes_map(&mut buf)?;
        }

        Ok(Self {
            response: Response::decode(frame.header.opcode, &mut buf)?,
            tracing_id,
            warnings,
        })
    }

    /// Write the envelope and body, returning the header flags they require.
    pub fn encode(&self, dst: &mut BytesMut) -> u8 {
        let mut header_flags = 0;
        if let Some(id) = &self.tracing_id {
            header_flags |= flags::TRACING;
            dst.put_slice(id);
        }
        if !self.warnings.is_empty() {
            header_flags |= flags::WARNING;
            put_string_list(dst, &self.warnings);
        }
        self.response.encode_body(dst);
        header_flags
    }
}

fn get_fixed<const N: usize>(buf: &mut Bytes) -> Result<[u8; N], FrameError> {
    if buf.len() < N {
        return Err(FrameError::Body(format!(
            "truncated envelope: need {N} bytes, {} left",
            buf.len()
        )));
    }
    let mut out = [0; N];
    out.copy_from_slice(&buf.split_to(N));
    Ok(out)
}
