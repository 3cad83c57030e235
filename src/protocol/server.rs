use std::{
    collections::{BTreeMap, HashMap, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};

use super::{
    Compression, ErrorDetails, FrameCodec, FrameError, ProtocolTransport, Request, Response,
    ResponseMessage, ResultBody, ServerError, error_codes, flags,
    transport::{encode_response, read_frame},
};

/// Produces the response a node gives to one request.
///
/// Each request is answered on its own task, so a slow answer does not hold back
/// the ones behind it and responses may leave out of order.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn respond(&self, request: Request) -> Response;
}

/// A protocol-speaking node listening on TCP.
pub struct NodeServer {
    listener: TcpListener,
    responder: Arc<dyn Responder>,
    max_frame_size: usize,
}

impl NodeServer {
    pub async fn bind(
        address: SocketAddr,
        responder: Arc<dyn Responder>,
        max_frame_size: usize,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            responder,
            max_frame_size,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn listen(self) -> std::io::Result<()> {
        info!("listening at {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    continue;
                }
            };
            let responder = Arc::clone(&self.responder);
            let max_frame_size = self.max_frame_size;
            tokio::spawn(async move {
                debug!("accepted connection from {peer}");
                if let Err(e) = serve_connection(stream, responder, max_frame_size).await {
                    warn!("connection from {peer} failed: {e}");
                }
            });
        }
    }
}

/// Serve one client connection until it closes.
pub async fn serve_connection<T>(
    stream: T,
    responder: Arc<dyn Responder>,
    max_frame_size: usize,
) -> Result<(), FrameError>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut transport =
        ProtocolTransport::new(stream, FrameCodec::new(Compression::None, max_frame_size));

    // Nothing but OPTIONS and STARTUP is accepted until the connection is ready.
    loop {
        let Some(frame) = transport.read_frame().await? else {
            return Ok(());
        };
        let stream_id = frame.stream();
        let reply = match Request::decode(frame.opcode(), frame.body) {
            Ok(Request::Options) => supported(),
            Ok(Request::Startup { options }) => {
                let compression =
                    Compression::from_name(options.get("COMPRESSION").map(String::as_str));
                transport
                    .write_response(stream_id, &ResponseMessage::new(Response::Ready))
                    .await?;
                transport.set_codec(FrameCodec::new(compression, max_frame_size));
                debug!("connection ready, compression {compression:?}");
                break;
            }
            Ok(other) => protocol_error(format!(
                "{:?} received before STARTUP",
                other.opcode()
            )),
            Err(e) => protocol_error(e.to_string()),
        };
        transport
            .write_response(stream_id, &ResponseMessage::new(reply))
            .await?;
    }

    let codec = transport.codec();
    let (mut reader, mut writer) = tokio::io::split(transport.into_inner());
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

    let writer_task = tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if writer.write_all(&raw).await.is_err() {
                break;
            }
        }
    });

    let mut traces = 0u64;
    let result = loop {
        let frame = match read_frame(&mut reader, &codec).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };
        let stream_id = frame.stream();
        let tracing_id = if frame.header.flags & flags::TRACING != 0 {
            traces += 1;
            Some(trace_id(traces))
        } else {
            None
        };
        let responder = Arc::clone(&responder);
        let tx = tx.clone();

        tokio::spawn(async move {
            let response = match Request::decode(frame.opcode(), frame.body) {
                Ok(Request::Options) => supported(),
                Ok(request) => responder.respond(request).await,
                Err(e) => protocol_error(e.to_string()),
            };
            let mut message = ResponseMessage::new(response);
            message.tracing_id = tracing_id;
            match encode_response(&codec, stream_id, &message) {
                Ok(raw) => {
                    let _ = tx.send(raw);
                }
                Err(e) => warn!("dropping response to stream {stream_id}: {e}"),
            }
        });
    };

    drop(tx);
    let _ = writer_task.await;
    result
}

fn supported() -> Response {
    let mut options = BTreeMap::new();
    options.insert("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]);
    options.insert(
        "COMPRESSION".to_string(),
        vec!["lz4".to_string(), "snappy".to_string()],
    );
    Response::Supported { options }
}

fn protocol_error(message: String) -> Response {
    Response::Error(ServerError::new(error_codes::PROTOCOL_ERROR, message))
}

fn trace_id(n: u64) -> [u8; 16] {
    let mut id = [0u8; 16];
    id[8..].copy_from_slice(&n.to_be_bytes());
    id
}

/// Responder used by the `rime_node` binary.
///
/// Queries come back as a single raw row holding the query text. PREPARE registers
/// the query under an id derived from its text; EXECUTE of an id it never saw is
/// answered with UNPREPARED, the way a restarted node would.
#[derive(Debug, Default)]
pub struct EchoResponder {
    prepared: Mutex<HashMap<Bytes, String>>,
}

impl EchoResponder {
    pub fn new() -> Self {
        Self::default()
    }

    fn statement_id(query: &str) -> Bytes {
        let mut hasher = DefaultHasher::new();
        query.hash(&mut hasher);
        Bytes::copy_from_slice(&hasher.finish().to_be_bytes())
    }
}

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, request: Request) -> Response {
        match request {
            Request::Query { query, .. } => {
                Response::Result(ResultBody::Rows(Bytes::from(query.into_bytes())))
            }
            Request::Prepare { query } => {
                let id = Self::statement_id(&query);
                self.prepared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(id.clone(), query);
                Response::Result(ResultBody::Prepared {
                    id,
                    metadata: Bytes::new(),
                })
            }
            Request::Execute { id, .. } => {
                let query = self
                    .prepared
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&id)
                    .cloned();
                match query {
                    Some(query) => Response::Result(ResultBody::Rows(Bytes::from(query))),
                    None => Response::Error(
                        ServerError::new(error_codes::UNPREPARED, "unknown prepared id")
                            .with_details(ErrorDetails::Unprepared { id }),
                    ),
                }
            }
            Request::Batch(_) => Response::Result(ResultBody::Void),
            Request::Options => supported(),
            Request::Startup { .. } => Response::Ready,
        }
    }
}
