use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    AppendEntriesArgs, AppendEntriesReply, PeerId, RequestVoteArgs, RequestVoteReply,
};

/// Outbound half of the RPC substrate.
///
/// Calls block until a reply is obtained or the substrate gives up; `None`
/// means no reply (lost request, lost reply, dead peer) and the caller
/// treats the call as if it never happened. The engine layers no timeout of
/// its own on top; retry comes from the next tick.
pub trait Transport<Cmd>: Send + Sync {
    fn request_vote(&self, peer: PeerId, args: &RequestVoteArgs) -> Option<RequestVoteReply>;

    fn append_entries(
        &self,
        peer: PeerId,
        args: &AppendEntriesArgs<Cmd>,
    ) -> Option<AppendEntriesReply>;
}

/// Inbound half: whatever serves RPCs dispatches them through this.
pub trait RpcHandler<Cmd>: Send + Sync {
    fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply;

    fn append_entries(&self, args: AppendEntriesArgs<Cmd>) -> AppendEntriesReply;
}

/// Error type for transport setup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("peer index {0} out of range")]
    UnknownPeer(PeerId),
}

#[derive(Serialize, Deserialize)]
enum RpcRequest<Cmd> {
    RequestVote(RequestVoteArgs),
    AppendEntries(AppendEntriesArgs<Cmd>),
}

#[derive(Serialize, Deserialize)]
enum RpcReply {
    RequestVote(RequestVoteReply),
    AppendEntries(AppendEntriesReply),
}

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const RPC_TIMEOUT: Duration = Duration::from_secs(1);

/// TCP request/reply transport.
///
/// Every call opens a short-lived connection: a 4-byte big-endian length
/// prefix frames a JSON-serialized request, and the same framing carries the
/// reply back. A background thread accepts inbound connections and
/// dispatches each on its own thread through the registered [`RpcHandler`].
/// All I/O failures on the outbound path collapse to `None`.
pub struct TcpTransport<Cmd> {
    me: PeerId,
    peers: Arc<Vec<SocketAddr>>,
    handler: Arc<Mutex<Option<Arc<dyn RpcHandler<Cmd>>>>>,
    _listener: Arc<TcpListener>,
}

impl<Cmd> Clone for TcpTransport<Cmd> {
    fn clone(&self) -> Self {
        TcpTransport {
            me: self.me,
            peers: Arc::clone(&self.peers),
            handler: Arc::clone(&self.handler),
            _listener: Arc::clone(&self._listener),
        }
    }
}

impl<Cmd> TcpTransport<Cmd>
where
    Cmd: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Bind the listener at `peers[me]` and start accepting inbound RPCs.
    /// Requests that arrive before [`register`](Self::register) is called
    /// are dropped, which the protocol tolerates like any lost message.
    pub fn bind(me: PeerId, peers: Vec<SocketAddr>) -> Result<TcpTransport<Cmd>, TransportError> {
        let addr = *peers.get(me).ok_or(TransportError::UnknownPeer(me))?;
        let listener = Arc::new(TcpListener::bind(addr)?);
        let handler: Arc<Mutex<Option<Arc<dyn RpcHandler<Cmd>>>>> = Arc::new(Mutex::new(None));

        let listener_bg = Arc::clone(&listener);
        let handler_bg = Arc::clone(&handler);
        thread::spawn(move || accept_loop(listener_bg, handler_bg));

        Ok(TcpTransport {
            me,
            peers: Arc::new(peers),
            handler,
            _listener: listener,
        })
    }

    /// Install the node that inbound RPCs are dispatched to.
    pub fn register(&self, handler: Arc<dyn RpcHandler<Cmd>>) {
        *self.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// The address this transport is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self._listener.local_addr()
    }

    fn call(&self, peer: PeerId, request: &RpcRequest<Cmd>) -> Option<RpcReply> {
        let addr = *self.peers.get(peer)?;
        match dial(addr, request) {
            Ok(reply) => Some(reply),
            Err(e) => {
                debug!(me = self.me, peer, error = %e, "rpc failed");
                None
            }
        }
    }
}

impl<Cmd> Transport<Cmd> for TcpTransport<Cmd>
where
    Cmd: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn request_vote(&self, peer: PeerId, args: &RequestVoteArgs) -> Option<RequestVoteReply> {
        match self.call(peer, &RpcRequest::RequestVote(args.clone()))? {
            RpcReply::RequestVote(reply) => Some(reply),
            RpcReply::AppendEntries(_) => None,
        }
    }

    fn append_entries(
        &self,
        peer: PeerId,
        args: &AppendEntriesArgs<Cmd>,
    ) -> Option<AppendEntriesReply> {
        match self.call(peer, &RpcRequest::AppendEntries(args.clone()))? {
            RpcReply::AppendEntries(reply) => Some(reply),
            RpcReply::RequestVote(_) => None,
        }
    }
}

fn accept_loop<Cmd>(
    listener: Arc<TcpListener>,
    handler: Arc<Mutex<Option<Arc<dyn RpcHandler<Cmd>>>>>,
) where
    Cmd: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let handler = handler.lock().unwrap_or_else(|e| e.into_inner()).clone();
                let Some(handler) = handler else { continue };
                thread::spawn(move || {
                    let _ = serve_connection(stream, handler.as_ref());
                });
            }
            Err(_) => break,
        }
    }
}

fn serve_connection<Cmd>(stream: TcpStream, handler: &dyn RpcHandler<Cmd>) -> io::Result<()>
where
    Cmd: Serialize + DeserializeOwned,
{
    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
    stream.set_write_timeout(Some(RPC_TIMEOUT))?;

    let request: RpcRequest<Cmd> = read_frame(&stream)?;
    let reply = match request {
        RpcRequest::RequestVote(args) => RpcReply::RequestVote(handler.request_vote(args)),
        RpcRequest::AppendEntries(args) => RpcReply::AppendEntries(handler.append_entries(args)),
    };
    write_frame(&stream, &reply)
}

fn dial<Cmd: Serialize>(addr: SocketAddr, request: &RpcRequest<Cmd>) -> io::Result<RpcReply> {
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(RPC_TIMEOUT))?;
    stream.set_write_timeout(Some(RPC_TIMEOUT))?;
    write_frame(&stream, request)?;
    read_frame(&stream)
}

fn write_frame<M: Serialize>(mut stream: &TcpStream, message: &M) -> io::Result<()> {
    let bytes = serde_json::to_vec(message).map_err(io::Error::other)?;
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 4 GiB"))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()
}

fn read_frame<M: DeserializeOwned>(mut stream: &TcpStream) -> io::Result<M> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    serde_json::from_slice(&buf).map_err(io::Error::other)
}
