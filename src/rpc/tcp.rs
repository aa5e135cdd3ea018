//! TCP deployment of the RPC surface
//!
//! Frames are a little-endian `u32` length followed by a bincode body.
//! The server runs one thread per connection; the transport keeps one idle
//! connection per target and reconnects after any failure.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::protocol::{Request, Response};
use super::transport::{RpcHandler, Transport};
use super::{RpcError, RpcResult};
use crate::constants::MAX_FRAME_SIZE;
use crate::metadata::ServerId;

// accept() のポーリング間隔
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

// 次のフレームを待つ間、shutdown を確認する間隔
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

// フレームの途中で読み込みが進まなくなったら接続を切る
const FRAME_STALL_TIMEOUT: Duration = Duration::from_secs(60);

fn write_frame<W: Write, T: Serialize>(writer: &mut W, value: &T) -> RpcResult<()> {
    let body = bincode::serialize(value)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(RpcError::InvalidFrame(format!(
            "frame of {} bytes exceeds limit {}",
            body.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = body.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .and_then(|_| writer.write_all(&body))
        .and_then(|_| writer.flush())
        .map_err(|e| RpcError::TransportError(e.to_string()))
}

/// 1フレーム読む。接続が閉じていれば `Ok(None)`
fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, MAX_FRAME_SIZE),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Thread-per-connection RPC server
pub struct TcpServer {
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl TcpServer {
    /// Bind `addr` and start serving `handler`
    pub fn bind(addr: SocketAddr, handler: Arc<dyn RpcHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let running = Arc::new(AtomicBool::new(true));

        let accept_running = Arc::clone(&running);
        let accept_thread = thread::Builder::new()
            .name("shardfs-accept".to_string())
            .spawn(move || accept_loop(listener, handler, accept_running))?;

        tracing::info!("RPC server listening on {}", local_addr);
        Ok(Self {
            local_addr,
            running,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting. Connection threads exit when their peer disconnects.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.accept_thread.take() {
            if handle.join().is_err() {
                tracing::error!("Accept thread panicked");
            }
        }
        tracing::info!("RPC server on {} stopped", self.local_addr);
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.accept_thread.is_some() {
            self.shutdown();
        }
    }
}

fn accept_loop(listener: TcpListener, handler: Arc<dyn RpcHandler>, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted connection from {}", peer);
                let handler = Arc::clone(&handler);
                let running = Arc::clone(&running);
                let spawned = thread::Builder::new()
                    .name(format!("shardfs-conn-{}", peer))
                    .spawn(move || {
                        if let Err(e) = serve_connection(stream, handler, running) {
                            tracing::warn!("Connection from {} closed: {}", peer, e);
                        }
                    });
                if let Err(e) = spawned {
                    tracing::error!("Failed to spawn connection thread: {}", e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                tracing::error!("accept failed: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RpcHandler>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(IDLE_POLL_INTERVAL))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = BufWriter::new(stream);

    while running.load(Ordering::Acquire) {
        // タイムアウトさせるのはフレームの先頭を待つ間だけ
        match reader.fill_buf() {
            Ok(buf) if buf.is_empty() => return Ok(()),
            Ok(_) => {}
            Err(e) if is_timeout(&e) => continue,
            Err(e) => return Err(e),
        }

        reader.get_ref().set_read_timeout(Some(FRAME_STALL_TIMEOUT))?;
        let request: Request = match read_frame(&mut reader)? {
            Some(req) => req,
            None => return Ok(()),
        };
        reader.get_ref().set_read_timeout(Some(IDLE_POLL_INTERVAL))?;

        tracing::trace!("TCP request {:?}", request.operation());
        let response = handler.handle(request);
        write_frame(&mut writer, &response)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))?;
    }
    Ok(())
}

/// Client side of the TCP deployment
///
/// Server `i` is reached at `addrs[i]`.
pub struct TcpTransport {
    addrs: Vec<SocketAddr>,
    idle: Mutex<HashMap<ServerId, TcpStream>>,
}

impl TcpTransport {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            idle: Mutex::new(HashMap::new()),
        }
    }

    fn addr_of(&self, target: ServerId) -> RpcResult<SocketAddr> {
        self.addrs
            .get(target as usize)
            .copied()
            .ok_or(RpcError::UnknownServer(target))
    }

    fn connect(&self, target: ServerId, timeout: Duration) -> RpcResult<TcpStream> {
        if let Some(stream) = self.idle.lock().remove(&target) {
            return Ok(stream);
        }
        let addr = self.addr_of(target)?;
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            if is_timeout(&e) {
                RpcError::Timeout {
                    server: target,
                    timeout,
                }
            } else {
                tracing::debug!("Connect to server {} at {} failed: {}", target, addr, e);
                RpcError::Unreachable(target)
            }
        })?;
        stream
            .set_nodelay(true)
            .map_err(|e| RpcError::TransportError(e.to_string()))?;
        Ok(stream)
    }

    fn exchange(
        stream: &mut TcpStream,
        target: ServerId,
        request: &Request,
        timeout: Duration,
    ) -> RpcResult<Response> {
        stream
            .set_write_timeout(Some(timeout))
            .and_then(|_| stream.set_read_timeout(Some(timeout)))
            .map_err(|e| RpcError::TransportError(e.to_string()))?;

        write_frame(stream, request)?;
        match read_frame::<_, Response>(stream) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(RpcError::TransportError(format!(
                "server {} closed the connection",
                target
            ))),
            Err(e) if is_timeout(&e) => Err(RpcError::Timeout {
                server: target,
                timeout,
            }),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                Err(RpcError::InvalidFrame(e.to_string()))
            }
            Err(e) => Err(RpcError::TransportError(e.to_string())),
        }
    }
}

impl Transport for TcpTransport {
    fn call(&self, target: ServerId, request: &Request, timeout: Duration) -> RpcResult<Response> {
        let mut stream = self.connect(target, timeout)?;
        match Self::exchange(&mut stream, target, request, timeout) {
            Ok(response) => {
                self.idle.lock().insert(target, stream);
                Ok(response)
            }
            // 失敗した接続は再利用しない
            Err(e) => Err(e),
        }
    }

    fn server_count(&self) -> u32 {
        self.addrs.len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{Reply, Status};
    use crate::metadata::DirRef;

    struct Echo;

    impl RpcHandler for Echo {
        fn handle(&self, request: Request) -> Response {
            match request {
                Request::Read { length, .. } => Response::ok(Reply::Data(vec![7; length as usize])),
                _ => Response::error(Status::NotFound),
            }
        }
    }

    fn read(length: u64) -> Request {
        Request::Read {
            dir: DirRef::root(),
            name: "f".to_string(),
            offset: 0,
            length,
        }
    }

    #[test]
    fn test_frame_round_trip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &read(3)).unwrap();
        assert_eq!(u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize, buf.len() - 4);

        let decoded: Option<Request> = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, Some(read(3)));

        let empty: Option<Request> = read_frame(&mut &b""[..]).unwrap();
        assert!(empty.is_none());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE as u32) + 1;
        let buf = len.to_le_bytes();
        let result: io::Result<Option<Request>> = read_frame(&mut &buf[..]);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_call_over_tcp() {
        let mut server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Echo)).unwrap();
        let transport = TcpTransport::new(vec![server.local_addr()]);
        let timeout = Duration::from_secs(5);

        let resp = transport.call(0, &read(4), timeout).unwrap();
        assert_eq!(resp.reply, Reply::Data(vec![7; 4]));

        // 2回目は同じ接続を使う
        let resp = transport
            .call(0, &Request::GetPartitionMap { dir: DirRef::root() }, timeout)
            .unwrap();
        assert_eq!(resp.status, Status::NotFound);
        assert_eq!(transport.idle.lock().len(), 1);

        server.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn test_unknown_and_unreachable_server() {
        let transport = TcpTransport::new(vec!["127.0.0.1:1".parse().unwrap()]);
        let timeout = Duration::from_millis(500);
        assert_eq!(
            transport.call(3, &read(1), timeout).unwrap_err(),
            RpcError::UnknownServer(3)
        );
        assert!(transport.call(0, &read(1), timeout).unwrap_err().is_transient());
    }

    #[test]
    fn test_frame_split_across_pause() {
        let mut server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), Arc::new(Echo)).unwrap();
        let mut stream = TcpStream::connect(server.local_addr()).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut frame = Vec::new();
        write_frame(&mut frame, &read(4)).unwrap();
        let half = 4 + (frame.len() - 4) / 2;

        // サーバー側のアイドル待ちより長く止める
        stream.write_all(&frame[..half]).unwrap();
        stream.flush().unwrap();
        thread::sleep(IDLE_POLL_INTERVAL + Duration::from_millis(400));
        stream.write_all(&frame[half..]).unwrap();
        stream.flush().unwrap();

        let resp: Option<Response> = read_frame(&mut stream).unwrap();
        assert_eq!(resp.unwrap().reply, Reply::Data(vec![7; 4]));

        // 同じ接続で続けて使える
        write_frame(&mut stream, &read(2)).unwrap();
        let resp: Option<Response> = read_frame(&mut stream).unwrap();
        assert_eq!(resp.unwrap().reply, Reply::Data(vec![7; 2]));

        server.shutdown();
    }
}
