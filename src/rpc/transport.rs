//! Transport abstraction and an in-process implementation
//!
//! `LocalTransport` delivers requests by calling the registered handler on
//! the caller's thread. It can mark servers unreachable or slow, or lose
//! replies after delivery, so tests can exercise timeouts and placement
//! failures without sockets.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::protocol::{Operation, Request, Response};
use super::{RpcError, RpcResult};
use crate::metadata::ServerId;

/// Server-side request dispatch
pub trait RpcHandler: Send + Sync {
    fn handle(&self, request: Request) -> Response;
}

/// Synchronous request/response delivery to a numbered server
pub trait Transport: Send + Sync {
    /// Send `request` to `target` and block until the reply or `timeout`
    fn call(&self, target: ServerId, request: &Request, timeout: Duration) -> RpcResult<Response>;

    /// Number of servers reachable through this transport
    fn server_count(&self) -> u32;
}

#[derive(Default)]
struct Faults {
    unreachable: HashSet<ServerId>,
    delay: HashMap<ServerId, Duration>,
    lost_replies: HashSet<(ServerId, Operation)>,
}

/// In-process transport
pub struct LocalTransport {
    server_count: u32,
    handlers: RwLock<HashMap<ServerId, Weak<dyn RpcHandler>>>,
    faults: RwLock<Faults>,
}

impl LocalTransport {
    pub fn new(server_count: u32) -> Self {
        Self {
            server_count,
            handlers: RwLock::new(HashMap::new()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Register a server's handler. The transport holds only a weak reference.
    pub fn register(&self, server: ServerId, handler: &Arc<dyn RpcHandler>) {
        self.handlers.write().insert(server, Arc::downgrade(handler));
    }

    pub fn unregister(&self, server: ServerId) {
        self.handlers.write().remove(&server);
    }

    /// Make every call to `server` fail as unreachable
    pub fn set_unreachable(&self, server: ServerId, unreachable: bool) {
        let mut faults = self.faults.write();
        if unreachable {
            faults.unreachable.insert(server);
        } else {
            faults.unreachable.remove(&server);
        }
    }

    /// Simulated processing delay for calls to `server`
    pub fn set_delay(&self, server: ServerId, delay: Option<Duration>) {
        let mut faults = self.faults.write();
        match delay {
            Some(d) => faults.delay.insert(server, d),
            None => faults.delay.remove(&server),
        };
    }
}

impl LocalTransport {
    /// Deliver `operation` to `server` but report a timeout instead of the reply
    pub fn set_reply_lost(&self, server: ServerId, operation: Operation, lost: bool) {
        let mut faults = self.faults.write();
        if lost {
            faults.lost_replies.insert((server, operation));
        } else {
            faults.lost_replies.remove(&(server, operation));
        }
    }
}

impl Transport for LocalTransport {
    fn call(&self, target: ServerId, request: &Request, timeout: Duration) -> RpcResult<Response> {
        if target >= self.server_count {
            return Err(RpcError::UnknownServer(target));
        }

        let (delay, lose_reply) = {
            let faults = self.faults.read();
            if faults.unreachable.contains(&target) {
                return Err(RpcError::Unreachable(target));
            }
            (
                faults.delay.get(&target).copied(),
                faults
                    .lost_replies
                    .contains(&(target, request.operation())),
            )
        };

        if let Some(delay) = delay {
            if delay > timeout {
                std::thread::sleep(timeout);
                return Err(RpcError::Timeout {
                    server: target,
                    timeout,
                });
            }
            std::thread::sleep(delay);
        }

        let handler = self
            .handlers
            .read()
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or(RpcError::Unreachable(target))?;

        tracing::trace!("Local call {:?} -> server {}", request.operation(), target);
        let response = handler.handle(request.clone());
        if lose_reply {
            tracing::trace!("Dropping reply of {:?} from server {}", request.operation(), target);
            return Err(RpcError::Timeout {
                server: target,
                timeout,
            });
        }
        Ok(response)
    }

    fn server_count(&self) -> u32 {
        self.server_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::DirRef;
    use crate::rpc::protocol::{Reply, Status};

    struct Echo;

    impl RpcHandler for Echo {
        fn handle(&self, request: Request) -> Response {
            match request {
                Request::DropDirectory { dir } => Response::ok(Reply::Loaded(dir)),
                _ => Response::error(Status::InvalidArgument),
            }
        }
    }

    fn drop_req(dir: u64) -> Request {
        Request::DropDirectory { dir }
    }

    #[test]
    fn test_call_registered_handler() {
        let transport = LocalTransport::new(2);
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        transport.register(1, &handler);

        let resp = transport
            .call(1, &drop_req(42), Duration::from_secs(1))
            .unwrap();
        assert_eq!(resp.reply, Reply::Loaded(42));

        let resp = transport
            .call(
                1,
                &Request::GetPartitionMap { dir: DirRef::root() },
                Duration::from_secs(1),
            )
            .unwrap();
        assert_eq!(resp.status, Status::InvalidArgument);
    }

    #[test]
    fn test_unknown_and_unregistered() {
        let transport = LocalTransport::new(2);
        assert_eq!(
            transport.call(5, &drop_req(1), Duration::from_secs(1)),
            Err(RpcError::UnknownServer(5))
        );
        assert_eq!(
            transport.call(0, &drop_req(1), Duration::from_secs(1)),
            Err(RpcError::Unreachable(0))
        );

        // ハンドラが破棄されると到達不能になる
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        transport.register(0, &handler);
        drop(handler);
        assert_eq!(
            transport.call(0, &drop_req(1), Duration::from_secs(1)),
            Err(RpcError::Unreachable(0))
        );

        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        transport.register(1, &handler);
        transport.unregister(1);
        assert_eq!(
            transport.call(1, &drop_req(1), Duration::from_secs(1)),
            Err(RpcError::Unreachable(1))
        );
    }

    #[test]
    fn test_fault_injection() {
        let transport = LocalTransport::new(1);
        let handler: Arc<dyn RpcHandler> = Arc::new(Echo);
        transport.register(0, &handler);

        transport.set_unreachable(0, true);
        assert!(transport
            .call(0, &drop_req(1), Duration::from_secs(1))
            .unwrap_err()
            .is_transient());
        transport.set_unreachable(0, false);

        transport.set_delay(0, Some(Duration::from_millis(200)));
        let err = transport
            .call(0, &drop_req(1), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { server: 0, .. }));

        transport.set_delay(0, None);
        assert!(transport
            .call(0, &drop_req(1), Duration::from_millis(10))
            .is_ok());
    }

    #[test]
    fn test_lost_reply_still_delivers() {
        use std::sync::atomic::{AtomicU64, Ordering};

        #[derive(Default)]
        struct Counting(AtomicU64);

        impl RpcHandler for Counting {
            fn handle(&self, _request: Request) -> Response {
                self.0.fetch_add(1, Ordering::SeqCst);
                Response::ok(Reply::Empty)
            }
        }

        let transport = LocalTransport::new(1);
        let counting = Arc::new(Counting::default());
        let handler: Arc<dyn RpcHandler> = counting.clone();
        transport.register(0, &handler);

        transport.set_reply_lost(0, Operation::DropDirectory, true);
        let err = transport
            .call(0, &drop_req(1), Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { server: 0, .. }));
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);

        // 他の操作の応答は届く
        let lookup = Request::GetPartitionMap { dir: DirRef::root() };
        assert!(transport.call(0, &lookup, Duration::from_millis(10)).is_ok());

        transport.set_reply_lost(0, Operation::DropDirectory, false);
        assert!(transport.call(0, &drop_req(1), Duration::from_millis(10)).is_ok());
        assert_eq!(counting.0.load(Ordering::SeqCst), 3);
    }
}
