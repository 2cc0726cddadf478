//! Session cache and request/reply exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{AddressResolver, SessionError};
use crate::config::SessionConfig;
use crate::model::ProcessId;
use crate::protocol::{read_frame, write_frame, Envelope, Reply};
use crate::storage::ProcessStore;

/// One open management connection to a process.
///
/// The stream mutex serializes exchanges: at most one request is in flight.
pub struct Session {
    process_id: ProcessId,
    stream: Mutex<TcpStream>,
    closed: AtomicBool,
}

impl Session {
    fn new(process_id: ProcessId, stream: TcpStream) -> Self {
        Self {
            process_id,
            stream: Mutex::new(stream),
            closed: AtomicBool::new(false),
        }
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Write one request and read exactly one reply.
    async fn round_trip(
        &self,
        request: &Envelope,
        config: &SessionConfig,
    ) -> Result<Envelope, SessionError> {
        let mut stream = self.stream.lock().await;
        // Another caller may have torn this session down while we waited.
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let bytes = request.encode();
        timeout(config.io_timeout(), write_frame(&mut *stream, &bytes))
            .await
            .map_err(|_| SessionError::Timeout("write"))??;

        let reply = timeout(
            config.io_timeout(),
            read_frame(&mut *stream, config.max_frame_bytes),
        )
        .await
        .map_err(|_| SessionError::Timeout("read"))??;

        Ok(Envelope::decode(&reply)?)
    }
}

/// Cache of sessions keyed by process id.
pub struct SessionManager {
    sessions: Mutex<HashMap<ProcessId, Arc<Session>>>,
    processes: Arc<dyn ProcessStore>,
    addresses: Arc<dyn AddressResolver>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(
        processes: Arc<dyn ProcessStore>,
        addresses: Arc<dyn AddressResolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            processes,
            addresses,
            config,
        }
    }

    pub fn addresses(&self) -> &Arc<dyn AddressResolver> {
        &self.addresses
    }

    /// Return the cached session for `process_id`, opening a new one if needed.
    pub async fn connect(&self, process_id: ProcessId) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.cached(process_id).await {
            return Ok(session);
        }

        // Unknown processes are a not-found error, not an address failure.
        self.processes.get_process(process_id).await?;
        let address = self.addresses.management_address(process_id).await?;

        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| SessionError::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        let session = Arc::new(Session::new(process_id, stream));

        let mut sessions = self.sessions.lock().await;
        match sessions.get(&process_id) {
            // Lost a race with a concurrent connect; keep the first session.
            Some(existing) if !existing.is_closed() => Ok(existing.clone()),
            _ => {
                info!(process_id = %process_id, address = %address, "Management session opened");
                sessions.insert(process_id, session.clone());
                Ok(session)
            }
        }
    }

    async fn cached(&self, process_id: ProcessId) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .await
            .get(&process_id)
            .filter(|s| !s.is_closed())
            .cloned()
    }

    /// Whether a live session is cached for `process_id`.
    pub async fn is_connected(&self, process_id: ProcessId) -> bool {
        self.cached(process_id).await.is_some()
    }

    /// Close and forget the session for `process_id`.
    pub async fn disconnect(&self, process_id: ProcessId) {
        if let Some(session) = self.sessions.lock().await.remove(&process_id) {
            session.close();
            debug!(process_id = %process_id, "Management session closed");
        }
    }

    /// Drop `session` from the cache if it is still the cached one.
    async fn evict(&self, session: &Arc<Session>) {
        session.close();
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(&session.process_id)
            .is_some_and(|cached| Arc::ptr_eq(cached, session))
        {
            sessions.remove(&session.process_id);
        }
    }

    /// Send `request` and wait for a reply of type `R`.
    ///
    /// `Ok(None)` when the process answered with an error message or an
    /// unexpected type. Any I/O or decode failure evicts the session and is
    /// returned; the next call reconnects from scratch.
    pub async fn exchange<R: Reply>(
        &self,
        process_id: ProcessId,
        request: impl Into<Envelope>,
    ) -> Result<Option<R>, SessionError> {
        let request = request.into();
        let mut session = self.connect(process_id).await?;

        let mut result = session.round_trip(&request, &self.config).await;
        if matches!(result, Err(SessionError::Closed)) && session.is_closed() {
            // Torn down by a concurrent caller before we got the stream.
            session = self.connect(process_id).await?;
            result = session.round_trip(&request, &self.config).await;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    process_id = %process_id,
                    request = request.type_name(),
                    error = %e,
                    "Exchange failed, evicting session"
                );
                self.evict(&session).await;
                return Err(e);
            }
        };

        match R::from_envelope(reply) {
            Ok(reply) => Ok(Some(reply)),
            Err(Envelope::ErrorMessage(error)) => {
                warn!(
                    process_id = %process_id,
                    request = request.type_name(),
                    debug_information = %error.debug_information,
                    "Process replied with error"
                );
                Ok(None)
            }
            Err(other) => {
                warn!(
                    process_id = %process_id,
                    expected = R::TYPE_NAME,
                    received = other.type_name(),
                    "Protocol violation: unexpected reply type"
                );
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::model::{NodeAssignment, Process};
    use crate::protocol::{GoToProcessState, ProcessStateCode, ProcessStateUpdate, SetConfig};
    use crate::session::StaticAddressResolver;
    use crate::storage::MemoryProcessStore;
    use crate::test_utils::{FakeBehavior, FakeProcess};
    use uuid::Uuid;

    async fn setup() -> (SessionManager, FakeProcess, Uuid) {
        let processes = Arc::new(MemoryProcessStore::new());
        let process = Process::new(
            Uuid::new_v4(),
            "svc",
            NodeAssignment::NodePool(Uuid::new_v4()),
        );
        processes.put_process(&process).await.unwrap();

        let fake = FakeProcess::start().await;
        let addresses = Arc::new(StaticAddressResolver::new());
        addresses.register(process.id, fake.address()).await;

        let config = SessionConfig {
            io_timeout_ms: 200,
            connect_timeout_ms: 200,
            ..SessionConfig::default()
        };
        (
            SessionManager::new(processes, addresses, config),
            fake,
            process.id,
        )
    }

    fn set_config(id: Uuid) -> SetConfig {
        SetConfig {
            process_id: id.to_string(),
            is_update: false,
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_exchange_returns_expected_reply() {
        let (manager, fake, id) = setup().await;
        let reply: Option<ProcessStateUpdate> =
            manager.exchange(id, set_config(id)).await.unwrap();
        let reply = reply.unwrap();
        assert_eq!(reply.state, ProcessStateCode::Running as i32);
        assert_eq!(fake.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_is_reused() {
        let (manager, fake, id) = setup().await;
        for _ in 0..3 {
            let _: Option<ProcessStateUpdate> = manager.exchange(id, set_config(id)).await.unwrap();
        }
        assert_eq!(fake.accepted_connections(), 1);
        assert!(manager.is_connected(id).await);
    }

    #[tokio::test]
    async fn test_error_reply_is_no_result() {
        let (manager, fake, id) = setup().await;
        fake.set_behavior(FakeBehavior::ErrorReply).await;
        let reply: Option<ProcessStateUpdate> =
            manager.exchange(id, set_config(id)).await.unwrap();
        assert!(reply.is_none());
        // Error replies keep the session.
        assert!(manager.is_connected(id).await);
    }

    #[tokio::test]
    async fn test_wrong_reply_type_is_no_result() {
        let (manager, fake, id) = setup().await;
        fake.set_behavior(FakeBehavior::WrongType).await;
        let reply: Option<ProcessStateUpdate> =
            manager.exchange(id, set_config(id)).await.unwrap();
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_timeout_evicts_and_next_call_reconnects() {
        let (manager, fake, id) = setup().await;
        fake.set_behavior(FakeBehavior::Silent).await;
        let err = manager
            .exchange::<ProcessStateUpdate>(id, set_config(id))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Timeout("read")));
        assert!(!manager.is_connected(id).await);

        fake.set_behavior(FakeBehavior::Normal).await;
        let reply: Option<ProcessStateUpdate> =
            manager.exchange(id, set_config(id)).await.unwrap();
        assert!(reply.is_some());
        assert_eq!(fake.accepted_connections(), 2);
    }

    #[tokio::test]
    async fn test_garbage_reply_is_serialization_error() {
        let (manager, fake, id) = setup().await;
        fake.set_behavior(FakeBehavior::Garbage).await;
        let err = manager
            .exchange::<ProcessStateUpdate>(id, set_config(id))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Serialization(_)));
        assert!(!manager.is_connected(id).await);

        fake.set_behavior(FakeBehavior::Normal).await;
        let request = GoToProcessState {
            process_id: id.to_string(),
            target_state: ProcessStateCode::Terminated as i32,
        };
        let reply: Option<ProcessStateUpdate> = manager.exchange(id, request).await.unwrap();
        assert_eq!(reply.unwrap().state, ProcessStateCode::Terminated as i32);
        assert_eq!(fake.accepted_connections(), 2);
    }

    #[tokio::test]
    async fn test_unknown_process_is_not_found() {
        let (manager, _fake, _id) = setup().await;
        let err = manager
            .exchange::<ProcessStateUpdate>(Uuid::new_v4(), set_config(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_take_turns() {
        let (manager, fake, id) = setup().await;
        let _: Option<ProcessStateUpdate> = manager.exchange(id, set_config(id)).await.unwrap();

        let pause = Duration::from_millis(50);
        fake.set_behavior(FakeBehavior::Slow(pause)).await;
        let go = |state: ProcessStateCode| GoToProcessState {
            process_id: id.to_string(),
            target_state: state as i32,
        };
        let (running, suspended, terminated) = tokio::join!(
            manager.exchange::<ProcessStateUpdate>(id, go(ProcessStateCode::Running)),
            manager.exchange::<ProcessStateUpdate>(id, go(ProcessStateCode::Suspended)),
            manager.exchange::<ProcessStateUpdate>(id, go(ProcessStateCode::Terminated)),
        );

        // Each caller reads the reply to its own request.
        assert_eq!(running.unwrap().unwrap().state, ProcessStateCode::Running as i32);
        assert_eq!(suspended.unwrap().unwrap().state, ProcessStateCode::Suspended as i32);
        assert_eq!(terminated.unwrap().unwrap().state, ProcessStateCode::Terminated as i32);

        // The next request is only written once the previous reply is read.
        let arrivals = fake.arrivals().await;
        assert_eq!(arrivals.len(), 4);
        for pair in arrivals[1..].windows(2) {
            assert!(pair[1].duration_since(pair[0]) >= pause);
        }
        assert_eq!(fake.accepted_connections(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_forces_new_socket() {
        let (manager, fake, id) = setup().await;
        let _: Option<ProcessStateUpdate> = manager.exchange(id, set_config(id)).await.unwrap();
        manager.disconnect(id).await;
        let _: Option<ProcessStateUpdate> = manager.exchange(id, set_config(id)).await.unwrap();
        assert_eq!(fake.accepted_connections(), 2);
    }
}
