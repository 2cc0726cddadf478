//! Test utilities: a fake managed process, model fixtures, and a harness
//! wiring every subsystem against in-memory stores.
//!
//! Available to unit tests and, with the `test-utils` feature, to
//! integration tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::container::MockContainerBackend;
use crate::lifecycle::ProcessLifecycle;
use crate::model::{Process, ProcessId, Service, UserId};
use crate::protocol::{
    read_frame, write_frame, ConnectionHandshake, ConnectionMessage, ConnectionMode,
    ConnectionStateCode, Envelope, ErrorMessage, ProcessStateCode, ProcessStateUpdate, SetConfig,
};
use crate::queue::{TaskContext, TaskQueue, TaskRun};
use crate::resolver::ConnectionResolver;
use crate::session::{ProcessController, SessionManager, StaticAddressResolver};
use crate::storage::{MemoryServiceRegistry, Stores, TaskState};

// ============================================================================
// Fake managed process
// ============================================================================

/// How a [`FakeProcess`] answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Reach the requested state and acknowledge connections.
    Normal,
    /// Read requests, never answer.
    Silent,
    /// Answer with bytes that are not an envelope.
    Garbage,
    /// Answer every request with an `ErrorMessage`.
    ErrorReply,
    /// Answer with a well-formed message of the wrong type.
    WrongType,
    /// Report this state for lifecycle requests, whatever was asked.
    ReportState(ProcessStateCode),
    /// Answer like `Normal`, after a pause.
    Slow(Duration),
}

#[derive(Default)]
struct FakeState {
    behavior: RwLock<Option<FakeBehavior>>,
    requests: RwLock<Vec<Envelope>>,
    arrivals: RwLock<Vec<Instant>>,
    accepted: AtomicU32,
    connections: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// A management server on localhost that speaks the control protocol.
///
/// Records every request it receives. Stops serving when dropped.
pub struct FakeProcess {
    address: SocketAddr,
    state: Arc<FakeState>,
    accept_task: JoinHandle<()>,
}

impl FakeProcess {
    /// Resume state handed out when a process is suspended.
    pub const SUSPEND_STATE: &'static [u8] = b"fake-suspend-state";

    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake process");
        let address = listener.local_addr().expect("fake process address");
        let state = Arc::new(FakeState::default());

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                let handler = tokio::spawn(serve(stream, accept_state.clone()));
                if let Ok(mut connections) = accept_state.connections.lock() {
                    connections.push(handler);
                }
            }
        });

        Self {
            address,
            state,
            accept_task,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub async fn set_behavior(&self, behavior: FakeBehavior) {
        *self.state.behavior.write().await = Some(behavior);
    }

    /// Every request received, in order.
    pub async fn requests(&self) -> Vec<Envelope> {
        self.state.requests.read().await.clone()
    }

    /// When each request was read, in order.
    pub async fn arrivals(&self) -> Vec<Instant> {
        self.state.arrivals.read().await.clone()
    }

    pub async fn set_config_requests(&self) -> Vec<SetConfig> {
        self.requests()
            .await
            .into_iter()
            .filter_map(|r| match r {
                Envelope::SetConfig(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub async fn connection_messages(&self) -> Vec<ConnectionMessage> {
        self.requests()
            .await
            .into_iter()
            .filter_map(|r| match r {
                Envelope::ConnectionMessage(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    /// Number of management connections accepted so far.
    pub fn accepted_connections(&self) -> u32 {
        self.state.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for FakeProcess {
    fn drop(&mut self) {
        self.accept_task.abort();
        if let Ok(connections) = self.state.connections.lock() {
            for handler in connections.iter() {
                handler.abort();
            }
        }
    }
}

async fn serve(mut stream: TcpStream, state: Arc<FakeState>) {
    loop {
        let Ok(frame) = read_frame(&mut stream, 1 << 20).await else {
            return;
        };
        let Ok(request) = Envelope::decode(&frame) else {
            return;
        };
        state.arrivals.write().await.push(Instant::now());
        state.requests.write().await.push(request.clone());

        let behavior = state.behavior.read().await.unwrap_or(FakeBehavior::Normal);
        let reply = match behavior {
            FakeBehavior::Silent => None,
            FakeBehavior::Garbage => Some(vec![200, b'x']),
            FakeBehavior::ErrorReply => Some(
                Envelope::from(ErrorMessage {
                    process_id: String::new(),
                    debug_information: "fake failure".into(),
                })
                .encode(),
            ),
            FakeBehavior::WrongType => Some(wrong_reply(&request).encode()),
            FakeBehavior::Normal => Some(normal_reply(&request, None).encode()),
            FakeBehavior::ReportState(code) => Some(normal_reply(&request, Some(code)).encode()),
            FakeBehavior::Slow(pause) => {
                tokio::time::sleep(pause).await;
                Some(normal_reply(&request, None).encode())
            }
        };

        if let Some(bytes) = reply {
            if write_frame(&mut stream, &bytes).await.is_err() {
                return;
            }
        }
    }
}

fn state_update(process_id: &str, state: ProcessStateCode) -> Envelope {
    let state_data = if state == ProcessStateCode::Suspended {
        FakeProcess::SUSPEND_STATE.to_vec()
    } else {
        Vec::new()
    };
    Envelope::from(ProcessStateUpdate {
        process_id: process_id.to_string(),
        state: state as i32,
        state_data,
    })
}

fn normal_reply(request: &Envelope, forced: Option<ProcessStateCode>) -> Envelope {
    match request {
        Envelope::SetConfig(m) => {
            state_update(&m.process_id, forced.unwrap_or(ProcessStateCode::Running))
        }
        Envelope::GoToProcessState(m) => {
            let target =
                ProcessStateCode::try_from(m.target_state).unwrap_or(ProcessStateCode::Running);
            state_update(&m.process_id, forced.unwrap_or(target))
        }
        Envelope::ResumeProcess(m) => {
            state_update(&m.process_id, forced.unwrap_or(ProcessStateCode::Running))
        }
        Envelope::ConnectionMessage(m) => {
            let state = match m.connection_mode() {
                Some(ConnectionMode::Suspend) => ConnectionStateCode::Suspended,
                Some(ConnectionMode::Terminate) => ConnectionStateCode::Terminated,
                _ => ConnectionStateCode::Connected,
            };
            Envelope::from(ConnectionHandshake {
                connection_id: m.connection_id.clone(),
                connection_state: state as i32,
            })
        }
        other => Envelope::from(ErrorMessage {
            process_id: String::new(),
            debug_information: format!("unexpected {}", other.type_name()),
        }),
    }
}

fn wrong_reply(request: &Envelope) -> Envelope {
    match request {
        Envelope::ConnectionMessage(_) => state_update("", ProcessStateCode::Running),
        _ => Envelope::from(ConnectionHandshake {
            connection_id: String::new(),
            connection_state: ConnectionStateCode::Connected as i32,
        }),
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub mod fixtures {
    use uuid::Uuid;

    use crate::model::{Interface, InterfaceVersion, NodeAssignment, Service};

    /// Version name used by fixture interfaces.
    pub const VERSION: &str = "1.0";

    /// An interface compatible with itself, allowing multiple connections.
    pub fn interface(id: &str) -> Interface {
        let hash = format!("{id}-messages");
        interface_with_hashes(id, &hash, &hash)
    }

    /// Like [`interface`], connected automatically.
    pub fn auto_interface(id: &str) -> Interface {
        Interface {
            auto_connect: true,
            ..interface(id)
        }
    }

    pub fn interface_with_hashes(id: &str, receives: &str, sends: &str) -> Interface {
        Interface {
            id: id.to_string(),
            name: id.to_string(),
            versions: vec![InterfaceVersion::new(VERSION, receives, sends)],
            allow_multiple: true,
            auto_connect: false,
        }
    }

    pub fn service(id: &str, interfaces: Vec<Interface>) -> Service {
        Service {
            id: id.to_string(),
            name: id.to_string(),
            image: format!("registry.local/{id}:latest"),
            interfaces,
        }
    }

    /// A node pool assignment with a fresh id.
    pub fn node() -> NodeAssignment {
        NodeAssignment::NodePool(Uuid::new_v4())
    }
}

// ============================================================================
// Harness
// ============================================================================

/// All subsystems wired over in-memory stores, a mock container backend and
/// fake processes, with a virtual clock for running the queue.
pub struct Harness {
    pub config: Config,
    pub stores: Stores,
    pub services: Arc<MemoryServiceRegistry>,
    pub containers: Arc<MockContainerBackend>,
    pub addresses: Arc<StaticAddressResolver>,
    pub queue: Arc<TaskQueue>,
    pub resolver: Arc<ConnectionResolver>,
    pub lifecycle: ProcessLifecycle,
    pub ctx: TaskContext,
    fakes: Mutex<HashMap<ProcessId, Arc<FakeProcess>>>,
    clock: Mutex<DateTime<Utc>>,
}

impl Harness {
    pub fn new(services: impl IntoIterator<Item = Service>) -> Self {
        Self::with_config(Config::for_test(), services)
    }

    pub fn with_config(config: Config, services: impl IntoIterator<Item = Service>) -> Self {
        let stores = Stores::in_memory();
        let services = Arc::new(MemoryServiceRegistry::with_services(services));
        let containers = Arc::new(MockContainerBackend::new());
        let addresses = Arc::new(StaticAddressResolver::new());
        let queue = Arc::new(TaskQueue::new(stores.tasks.clone(), &config.queue));

        let sessions = Arc::new(SessionManager::new(
            stores.processes.clone(),
            addresses.clone(),
            config.session.clone(),
        ));
        let controller = Arc::new(ProcessController::new(
            sessions,
            stores.processes.clone(),
            services.clone(),
        ));
        let resolver = Arc::new(ConnectionResolver::new(
            stores.processes.clone(),
            stores.connections.clone(),
            services.clone(),
            queue.clone(),
            config.connections.clone(),
        ));
        let lifecycle = ProcessLifecycle::new(
            stores.processes.clone(),
            stores.connections.clone(),
            services.clone(),
            resolver.clone(),
            queue.clone(),
        );
        let ctx = TaskContext {
            processes: stores.processes.clone(),
            connections: stores.connections.clone(),
            services: services.clone(),
            containers: containers.clone(),
            controller,
            resolver: resolver.clone(),
            queue: queue.clone(),
        };

        Self {
            config,
            stores,
            services,
            containers,
            addresses,
            queue,
            resolver,
            lifecycle,
            ctx,
            fakes: Mutex::new(HashMap::new()),
            clock: Mutex::new(Utc::now()),
        }
    }

    /// Serve `process_id`'s management port from a new fake process.
    pub async fn attach(&self, process_id: ProcessId) -> Arc<FakeProcess> {
        let fake = Arc::new(FakeProcess::start().await);
        self.addresses.register(process_id, fake.address()).await;
        self.fakes.lock().await.insert(process_id, fake.clone());
        fake
    }

    pub async fn fake(&self, process_id: ProcessId) -> Option<Arc<FakeProcess>> {
        self.fakes.lock().await.get(&process_id).cloned()
    }

    /// Create a process through the lifecycle and attach a fake to it.
    pub async fn create_process(
        &self,
        user_id: UserId,
        service_id: &str,
    ) -> (Process, Arc<FakeProcess>) {
        let process = self
            .lifecycle
            .create_process(user_id, service_id, fixtures::node(), Vec::new())
            .await
            .expect("create process");
        let fake = self.attach(process.id).await;
        (process, fake)
    }

    /// Virtual time. Never behind the wall clock, since submissions use it.
    pub async fn now(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().await;
        let real = Utc::now();
        if real > *clock {
            *clock = real;
        }
        *clock
    }

    /// Move the virtual clock forward.
    pub async fn advance(&self, by: chrono::Duration) {
        let now = self.now().await;
        *self.clock.lock().await = now + by;
    }

    /// Run one eligible task at the virtual time.
    pub async fn run_next(&self) -> Option<TaskRun> {
        let now = self.now().await;
        self.queue
            .run_next_at(&self.ctx, now)
            .await
            .expect("task store")
    }

    /// Run tasks, advancing the virtual clock to each next due time, until
    /// only permanently failed tasks remain.
    pub async fn run_until_idle(&self) -> Vec<TaskRun> {
        let mut runs = Vec::new();
        for _ in 0..10_000 {
            if let Some(run) = self.run_next().await {
                runs.push(run);
                continue;
            }

            let now = self.now().await;
            let next = self
                .queue
                .list()
                .await
                .expect("task store")
                .into_iter()
                .filter(|t| t.state == TaskState::Pending)
                .map(|t| t.run_at)
                .min();
            match next {
                Some(at) if at > now => *self.clock.lock().await = at,
                _ => break,
            }
        }
        runs
    }
}
