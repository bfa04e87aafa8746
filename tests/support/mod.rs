#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rpc_pool::error::BoxError;
use rpc_pool::protocol::Reply;
use rpc_pool::{ConnectOptions, ConnectionEvent, ConnectionEvents, PoolOptions, Protocol, Transport};
use tokio::sync::Notify;

/// What a mock connection reports right after it is opened
#[derive(Debug, Clone, Copy)]
pub enum OpenPlan {
    Connect,
    Refuse,
    Close,
    Timeout,
    /// Report nothing; the test drives the outcome with [`MockTransport::emit`]
    Stall,
}

#[derive(Debug, Clone)]
pub struct Opened {
    pub id: u64,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub keep_alive: bool,
    pub timeout: Option<Duration>,
}

#[derive(Default)]
struct TransportState {
    plans: VecDeque<OpenPlan>,
    opened: Vec<Opened>,
    ended: Vec<u64>,
    events: HashMap<u64, ConnectionEvents>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<TransportState>>,
}

pub struct MockHandle {
    pub id: u64,
    events: ConnectionEvents,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next open. Opens without a plan connect.
    pub fn plan(&self, plan: OpenPlan) {
        self.state.lock().plans.push_back(plan);
    }

    /// Report an event on a connection, as the network would
    pub fn emit(&self, id: u64, event: ConnectionEvent) {
        let events = self.state.lock().events.get(&id).cloned();
        events.expect("no such connection").emit(event);
    }

    pub fn opened(&self) -> Vec<Opened> {
        self.state.lock().opened.clone()
    }

    pub fn ended(&self) -> Vec<u64> {
        self.state.lock().ended.clone()
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn open(&self, options: ConnectOptions<'_>, events: ConnectionEvents) -> MockHandle {
        let id = events.connection_id();
        let plan = {
            let mut state = self.state.lock();
            state.opened.push(Opened {
                id,
                host: options.endpoint.host.clone(),
                port: options.endpoint.port,
                secure: options.secure,
                keep_alive: options.keep_alive,
                timeout: options.timeout,
            });
            state.events.insert(id, events.clone());
            state.plans.pop_front().unwrap_or(OpenPlan::Connect)
        };
        match plan {
            OpenPlan::Connect => events.emit(ConnectionEvent::Connect),
            OpenPlan::Refuse => events.emit(ConnectionEvent::Error(Arc::new(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            )))),
            OpenPlan::Close => events.emit(ConnectionEvent::Close),
            OpenPlan::Timeout => events.emit(ConnectionEvent::Timeout),
            OpenPlan::Stall => {}
        }
        MockHandle { id, events }
    }

    fn end(&self, handle: &MockHandle) {
        self.state.lock().ended.push(handle.id);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("remote error: {0}")]
pub struct RemoteError(pub String);

/// How the mock server answers the next call
pub enum Script {
    Reply(Vec<Value>),
    Fail(String),
    /// Refuse to issue the call at all
    Throw,
    /// Never answer
    Hang,
    /// Answer once the notify fires
    Gate(Arc<Notify>, Vec<Value>),
    /// Report an event on the connection, then answer in the same poll
    Emit(ConnectionEvent, Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub connection: u64,
    pub method: String,
    pub args: Vec<Value>,
}

#[derive(Default)]
struct ProtocolState {
    scripts: VecDeque<Script>,
    invocations: Vec<Invocation>,
}

#[derive(Clone, Default)]
pub struct MockProtocol {
    state: Arc<Mutex<ProtocolState>>,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the answer to the next call. Calls without a script get an
    /// empty reply.
    pub fn script(&self, script: Script) {
        self.state.lock().scripts.push_back(script);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }
}

impl Protocol<MockHandle> for MockProtocol {
    type Value = Value;
    type Error = RemoteError;

    fn invoke<'a>(
        &'a self,
        connection: &'a MockHandle,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Reply<'a, Value, RemoteError>, BoxError> {
        let script = {
            let mut state = self.state.lock();
            state.invocations.push(Invocation {
                connection: connection.id,
                method: method.to_owned(),
                args,
            });
            state.scripts.pop_front().unwrap_or(Script::Reply(Vec::new()))
        };
        let reply: Reply<'a, Value, RemoteError> = match script {
            Script::Reply(values) => Box::pin(async move { Ok(values) }),
            Script::Fail(message) => Box::pin(async move { Err(RemoteError(message)) }),
            Script::Throw => return Err("could not encode request".into()),
            Script::Hang => Box::pin(future::pending::<Result<Vec<Value>, RemoteError>>()),
            Script::Gate(gate, values) => Box::pin(async move {
                gate.notified().await;
                Ok(values)
            }),
            Script::Emit(event, values) => Box::pin(async move {
                connection.events.emit(event);
                Ok(values)
            }),
        };
        Ok(reply)
    }
}

pub fn options() -> PoolOptions {
    PoolOptions::new().host("rpc.test").port(9090)
}

/// Yield to other tasks until `condition` holds
pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}
