//! In-process filter that speaks the wire protocol from a script.

use crate::filter::FilterDef;
use milter::{
    read_frame, write_frame, Deadline, Frame, SocketSpec, TimeoutClass, Timeouts, MAX_CHUNK_SIZE,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream, UnixListener};

/// Every frame the mock received, in order.
#[derive(Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<Frame>>>);

impl Log {
    fn push(&self, frame: Frame) {
        self.0.lock().unwrap().push(frame);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.0.lock().unwrap().clone()
    }

    pub fn commands(&self) -> String {
        self.frames().iter().map(|f| f.command as char).collect()
    }

    pub fn payloads(&self, command: u8) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter(|f| f.command == command)
            .map(|f| f.payload.to_vec())
            .collect()
    }
}

pub(crate) struct MockFilter {
    version: u32,
    actions: u32,
    protocol: u32,
    replies: HashMap<u8, Vec<Frame>>,
    stall_on: Option<u8>,
    hang_up_on: Option<u8>,
}

impl MockFilter {
    pub fn new() -> Self {
        MockFilter {
            version: 6,
            actions: 0,
            protocol: 0,
            replies: HashMap::new(),
            stall_on: None,
            hang_up_on: None,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn actions(mut self, actions: u32) -> Self {
        self.actions = actions;
        self
    }

    pub fn protocol(mut self, protocol: u32) -> Self {
        self.protocol = protocol;
        self
    }

    /// Frames sent back for every `command`. Commands without a script get
    /// a single continue.
    pub fn reply(mut self, command: u8, frames: Vec<Frame>) -> Self {
        self.replies.insert(command, frames);
        self
    }

    /// Never answer `command`.
    pub fn stall_on(mut self, command: u8) -> Self {
        self.stall_on = Some(command);
        self
    }

    /// Close the connection on receiving `command`.
    pub fn hang_up_on(mut self, command: u8) -> Self {
        self.hang_up_on = Some(command);
        self
    }

    pub async fn serve_tcp(self) -> (SocketSpec, Log) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log = Log::default();
        let task_log = log.clone();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                self.run(stream, task_log).await;
            }
        });
        let spec = SocketSpec::Inet {
            host: "127.0.0.1".to_string(),
            port,
        };
        (spec, log)
    }

    pub async fn serve_unix(self, path: &Path) -> (SocketSpec, Log) {
        let listener = UnixListener::bind(path).unwrap();
        let log = Log::default();
        let task_log = log.clone();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                self.run(stream, task_log).await;
            }
        });
        (SocketSpec::Unix(path.to_str().unwrap().to_string()), log)
    }

    async fn run<S: AsyncRead + AsyncWrite + Unpin>(self, mut stream: S, log: Log) {
        let deadline = || Deadline::after(TimeoutClass::Read, Duration::from_secs(30));
        loop {
            let frame = match read_frame(&mut stream, MAX_CHUNK_SIZE, deadline()).await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            let command = frame.command;
            log.push(frame);

            if Some(command) == self.hang_up_on {
                return;
            }
            if Some(command) == self.stall_on {
                std::future::pending::<()>().await;
            }
            let replies = match command {
                b'O' => vec![self.optneg()],
                b'D' | b'A' => continue,
                b'Q' => return,
                other => self
                    .replies
                    .get(&other)
                    .cloned()
                    .unwrap_or_else(|| vec![Frame::new(b'c', Vec::new())]),
            };
            for reply in replies {
                let sent = write_frame(
                    &mut stream,
                    reply.command,
                    &reply.payload,
                    MAX_CHUNK_SIZE,
                    deadline(),
                )
                .await;
                if sent.is_err() {
                    return;
                }
            }
        }
    }

    fn optneg(&self) -> Frame {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.extend_from_slice(&self.actions.to_be_bytes());
        payload.extend_from_slice(&self.protocol.to_be_bytes());
        Frame::new(b'O', payload)
    }
}

pub(crate) fn frame(command: u8, payload: &[u8]) -> Frame {
    Frame::new(command, payload.to_vec())
}

/// A definition with timeouts short enough for tests.
pub(crate) fn quick_def(name: &str, socket: SocketSpec) -> FilterDef {
    let mut def = FilterDef::new(name, socket);
    def.timeouts = Timeouts {
        connect: Duration::from_millis(500),
        write: Duration::from_millis(500),
        read: Duration::from_millis(500),
        end_of_message: Duration::from_secs(2),
    };
    def
}

/// A TCP listener that never accepts and whose accept queue is full, so
/// further connection attempts stay pending.
pub(crate) struct FullBacklog {
    pub spec: SocketSpec,
    _listener: TcpListener,
    _queued: Vec<TcpStream>,
}

pub(crate) async fn full_backlog() -> FullBacklog {
    let socket = TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let listener = socket.listen(1).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut queued = Vec::new();
    loop {
        assert!(queued.len() < 64, "accept queue never filled");
        match tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => queued.push(stream),
            Ok(Err(e)) => panic!("connect to {} failed: {}", addr, e),
            Err(_) => break,
        }
    }

    FullBacklog {
        spec: SocketSpec::Inet {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
        },
        _listener: listener,
        _queued: queued,
    }
}
