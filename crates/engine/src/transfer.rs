//! Chunked payload transfer over short-lived TCP connections.
//!
//! A packet that references a binary payload names a TCP port in its
//! `payloadTransferInfo`; the sender listens there and streams the raw
//! bytes to whoever connects. Payloads move in fixed 8 KiB chunks so that
//! cancellation is observable between chunks and progress can be reported
//! while the transfer runs.
//!
//! Every transfer session owns its socket (and, on the receive side, its
//! sink file) for its whole lifetime and releases them on any terminal
//! state. A cancelled or failed receive deletes the partially written
//! sink.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use protocol::{PayloadTransferInfo, ProtocolError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Fixed chunk size for payload streaming (8 KiB).
pub const CHUNK_SIZE: usize = 8 * 1024;

/// How long a sender waits for the receiver to connect.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Capacity of the transfer event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors raised while setting up a transfer session.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to bind payload listener: {0}")]
    Bind(std::io::Error),

    #[error("failed to create payload sink {path}: {source}")]
    Sink {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Direction of a transfer session, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Lifecycle state of a transfer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Session created, waiting for the connection.
    Pending,
    /// Bytes are moving.
    Active,
    /// All bytes moved; totals matched.
    Completed,
    /// Cancelled by either side.
    Cancelled,
    /// Terminated with an error (I/O failure or byte-count mismatch).
    Failed,
}

impl TransferState {
    /// Returns whether this state is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// A progress snapshot. The final snapshot of a completed transfer always
/// carries the exact totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub id: Uuid,
    pub direction: TransferDirection,
    pub transferred: u64,
    pub total: u64,
}

/// Transfer lifecycle notifications.
///
/// Emitted from the session task; observers must tolerate delivery from
/// any task.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    Progress(TransferProgress),
    Completed { id: Uuid, total: u64 },
    Cancelled { id: Uuid, transferred: u64 },
    Failed { id: Uuid, error: String },
}

/// Caller handle to a running transfer session.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<TransferState>,
}

impl TransferHandle {
    /// The session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests cancellation. The session observes the request within one
    /// chunk boundary.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the current session state.
    pub fn state(&self) -> TransferState {
        *self.state.borrow()
    }

    /// Waits for the session to reach a terminal state.
    pub async fn wait(&mut self) -> TransferState {
        loop {
            let current = *self.state.borrow();
            if current.is_terminal() {
                return current;
            }
            if self.state.changed().await.is_err() {
                return *self.state.borrow();
            }
        }
    }
}

/// Book-keeping shared between a session task and its manager.
struct SessionCtx {
    id: Uuid,
    direction: TransferDirection,
    total: u64,
    events: broadcast::Sender<TransferEvent>,
    state_tx: watch::Sender<TransferState>,
    sessions: Arc<DashMap<Uuid, TransferState>>,
    cancel: CancellationToken,
    progress_interval: Duration,
    last_progress: Option<Instant>,
}

impl SessionCtx {
    fn set_state(&self, state: TransferState) {
        self.sessions.insert(self.id, state);
        let _ = self.state_tx.send(state);
    }

    /// Emits a throttled progress snapshot. `force` bypasses the throttle
    /// for the final exact snapshot.
    fn progress(&mut self, transferred: u64, force: bool) {
        let now = Instant::now();
        let due = match self.last_progress {
            Some(last) => now.duration_since(last) >= self.progress_interval,
            None => true,
        };
        if !force && !due {
            return;
        }
        self.last_progress = Some(now);
        let _ = self.events.send(TransferEvent::Progress(TransferProgress {
            id: self.id,
            direction: self.direction,
            transferred,
            total: self.total,
        }));
    }

    fn complete(&mut self) {
        self.progress(self.total, true);
        self.set_state(TransferState::Completed);
        tracing::info!("Transfer {} completed ({} bytes)", self.id, self.total);
        let _ = self.events.send(TransferEvent::Completed {
            id: self.id,
            total: self.total,
        });
    }

    fn cancelled(&self, transferred: u64) {
        self.set_state(TransferState::Cancelled);
        tracing::info!(
            "Transfer {} cancelled after {} of {} bytes",
            self.id,
            transferred,
            self.total
        );
        let _ = self.events.send(TransferEvent::Cancelled {
            id: self.id,
            transferred,
        });
    }

    fn failed(&self, error: &ProtocolError) {
        self.set_state(TransferState::Failed);
        tracing::warn!("Transfer {} failed: {}", self.id, error);
        let _ = self.events.send(TransferEvent::Failed {
            id: self.id,
            error: error.to_string(),
        });
    }
}

/// Manager for payload transfer sessions.
///
/// Spawns one task per session; sessions report through the shared event
/// channel and their [`TransferHandle`].
pub struct PayloadTransferManager {
    progress_interval: Duration,
    events: broadcast::Sender<TransferEvent>,
    sessions: Arc<DashMap<Uuid, TransferState>>,
}

impl PayloadTransferManager {
    /// Creates a transfer manager with the given progress throttle.
    pub fn new(progress_interval: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            progress_interval,
            events,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Subscribes to transfer lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Returns the state of a session, if it exists.
    ///
    /// Terminal sessions remain queryable until the next session starts,
    /// which evicts them; a live [`TransferHandle`] carries its own state
    /// beyond that.
    pub fn state_of(&self, id: &Uuid) -> Option<TransferState> {
        self.sessions.get(id).map(|e| *e.value())
    }

    /// Offers a payload for sending.
    ///
    /// Binds an ephemeral TCP port and returns the transfer info to embed
    /// in the announcing packet. The session task waits for one inbound
    /// connection, streams `total` bytes from `source` in
    /// [`CHUNK_SIZE`] chunks, and terminates.
    pub async fn offer<R>(
        &self,
        source: R,
        total: u64,
    ) -> Result<(PayloadTransferInfo, TransferHandle), TransferError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(TransferError::Bind)?;
        let port = listener.local_addr().map_err(TransferError::Bind)?.port();

        let (ctx, handle) = self.session(TransferDirection::Send, total);
        let id = ctx.id;
        tracing::debug!("Offering payload of {} bytes on port {} as {}", total, port, id);

        tokio::spawn(run_send(ctx, listener, source));

        Ok((PayloadTransferInfo { port }, handle))
    }

    /// Receives a payload into a file.
    ///
    /// Connects to the sender's payload port and streams `total` bytes
    /// into `dest`. On cancellation or failure the partially written file
    /// is deleted.
    pub async fn receive_to_file(
        &self,
        addr: SocketAddr,
        total: u64,
        dest: PathBuf,
    ) -> Result<TransferHandle, TransferError> {
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TransferError::Sink {
                        path: dest.clone(),
                        source,
                    })?;
            }
        }
        let file = tokio::fs::File::create(&dest)
            .await
            .map_err(|source| TransferError::Sink {
                path: dest.clone(),
                source,
            })?;

        let (ctx, handle) = self.session(TransferDirection::Receive, total);
        tracing::debug!(
            "Receiving payload of {} bytes from {} into {:?} as {}",
            total,
            addr,
            dest,
            ctx.id
        );

        tokio::spawn(run_receive(ctx, addr, file, dest));

        Ok(handle)
    }

    fn session(&self, direction: TransferDirection, total: u64) -> (SessionCtx, TransferHandle) {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(TransferState::Pending);
        // Evict finished sessions so the map only tracks live ones plus
        // those finished since the last session started.
        self.sessions.retain(|_, state| !state.is_terminal());
        self.sessions.insert(id, TransferState::Pending);

        let ctx = SessionCtx {
            id,
            direction,
            total,
            events: self.events.clone(),
            state_tx,
            sessions: self.sessions.clone(),
            cancel: cancel.clone(),
            progress_interval: self.progress_interval,
            last_progress: None,
        };
        let handle = TransferHandle {
            id,
            cancel,
            state: state_rx,
        };
        (ctx, handle)
    }
}

/// Drives a send session to a terminal state.
async fn run_send<R>(mut ctx: SessionCtx, listener: TcpListener, mut source: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, peer)) => {
                tracing::debug!("Payload receiver {} connected to {}", peer, ctx.id);
                stream
            }
            Err(e) => {
                ctx.failed(&ProtocolError::from(e));
                return;
            }
        },
        _ = tokio::time::sleep(ACCEPT_TIMEOUT) => {
            ctx.failed(&ProtocolError::PeerUnreachable(
                "receiver never connected to payload port".to_string(),
            ));
            return;
        }
        _ = ctx.cancel.cancelled() => {
            ctx.cancelled(0);
            return;
        }
    };

    ctx.set_state(TransferState::Active);
    let mut transferred: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    while transferred < ctx.total {
        if ctx.cancel.is_cancelled() {
            ctx.cancelled(transferred);
            return;
        }

        let want = CHUNK_SIZE.min((ctx.total - transferred) as usize);
        let read = tokio::select! {
            r = source.read(&mut buf[..want]) => r,
            _ = ctx.cancel.cancelled() => {
                ctx.cancelled(transferred);
                return;
            }
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                ctx.failed(&ProtocolError::from(e));
                return;
            }
        };

        if let Err(e) = stream.write_all(&buf[..n]).await {
            ctx.failed(&ProtocolError::from(e));
            return;
        }

        transferred += n as u64;
        ctx.progress(transferred, false);
    }

    if let Err(e) = stream.shutdown().await {
        ctx.failed(&ProtocolError::from(e));
        return;
    }

    if transferred == ctx.total {
        ctx.complete();
    } else {
        ctx.failed(&ProtocolError::TransferIncomplete {
            transferred,
            total: ctx.total,
        });
    }
}

/// Drives a receive session to a terminal state.
async fn run_receive(mut ctx: SessionCtx, addr: SocketAddr, file: tokio::fs::File, dest: PathBuf) {
    let mut file = file;

    let mut stream = tokio::select! {
        connected = TcpStream::connect(addr) => match connected {
            Ok(stream) => stream,
            Err(e) => {
                remove_sink(&dest).await;
                ctx.failed(&ProtocolError::from(e));
                return;
            }
        },
        _ = ctx.cancel.cancelled() => {
            remove_sink(&dest).await;
            ctx.cancelled(0);
            return;
        }
    };

    ctx.set_state(TransferState::Active);
    let mut transferred: u64 = 0;
    let mut buf = vec![0u8; CHUNK_SIZE];

    while transferred < ctx.total {
        let want = CHUNK_SIZE.min((ctx.total - transferred) as usize);
        let read = tokio::select! {
            r = stream.read(&mut buf[..want]) => r,
            _ = ctx.cancel.cancelled() => {
                remove_sink(&dest).await;
                ctx.cancelled(transferred);
                return;
            }
        };

        let n = match read {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                remove_sink(&dest).await;
                ctx.failed(&ProtocolError::from(e));
                return;
            }
        };

        if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..n]).await {
            remove_sink(&dest).await;
            ctx.failed(&ProtocolError::from(e));
            return;
        }

        transferred += n as u64;
        ctx.progress(transferred, false);
    }

    if let Err(e) = file.flush().await {
        remove_sink(&dest).await;
        ctx.failed(&ProtocolError::from(e));
        return;
    }
    drop(file);

    if transferred == ctx.total {
        ctx.complete();
    } else {
        // Byte count mismatch: the stream ended early. The partial sink
        // must not survive.
        remove_sink(&dest).await;
        ctx.failed(&ProtocolError::TransferIncomplete {
            transferred,
            total: ctx.total,
        });
    }
}

async fn remove_sink(dest: &PathBuf) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        tracing::debug!("Failed to remove payload sink {:?}: {}", dest, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn manager() -> PayloadTransferManager {
        PayloadTransferManager::new(Duration::from_millis(100))
    }

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn transfer(
        data: Vec<u8>,
        announced_total: u64,
        dest: PathBuf,
    ) -> (TransferState, TransferState) {
        let sender = manager();
        let receiver = manager();

        let total = data.len() as u64;
        let (info, mut send_handle) = sender
            .offer(std::io::Cursor::new(data), total)
            .await
            .unwrap();
        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), announced_total, dest)
            .await
            .unwrap();

        let send_state = send_handle.wait().await;
        let recv_state = recv_handle.wait().await;
        (send_state, recv_state)
    }

    #[tokio::test]
    async fn test_small_payload_roundtrip() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        let data = b"hello payload channel".to_vec();

        let (send_state, recv_state) =
            transfer(data.clone(), data.len() as u64, dest.clone()).await;

        assert_eq!(send_state, TransferState::Completed);
        assert_eq!(recv_state, TransferState::Completed);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_multi_chunk_payload_exact_bytes() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        // 10 chunks plus a partial tail.
        let data: Vec<u8> = (0..CHUNK_SIZE * 10 + 1234).map(|i| (i % 251) as u8).collect();

        let (send_state, recv_state) =
            transfer(data.clone(), data.len() as u64, dest.clone()).await;

        assert_eq!(send_state, TransferState::Completed);
        assert_eq!(recv_state, TransferState::Completed);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_large_payload_final_progress_exact() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        // 1,280 chunks of 8 KiB.
        let total = 10 * 1024 * 1024usize;
        let data: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();

        let receiver = manager();
        let sender = manager();
        let mut events = receiver.subscribe();

        let (info, mut send_handle) = sender
            .offer(std::io::Cursor::new(data), total as u64)
            .await
            .unwrap();
        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), total as u64, dest.clone())
            .await
            .unwrap();

        assert_eq!(send_handle.wait().await, TransferState::Completed);
        assert_eq!(recv_handle.wait().await, TransferState::Completed);
        assert_eq!(
            tokio::fs::metadata(&dest).await.unwrap().len(),
            total as u64
        );

        // The final progress snapshot carries the exact totals, and the
        // Completed event follows it.
        let mut last_progress = None;
        let mut completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                TransferEvent::Progress(p) => last_progress = Some(p),
                TransferEvent::Completed { total: t, .. } => {
                    completed = true;
                    assert_eq!(t, total as u64);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert!(completed);
        let last = last_progress.unwrap();
        assert_eq!(last.transferred, total as u64);
        assert_eq!(last.total, total as u64);
    }

    #[tokio::test]
    async fn test_truncated_stream_is_incomplete_and_sink_deleted() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        let data: Vec<u8> = vec![7u8; CHUNK_SIZE * 3];

        // The receiver expects twice as many bytes as the sender has.
        let announced = (data.len() * 2) as u64;
        let receiver = manager();
        let sender = manager();
        let mut events = receiver.subscribe();

        let (info, mut send_handle) = sender
            .offer(std::io::Cursor::new(data.clone()), data.len() as u64)
            .await
            .unwrap();
        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), announced, dest.clone())
            .await
            .unwrap();

        assert_eq!(send_handle.wait().await, TransferState::Completed);
        assert_eq!(recv_handle.wait().await, TransferState::Failed);

        // The partial sink is gone.
        assert!(!dest.exists());

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if let TransferEvent::Failed { error, .. } = event {
                saw_failed = true;
                assert!(error.contains("incomplete"));
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_deletes_sink() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        let total = (CHUNK_SIZE * 64) as u64;

        // A source that stalls forever after half the payload, keeping the
        // session alive until the cancel lands.
        let half = vec![1u8; CHUNK_SIZE * 32];
        let stalled = std::io::Cursor::new(half).chain(tokio::io::empty().chain(PendingReader));

        let sender = manager();
        let receiver = manager();

        let (info, send_handle) = sender.offer(stalled, total).await.unwrap();
        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), total, dest.clone())
            .await
            .unwrap();

        // Let some chunks move, then cancel the receive side.
        tokio::time::sleep(Duration::from_millis(50)).await;
        recv_handle.cancel();

        let state = recv_handle.wait().await;
        assert_eq!(state, TransferState::Cancelled);
        assert!(!dest.exists());

        send_handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_before_connect() {
        let sender = manager();
        let data = vec![0u8; 128];

        let (_info, mut handle) = sender
            .offer(std::io::Cursor::new(data), 128)
            .await
            .unwrap();
        handle.cancel();

        assert_eq!(handle.wait().await, TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_state_tracking() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        let data = vec![9u8; 64];

        let sender = manager();
        let receiver = manager();

        let (info, mut send_handle) = sender
            .offer(std::io::Cursor::new(data), 64)
            .await
            .unwrap();
        assert!(sender.state_of(&send_handle.id()).is_some());

        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), 64, dest)
            .await
            .unwrap();

        send_handle.wait().await;
        recv_handle.wait().await;

        assert_eq!(
            sender.state_of(&send_handle.id()),
            Some(TransferState::Completed)
        );
        assert_eq!(
            receiver.state_of(&recv_handle.id()),
            Some(TransferState::Completed)
        );
    }

    #[tokio::test]
    async fn test_terminal_sessions_evicted_when_next_starts() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("payload.bin");
        let data = vec![3u8; 256];

        let sender = manager();
        let receiver = manager();

        let (info, mut send_handle) = sender
            .offer(std::io::Cursor::new(data), 256)
            .await
            .unwrap();
        let mut recv_handle = receiver
            .receive_to_file(loopback(info.port), 256, dest)
            .await
            .unwrap();
        send_handle.wait().await;
        recv_handle.wait().await;
        assert_eq!(
            sender.state_of(&send_handle.id()),
            Some(TransferState::Completed)
        );

        // Starting another session sweeps the finished one out of the map.
        let (_info, second) = sender
            .offer(std::io::Cursor::new(vec![0u8; 16]), 16)
            .await
            .unwrap();
        assert!(sender.state_of(&send_handle.id()).is_none());
        assert!(sender.state_of(&second.id()).is_some());
        second.cancel();
    }

    /// An AsyncRead that never resolves, for stalling a transfer.
    struct PendingReader;

    impl AsyncRead for PendingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Pending
        }
    }
}
