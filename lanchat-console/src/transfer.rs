//! Transfer engine: the socket side of file transfers.
//!
//! Each accepted session gets its own task. The receiver listens on the first free port and gives the
//! sender a bounded window to connect; the sender connects to the port it was told. Both copy
//! fixed-size chunks and report through the core, which owns every state change. Cancellation
//! is a watch flag raced against every socket wait, so a cancel unblocks a pending accept,
//! connect, read or write at once and drops the sockets.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lanchat_core::transfer::{ACCEPT_TIMEOUT, DEFAULT_CHUNK_SIZE};
use lanchat_core::{Action, ChatCore, SessionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::events::EventBus;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// First port tried for incoming streams.
    pub transfer_port: u16,
    pub port_attempts: u16,
    /// Window for the sender to connect once an offer is accepted.
    pub accept_timeout: Duration,
    pub chunk_size: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            transfer_port: 50250,
            port_attempts: 10,
            accept_timeout: ACCEPT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("no such transfer")]
    UnknownSession,
    #[error("no free transfer port between {base} and {last}")]
    NoPort { base: u16, last: u16 },
}

/// Why a stream stopped early.
#[derive(Debug)]
enum Stop {
    Canceled,
    /// The core no longer wants bytes for this session.
    Abandoned,
    Io(std::io::Error),
    TimedOut,
}

impl From<std::io::Error> for Stop {
    fn from(e: std::io::Error) -> Self {
        Stop::Io(e)
    }
}

type Core = Arc<Mutex<ChatCore>>;

pub struct TransferEngine {
    core: Core,
    events: Arc<EventBus>,
    settings: EngineSettings,
    cancels: Mutex<HashMap<SessionId, watch::Sender<bool>>>,
}

impl TransferEngine {
    pub fn new(core: Core, events: Arc<EventBus>, settings: EngineSettings) -> Self {
        Self {
            core,
            events,
            settings,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    fn core(&self) -> std::sync::MutexGuard<'_, ChatCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: SessionId) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        rx
    }

    /// Close whatever the session's task holds. No-op for sessions without a task.
    pub fn stop(&self, id: SessionId) {
        let tx = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
    }

    /// Stop every running transfer task.
    pub fn stop_all(&self) {
        let all: Vec<_> = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, tx) in all {
            let _ = tx.send(true);
        }
    }

    pub fn running(&self) -> usize {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Listen for an accepted offer. Returns the port to announce in the accept message.
    pub async fn start_receiving(self: &Arc<Self>, id: SessionId) -> Result<u16, EngineError> {
        let (path, size) = {
            let core = self.core();
            let s = core.session(id).ok_or(EngineError::UnknownSession)?;
            (s.path().to_path_buf(), s.size())
        };
        let (listener, port) = self.bind_transfer_port().await?;
        let cancel = self.register(id);
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.receive(id, listener, path, size, cancel).await;
            engine.conclude(id, outcome);
        });
        Ok(port)
    }

    /// Connect to the receiver at `addr` and stream the session's file.
    pub fn start_sending(self: &Arc<Self>, id: SessionId, addr: SocketAddr) {
        let file = {
            let core = self.core();
            core.session(id).map(|s| (s.path().to_path_buf(), s.size()))
        };
        let Some((path, size)) = file else {
            log::warn!("cannot send unknown transfer {id}");
            return;
        };
        let cancel = self.register(id);
        let engine = self.clone();
        tokio::spawn(async move {
            let outcome = engine.send(id, addr, path, size, cancel).await;
            engine.conclude(id, outcome);
        });
    }

    async fn bind_transfer_port(&self) -> Result<(TcpListener, u16), EngineError> {
        let base = self.settings.transfer_port;
        let last = base.saturating_add(self.settings.port_attempts.saturating_sub(1));
        for port in base..=last {
            match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(l) => return Ok((l, port)),
                Err(e) => log::warn!("transfer port {port} unavailable: {e}"),
            }
        }
        Err(EngineError::NoPort { base, last })
    }

    async fn receive(
        &self,
        id: SessionId,
        listener: TcpListener,
        path: PathBuf,
        size: u64,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), Stop> {
        let accepted = tokio::select! {
            r = tokio::time::timeout(self.settings.accept_timeout, listener.accept()) => r,
            _ = canceled(&mut cancel) => return Err(Stop::Canceled),
        };
        drop(listener);
        let (mut stream, from) = accepted.map_err(|_| Stop::TimedOut)??;
        log::debug!("transfer {id}: sender connected from {from}");
        // Never overwrite: a file that appeared since the offer was accepted fails the transfer.
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        self.connected(id)?;

        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        let mut received = 0u64;
        while received < size {
            let want = buf.len().min((size - received) as usize);
            let n = tokio::select! {
                r = stream.read(&mut buf[..want]) => r?,
                _ = canceled(&mut cancel) => return Err(Stop::Canceled),
            };
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            received += n as u64;
            self.progress(id, n as u64)?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn send(
        &self,
        id: SessionId,
        addr: SocketAddr,
        path: PathBuf,
        size: u64,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), Stop> {
        let mut file = tokio::fs::File::open(&path).await?;
        let connecting = tokio::select! {
            r = tokio::time::timeout(self.settings.accept_timeout, TcpStream::connect(addr)) => r,
            _ = canceled(&mut cancel) => return Err(Stop::Canceled),
        };
        let mut stream = connecting.map_err(|_| Stop::TimedOut)??;
        log::debug!("transfer {id}: connected to {addr}");
        self.connected(id)?;

        let mut buf = vec![0u8; self.settings.chunk_size.max(1)];
        let mut sent = 0u64;
        while sent < size {
            let want = buf.len().min((size - sent) as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            tokio::select! {
                r = stream.write_all(&buf[..n]) => r?,
                _ = canceled(&mut cancel) => return Err(Stop::Canceled),
            }
            sent += n as u64;
            self.progress(id, n as u64)?;
        }
        stream.shutdown().await?;
        Ok(())
    }

    fn connected(&self, id: SessionId) -> Result<(), Stop> {
        let actions = self.core().transfer_connected(id).map_err(|_| Stop::Abandoned)?;
        self.publish(actions);
        Ok(())
    }

    fn progress(&self, id: SessionId, n: u64) -> Result<(), Stop> {
        let action = self.core().transfer_progress(id, n).map_err(|_| Stop::Abandoned)?;
        self.publish(action);
        Ok(())
    }

    /// Report the outcome once and release the session.
    fn conclude(&self, id: SessionId, outcome: Result<(), Stop>) {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        let actions = {
            let mut core = self.core();
            let actions = match outcome {
                Ok(()) => core.transfer_finished(id),
                Err(Stop::Canceled) | Err(Stop::Abandoned) => Vec::new(),
                Err(Stop::TimedOut) => {
                    log::info!("transfer {id}: peer did not connect in time");
                    core.transfer_failed(id)
                }
                Err(Stop::Io(e)) => {
                    log::warn!("transfer {id}: {e}");
                    core.transfer_failed(id)
                }
            };
            core.release(id);
            actions
        };
        self.publish(actions);
    }

    fn publish(&self, actions: impl IntoIterator<Item = Action>) {
        for action in actions {
            match action {
                Action::Notify(event) => {
                    if let lanchat_core::Event::Transfer {
                        ref file_name,
                        state,
                        ..
                    } = event
                    {
                        log::info!("transfer of '{file_name}': {state}");
                    }
                    self.events.publish(event)
                }
                other => log::debug!("engine ignoring {other:?}"),
            }
        }
    }
}

/// Resolves once the flag is raised or its sender is gone.
async fn canceled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanchat_core::{Body, Event, Message, PeerCode, PeerIdentity, TransferState};
    use std::path::Path;
    use tokio::sync::mpsc::UnboundedReceiver;

    const A: PeerCode = PeerCode(111);
    const B: PeerCode = PeerCode(222);

    fn localhost() -> std::net::IpAddr {
        Ipv4Addr::LOCALHOST.into()
    }

    struct Side {
        core: Core,
        engine: Arc<TransferEngine>,
        events: UnboundedReceiver<Event>,
    }

    fn side(code: PeerCode, nick: &str, dir: &Path, settings: EngineSettings) -> Side {
        let core = Arc::new(Mutex::new(ChatCore::new(
            PeerIdentity::me(code, nick, "test", 0),
            0,
            dir,
        )));
        let bus = Arc::new(EventBus::new());
        let (_, events) = bus.subscribe();
        let engine = Arc::new(TransferEngine::new(core.clone(), bus, settings));
        Side {
            core,
            engine,
            events,
        }
    }

    fn settings(base: u16) -> EngineSettings {
        EngineSettings {
            transfer_port: base,
            port_attempts: 50,
            accept_timeout: Duration::from_secs(5),
            chunk_size: 256,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    /// Wait for the next terminal transfer event, collecting progress percents on the way.
    async fn outcome(events: &mut UnboundedReceiver<Event>) -> (TransferState, Vec<u8>) {
        let mut percents = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("no transfer outcome in time")
                .expect("bus closed");
            match event {
                Event::TransferProgress { percent, .. } => percents.push(percent),
                Event::Transfer { state, .. } if state.is_terminal() => {
                    return (state, percents)
                }
                _ => {}
            }
        }
    }

    /// B has an undecided offer of `name` from A.
    fn offer_to(b: &Side, name: &str, size: u64) -> SessionId {
        let mut core = b.core.lock().unwrap();
        core.on_message_received(Message::new(A, "Anna", Body::Logon), localhost(), 0);
        core.on_message_received(
            Message::new(
                A,
                "Anna",
                Body::FileOffer {
                    to: B,
                    size,
                    hash: 0,
                    file_name: name.into(),
                },
            ),
            localhost(),
            1,
        );
        core.transfers().find(A, name).unwrap().id()
    }

    #[tokio::test]
    async fn file_arrives_intact_with_rising_progress() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 251) as u8).collect();
        let source = src.path().join("notes.txt");
        std::fs::write(&source, &data).unwrap();

        let mut a = side(A, "Anna", src.path(), settings(free_port()));
        let mut b = side(B, "Bob", dst.path(), settings(free_port()));

        let (send_id, offer) = {
            let mut core = a.core.lock().unwrap();
            core.on_message_received(Message::new(B, "Bob", Body::Logon), localhost(), 0);
            core.offer_file(B, &source, 2048).unwrap()
        };
        let recv_id = {
            let mut core = b.core.lock().unwrap();
            core.on_message_received(offer, localhost(), 1);
            core.transfers().find(A, "notes.txt").unwrap().id()
        };

        let port = b.engine.start_receiving(recv_id).await.unwrap();
        let accept = b.core.lock().unwrap().accept_offer(recv_id, port).unwrap();
        let actions = a.core.lock().unwrap().on_message_received(accept, localhost(), 2);
        for action in actions {
            if let Action::StartSending { session, addr } = action {
                assert_eq!(session, send_id);
                a.engine.start_sending(session, addr);
            }
        }

        let (sent, _) = outcome(&mut a.events).await;
        let (received, percents) = outcome(&mut b.events).await;
        assert_eq!(sent, TransferState::Completed);
        assert_eq!(received, TransferState::Completed);
        assert!(percents.windows(2).all(|w| w[0] < w[1]), "{percents:?}");
        assert_eq!(percents.last(), Some(&100));
        assert_eq!(std::fs::read(dst.path().join("notes.txt")).unwrap(), data);

        // Both sides let go of the finished sessions.
        assert!(a.core.lock().unwrap().transfers().is_empty());
        assert!(b.core.lock().unwrap().transfers().is_empty());
        assert_eq!(a.engine.running(), 0);
    }

    #[tokio::test]
    async fn unconnected_accept_times_out_as_failed() {
        let dst = tempfile::tempdir().unwrap();
        let mut s = settings(free_port());
        s.accept_timeout = Duration::from_millis(200);
        let mut b = side(B, "Bob", dst.path(), s);
        let id = offer_to(&b, "late.bin", 10);
        let port = b.engine.start_receiving(id).await.unwrap();
        b.core.lock().unwrap().accept_offer(id, port).unwrap();

        let (state, _) = outcome(&mut b.events).await;
        assert_eq!(state, TransferState::Failed);
        assert!(b.core.lock().unwrap().session(id).is_none());
        // The listening port is closed again.
        assert!(std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok());
    }

    #[tokio::test]
    async fn cancel_unblocks_pending_accept() {
        let dst = tempfile::tempdir().unwrap();
        let mut b = side(B, "Bob", dst.path(), settings(free_port()));
        let id = offer_to(&b, "big.iso", 1 << 20);
        let port = b.engine.start_receiving(id).await.unwrap();
        b.core.lock().unwrap().accept_offer(id, port).unwrap();

        let actions = b.core.lock().unwrap().cancel_transfer(id).unwrap();
        for action in actions {
            match action {
                Action::StopTransfer(s) => b.engine.stop(s),
                Action::Notify(e) => assert!(matches!(
                    e,
                    Event::Transfer { state: TransferState::Canceled, .. }
                )),
                other => panic!("unexpected {other:?}"),
            }
        }
        // Stopping twice is harmless.
        b.engine.stop(id);

        // No failure is reported after the cancel, and the session is released.
        tokio::time::timeout(Duration::from_secs(5), async {
            while b.core.lock().unwrap().session(id).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(b.events.try_recv().is_err());
        assert!(std::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok());
    }

    #[tokio::test]
    async fn sender_fails_when_nobody_listens() {
        let src = tempfile::tempdir().unwrap();
        let source = src.path().join("a.txt");
        std::fs::write(&source, b"hello").unwrap();
        let mut a = side(A, "Anna", src.path(), settings(free_port()));
        let id = {
            let mut core = a.core.lock().unwrap();
            core.on_message_received(Message::new(B, "Bob", Body::Logon), localhost(), 0);
            let (id, _) = core.offer_file(B, &source, 5).unwrap();
            let accept = Message::new(
                B,
                "Bob",
                Body::FileAccept {
                    to: A,
                    port: 1,
                    hash: 0,
                    file_name: "a.txt".into(),
                },
            );
            core.on_message_received(accept, localhost(), 1);
            id
        };
        a.engine
            .start_sending(id, SocketAddr::from((Ipv4Addr::LOCALHOST, free_port())));
        let (state, _) = outcome(&mut a.events).await;
        assert_eq!(state, TransferState::Failed);
    }

    /// Carry out a local cancel the way the messenger does.
    fn cancel(side: &Side, id: SessionId) {
        let actions = side.core.lock().unwrap().cancel_transfer(id).unwrap();
        for action in actions {
            match action {
                Action::StopTransfer(s) => side.engine.stop(s),
                Action::Notify(e) => assert!(matches!(
                    e,
                    Event::Transfer { state: TransferState::Canceled, .. }
                )),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    async fn wait_for_state(side: &Side, id: SessionId, want: TransferState) {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let state = side.core.lock().unwrap().session(id).map(|s| s.state());
                if state == Some(want) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    /// Wait until the engine has released the session, then check nothing failed meanwhile.
    async fn released_without_failure(side: &mut Side, id: SessionId) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while side.core.lock().unwrap().session(id).is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        while let Ok(event) = side.events.try_recv() {
            assert!(
                !matches!(event, Event::Transfer { state, .. } if state.is_terminal()),
                "{event:?}"
            );
        }
        assert_eq!(side.engine.running(), 0);
    }

    #[tokio::test]
    async fn existing_destination_is_not_overwritten() {
        let dst = tempfile::tempdir().unwrap();
        let mut b = side(B, "Bob", dst.path(), settings(free_port()));
        let id = offer_to(&b, "keep.txt", 5);
        let port = b.engine.start_receiving(id).await.unwrap();
        b.core.lock().unwrap().accept_offer(id, port).unwrap();
        // Someone else wrote the file after the offer was accepted.
        std::fs::write(dst.path().join("keep.txt"), b"mine").unwrap();

        let mut sender = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let _ = sender.write_all(b"hello").await;

        let (state, _) = outcome(&mut b.events).await;
        assert_eq!(state, TransferState::Failed);
        assert_eq!(std::fs::read(dst.path().join("keep.txt")).unwrap(), b"mine");
        assert!(b.core.lock().unwrap().session(id).is_none());
    }

    #[tokio::test]
    async fn receiver_cancel_mid_stream_closes_the_socket() {
        let dst = tempfile::tempdir().unwrap();
        let mut b = side(B, "Bob", dst.path(), settings(free_port()));
        let id = offer_to(&b, "big.iso", 1 << 20);
        let port = b.engine.start_receiving(id).await.unwrap();
        b.core.lock().unwrap().accept_offer(id, port).unwrap();

        let mut sender = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        sender.write_all(&[7u8; 1000]).await.unwrap();
        wait_for_state(&b, id, TransferState::Transferring).await;

        cancel(&b, id);
        assert_eq!(
            b.core.lock().unwrap().session(id).map(|s| s.state()),
            Some(TransferState::Canceled)
        );

        // The remote end sees the stream go away.
        let mut buf = [0u8; 16];
        let closed = tokio::time::timeout(Duration::from_secs(5), sender.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(closed, Ok(0) | Err(_)), "{closed:?}");
        released_without_failure(&mut b, id).await;
    }

    #[tokio::test]
    async fn sender_cancel_mid_stream_closes_the_socket() {
        let src = tempfile::tempdir().unwrap();
        let source = src.path().join("big.bin");
        let size: u64 = 32 << 20;
        std::fs::write(&source, vec![3u8; size as usize]).unwrap();
        let mut s = settings(free_port());
        s.chunk_size = 64 * 1024;
        let mut a = side(A, "Anna", src.path(), s);

        // A receiver that reads nothing until told to.
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let id = {
            let mut core = a.core.lock().unwrap();
            core.on_message_received(Message::new(B, "Bob", Body::Logon), localhost(), 0);
            let (id, _) = core.offer_file(B, &source, size).unwrap();
            let accept = Message::new(
                B,
                "Bob",
                Body::FileAccept {
                    to: A,
                    port,
                    hash: 0,
                    file_name: "big.bin".into(),
                },
            );
            core.on_message_received(accept, localhost(), 1);
            id
        };
        a.engine
            .start_sending(id, SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        let (mut receiver, _) = listener.accept().await.unwrap();
        wait_for_state(&a, id, TransferState::Transferring).await;

        cancel(&a, id);
        assert_eq!(
            a.core.lock().unwrap().session(id).map(|s| s.state()),
            Some(TransferState::Canceled)
        );

        let mut total = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match receiver.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => total += n as u64,
                }
            }
        })
        .await;
        assert!(drained.is_ok(), "stream still open");
        assert!(total < size);
        released_without_failure(&mut a, id).await;
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let dst = tempfile::tempdir().unwrap();
        let b = side(B, "Bob", dst.path(), settings(free_port()));
        assert!(matches!(
            b.engine.start_receiving(SessionId::new()).await,
            Err(EngineError::UnknownSession)
        ));
    }
}
