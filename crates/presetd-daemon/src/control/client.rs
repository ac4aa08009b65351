//! Reconnecting client for a worker's line-delimited JSON control port.

use std::sync::Arc;
use std::time::Duration;

use presetd_core::protocol::{ClientMessage, ServerFrame, ServerMessage, parse_frame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ControlError;

/// Queue depth between [`ControlClient::send`] and the writer task.
const OUTBOUND_CAPACITY: usize = 16;

/// Auto-reconnecting client for a worker's control port.
///
/// Connection state is `Disconnected -> Connecting -> Connected` and back,
/// driven by a one-slot reconnect trigger. Only one connection is alive at
/// a time: a new connection waits until the previous reader has exited.
#[derive(Debug)]
pub struct ControlClient {
    reconnect_tx: mpsc::Sender<()>,
    reconnect_rx: Mutex<mpsc::Receiver<()>>,
    /// Sender into the current connection's writer, `None` while disconnected.
    outbound: Arc<watch::Sender<Option<mpsc::Sender<ClientMessage>>>>,
    conn_lock: Arc<Mutex<()>>,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl ControlClient {
    pub fn new(connect_timeout: Duration, send_timeout: Duration) -> Self {
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (outbound, _) = watch::channel(None);
        Self {
            reconnect_tx,
            reconnect_rx: Mutex::new(reconnect_rx),
            outbound: Arc::new(outbound),
            conn_lock: Arc::new(Mutex::new(())),
            connect_timeout,
            send_timeout,
        }
    }

    /// Arm the reconnect trigger. A trigger that is already armed is kept.
    pub fn request_reconnect(&self) {
        let _ = self.reconnect_tx.try_send(());
    }

    /// Whether a connection currently accepts outbound messages.
    pub fn is_connected(&self) -> bool {
        self.outbound.borrow().is_some()
    }

    /// Dial `localhost:port` and start the reader and writer tasks.
    ///
    /// Decoded server messages are published on `events`. Both tasks stop
    /// when `cancel` fires, when the peer closes the connection, or when the
    /// worker sends its invalid-message notice (which also re-arms the
    /// reconnect trigger).
    pub async fn connect(
        &self,
        cancel: &CancellationToken,
        port: u16,
        events: mpsc::Sender<ServerMessage>,
    ) -> Result<(), ControlError> {
        let guard = tokio::select! {
            () = cancel.cancelled() => return Err(ControlError::Cancelled),
            guard = Arc::clone(&self.conn_lock).lock_owned() => guard,
        };

        let timeout = self.connect_timeout;
        let stream = tokio::select! {
            () = cancel.cancelled() => return Err(ControlError::Cancelled),
            dialed = tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))) => {
                match dialed {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(source)) => return Err(ControlError::Connect { port, source }),
                    Err(_) => return Err(ControlError::ConnectTimeout { port, timeout }),
                }
            }
        };
        info!(port, "Connected to control port");

        let (read_half, write_half) = stream.into_split();
        let conn = cancel.child_token();
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        self.outbound.send_replace(Some(out_tx));

        tokio::spawn(write_loop(conn.clone(), write_half, out_rx));
        tokio::spawn(read_loop(
            conn,
            read_half,
            events,
            self.reconnect_tx.clone(),
            Arc::clone(&self.outbound),
            guard,
        ));
        Ok(())
    }

    /// Keep a connection to `port` alive until `cancel` fires.
    ///
    /// Connects once immediately, then again every time the reconnect
    /// trigger is armed. A failed attempt is logged and retried after
    /// `retry_delay`.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        port: u16,
        events: mpsc::Sender<ServerMessage>,
        retry_delay: Duration,
    ) {
        let mut triggers = self.reconnect_rx.lock().await;
        // Triggers left over from a previous run would cause a spurious reconnect.
        while triggers.try_recv().is_ok() {}
        self.request_reconnect();

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                }
            }

            match self.connect(&cancel, port, events.clone()).await {
                Ok(()) => {}
                Err(ControlError::Cancelled) => break,
                Err(e) => {
                    warn!(port, error = %e, "Control connection failed, retrying in {retry_delay:?}");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(retry_delay) => {}
                    }
                    self.request_reconnect();
                }
            }
        }
        debug!(port, "Control reconnect loop stopped");
    }

    /// Queue `msg` for the current connection.
    ///
    /// Waits at most the send timeout for a connection to accept it.
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ControlError> {
        let timeout = self.send_timeout;
        let mut current = self.outbound.subscribe();
        let queued = tokio::time::timeout(timeout, async move {
            let writer = current
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ControlError::Disconnected)?
                .clone();
            let Some(writer) = writer else {
                return Err(ControlError::Disconnected);
            };
            writer
                .send(msg)
                .await
                .map_err(|_| ControlError::Disconnected)
        })
        .await;

        match queued {
            Ok(result) => result,
            Err(_) => Err(ControlError::SendTimeout { timeout }),
        }
    }
}

async fn write_loop(
    conn: CancellationToken,
    mut socket: OwnedWriteHalf,
    mut queue: mpsc::Receiver<ClientMessage>,
) {
    loop {
        let msg = tokio::select! {
            () = conn.cancelled() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        let bytes = match msg.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to encode control message");
                continue;
            }
        };
        if let Err(e) = socket.write_all(&bytes).await {
            warn!(error = %e, "Failed to write control message");
            conn.cancel();
            break;
        }
        debug!(?msg, "Sent control message");
    }
}

async fn read_loop(
    conn: CancellationToken,
    socket: OwnedReadHalf,
    events: mpsc::Sender<ServerMessage>,
    reconnect: mpsc::Sender<()>,
    outbound: Arc<watch::Sender<Option<mpsc::Sender<ClientMessage>>>>,
    guard: OwnedMutexGuard<()>,
) {
    let mut lines = BufReader::new(socket).lines();
    loop {
        let line = tokio::select! {
            () = conn.cancelled() => break,
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Control connection closed by worker");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read from control connection");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match parse_frame(&line) {
            Ok(ServerFrame::Message(msg)) => {
                let delivered = tokio::select! {
                    () = conn.cancelled() => false,
                    sent = events.send(msg) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
            }
            Ok(ServerFrame::InvalidMessageNotice) => {
                error!("Worker rejected a control message and dropped the connection, reconnecting");
                let _ = reconnect.try_send(());
                break;
            }
            Err(e) => warn!(error = %e, line = %line, "Failed to decode control message"),
        }
    }

    conn.cancel();
    outbound.send_replace(None);
    drop(guard);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use presetd_core::protocol::{INVALID_MESSAGE_NOTICE, LayerChange, LayerNames};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn client() -> ControlClient {
        ControlClient::new(Duration::from_secs(1), Duration::from_millis(200))
    }

    async fn listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn decodes_inbound_messages() {
        let (listener, port) = listener().await;
        let client = client();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        client.connect(&cancel, port, tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"{\"LayerChange\":{\"new\":\"nav\"}}\n{\"LayerNames\":{\"names\":[\"base\",\"nav\"]}}\n")
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            ServerMessage::LayerChange(LayerChange { new: "nav".into() })
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second,
            ServerMessage::LayerNames(LayerNames {
                names: vec!["base".into(), "nav".into()],
            })
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn undecodable_lines_are_skipped() {
        let (listener, port) = listener().await;
        let client = client();
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        client.connect(&cancel, port, tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"garbage\n\n{\"ConfigFileReload\":{\"new\":\"a.kbd\"}}\n")
            .await
            .unwrap();

        let msg = rx.recv().await.unwrap();
        assert!(matches!(msg, ServerMessage::ConfigFileReload(_)));
        cancel.cancel();
    }

    #[tokio::test]
    async fn send_writes_json_without_newline() {
        let (listener, port) = listener().await;
        let client = client();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        client.connect(&cancel, port, tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        client.send(ClientMessage::RequestLayerNames {}).await.unwrap();

        let expected = b"{\"RequestLayerNames\":{}}";
        let mut buf = vec![0u8; expected.len()];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        cancel.cancel();
    }

    #[tokio::test]
    async fn send_without_connection_times_out() {
        let client = client();
        let started = std::time::Instant::now();
        let err = client
            .send(ClientMessage::RequestLayerNames {})
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::SendTimeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let (listener, port) = listener().await;
        drop(listener);
        let client = client();
        let (tx, _rx) = mpsc::channel(8);
        let err = client
            .connect(&CancellationToken::new(), port, tx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ControlError::Connect { .. } | ControlError::ConnectTimeout { .. }
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn peer_close_marks_disconnected() {
        let (listener, port) = listener().await;
        let client = client();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        client.connect(&cancel, port, tx).await.unwrap();
        assert!(client.is_connected());
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        let mut state = client.outbound.subscribe();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(Option::is_none))
            .await
            .unwrap()
            .unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn cancel_frees_reader_blocked_on_full_event_queue() {
        let (listener, port) = listener().await;
        let client = client();
        let first = CancellationToken::new();
        let (tx, _undrained) = mpsc::channel(1);

        client.connect(&first, port, tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        peer.write_all(b"{\"LayerChange\":{\"new\":\"a\"}}\n".repeat(64).as_slice())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.cancel();

        let second = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);
        tokio::time::timeout(Duration::from_secs(2), client.connect(&second, port, tx))
            .await
            .expect("previous reader released the connection")
            .unwrap();
        second.cancel();
    }

    #[tokio::test]
    async fn invalid_message_notice_reconnects_once() {
        let (listener, port) = listener().await;
        let client = Arc::new(client());
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let runner = Arc::clone(&client);
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            runner
                .run(run_cancel, port, tx, Duration::from_millis(50))
                .await;
        });

        let (mut first, _) = listener.accept().await.unwrap();
        first
            .write_all(format!("{INVALID_MESSAGE_NOTICE}\n").as_bytes())
            .await
            .unwrap();

        let (_second, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("client reconnects after the notice")
            .unwrap();

        let third = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(third.is_err(), "only one reconnect is expected");
        assert!(rx.try_recv().is_err(), "the notice is not surfaced as a message");

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn run_retries_until_port_opens() {
        let (listener, port) = listener().await;
        drop(listener);
        let client = Arc::new(client());
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let runner = Arc::clone(&client);
        let run_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            runner
                .run(run_cancel, port, tx, Duration::from_millis(50))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("client retries")
            .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }
}
