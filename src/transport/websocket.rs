use super::{Transport, TransportFactory};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long `dispose` waits for the close frame to go out
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

struct Shared {
    sink: tokio::sync::Mutex<Option<WsSink>>,
    source: tokio::sync::Mutex<Option<WsSource>>,
    queue: Mutex<VecDeque<String>>,
    queued: Notify,
    connected: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn pop(&self) -> Option<String> {
        match self.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

/// `tokio-tungstenite` client transport.
///
/// Outgoing frames go through a queue drained by a writer task, so `send`
/// never blocks the caller; each write is bounded by the send timeout.
pub struct WebSocketTransport {
    url: String,
    send_timeout: Duration,
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    pub fn new(url: &str, send_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            send_timeout,
            shared: Arc::new(Shared {
                sink: tokio::sync::Mutex::new(None),
                source: tokio::sync::Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queued: Notify::new(),
                connected: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn spawn_writer(&self) {
        let shared = Arc::clone(&self.shared);
        let send_timeout = self.send_timeout;

        tokio::spawn(async move {
            loop {
                let text = match shared.pop() {
                    Some(text) => text,
                    None => {
                        tokio::select! {
                            _ = shared.cancel.cancelled() => break,
                            _ = shared.queued.notified() => {}
                        }
                        continue;
                    }
                };

                let mut guard = shared.sink.lock().await;
                let Some(sink) = guard.as_mut() else { break };

                // Dispose must not wait behind a stalled write
                let sent = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    sent = tokio::time::timeout(send_timeout, sink.send(Message::Text(text))) => sent,
                };

                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(error = %e, "WebSocket write failed");
                        shared.mark_closed();
                        break;
                    }
                    Err(_) => {
                        warn!(timeout_ms = send_timeout.as_millis() as u64, "WebSocket write timed out");
                        shared.mark_closed();
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, timeout: Duration) -> Result<()> {
        if self.shared.cancel.is_cancelled() {
            bail!("Transport already disposed");
        }

        let (stream, response) = tokio::time::timeout(timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| anyhow!("Timed out after {:?} connecting to {}", timeout, self.url))?
            .with_context(|| format!("Failed to connect to {}", self.url))?;

        debug!(url = %self.url, status = %response.status(), "WebSocket connected");

        let (sink, source) = stream.split();
        *self.shared.sink.lock().await = Some(sink);
        *self.shared.source.lock().await = Some(source);
        self.shared.connected.store(true, Ordering::SeqCst);

        self.spawn_writer();
        Ok(())
    }

    fn send(&self, text: String) -> Result<()> {
        if !self.is_connected() {
            bail!("WebSocket is not connected");
        }
        self.shared
            .queue
            .lock()
            .map_err(|_| anyhow!("Send queue mutex poisoned"))?
            .push_back(text);
        self.shared.queued.notify_one();
        Ok(())
    }

    fn clear_send_queue(&self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            if !queue.is_empty() {
                debug!(dropped = queue.len(), "Cleared send queue");
            }
            queue.clear();
        }
    }

    async fn receive_loop(&self, on_message: &(dyn Fn(String) + Send + Sync)) {
        let mut guard = self.shared.source.lock().await;
        let Some(source) = guard.as_mut() else {
            return;
        };

        loop {
            let next = tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => on_message(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => on_message(text),
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(url = %self.url, frame = ?frame, "WebSocket closed by server");
                    break;
                }
                // Ping/pong handled by tungstenite
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(url = %self.url, error = %e, "WebSocket read failed");
                    break;
                }
                None => break,
            }
        }

        self.shared.mark_closed();
    }

    async fn dispose(&self) {
        self.shared.mark_closed();
        self.clear_send_queue();

        let sink = self.shared.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;
        }
        self.shared.source.lock().await.take();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

/// Creates [`WebSocketTransport`]s sharing one send timeout
pub struct WebSocketTransportFactory {
    send_timeout: Duration,
}

impl WebSocketTransportFactory {
    pub fn new(send_timeout: Duration) -> Self {
        Self { send_timeout }
    }
}

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self, url: &str) -> Arc<dyn Transport> {
        Arc::new(WebSocketTransport::new(url, self.send_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_connect_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_secs(1));
        assert!(!transport.is_connected());
        assert!(transport.send("[]".to_string()).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_secs(1));
        let result = transport.connect(Duration::from_millis(500)).await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_connect_after_dispose_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_secs(1));
        transport.dispose().await;
        transport.dispose().await;
        assert!(transport.connect(Duration::from_millis(500)).await.is_err());
    }

    #[tokio::test]
    async fn test_receive_loop_without_connection_returns() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_secs(1));
        tokio::time::timeout(Duration::from_millis(100), transport.receive_loop(&|_| {}))
            .await
            .expect("receive loop should return when never connected");
    }

    #[tokio::test]
    async fn test_dispose_interrupts_stalled_write() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Never read, so the client's writes back up
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(ws);
        });

        let transport = WebSocketTransport::new(&url, Duration::from_secs(30));
        transport.connect(Duration::from_secs(2)).await.unwrap();
        let chunk = "x".repeat(1024 * 1024);
        for _ in 0..64 {
            transport.send(chunk.clone()).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(3), transport.dispose())
            .await
            .expect("dispose waited on the stalled write");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!transport.is_connected());
        server.abort();
    }
}
