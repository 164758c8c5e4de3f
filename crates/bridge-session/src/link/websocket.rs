use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use super::{Connector, LinkInbound, TransportLink};
use crate::error::LinkError;

const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Signaling links over a websocket to the relay.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        uri: &str,
        inbound: LinkInbound,
    ) -> Result<Box<dyn TransportLink>, LinkError> {
        let (stream, _) = connect_async(uri)
            .await
            .map_err(|err| LinkError::Connect(err.to_string()))?;
        debug!(link = inbound.link_id(), uri, "signaling link connected");

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(pump(stream, rx, inbound));
        Ok(Box::new(WebSocketLink {
            tx,
            task: Mutex::new(Some(task)),
        }))
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct WebSocketLink {
    tx: mpsc::UnboundedSender<Outbound>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&self, text: String) -> Result<(), LinkError> {
        self.tx
            .send(Outbound::Text(text))
            .map_err(|_| LinkError::Closed)
    }

    async fn close(&self) {
        let Some(mut task) = self.task.lock().take() else {
            return;
        };
        let _ = self.tx.send(Outbound::Close);
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

impl Drop for WebSocketLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

async fn pump(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: LinkInbound,
) {
    let (mut sink, mut source) = stream.split();
    let reason = loop {
        tokio::select! {
            next = outbound.recv() => match next {
                Some(Outbound::Text(text)) => {
                    trace!(link = inbound.link_id(), frame = %text, "signal out");
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        break Some(err.to_string());
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    // closed locally; nothing to report
                    return;
                }
            },
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !inbound.frame(text) {
                        return;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if !inbound.frame(text) {
                            return;
                        }
                    }
                    Err(_) => debug!(link = inbound.link_id(), "dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    break frame.map(|frame| frame.reason.to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Some(err.to_string()),
                None => break None,
            },
        }
    };
    debug!(link = inbound.link_id(), ?reason, "signaling link closed");
    inbound.closed(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test_timeout::tokio_timeout_test]
    async fn secure_urls_open_with_a_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut record_type = [0u8; 1];
            stream.read_exact(&mut record_type).await.unwrap();
            record_type[0]
        });

        let (inbound, _events) = LinkInbound::detached();
        let outcome = WebSocketConnector
            .connect(&format!("wss://127.0.0.1:{port}/ws"), inbound)
            .await;

        // 0x16: TLS handshake record, i.e. a ClientHello
        assert_eq!(server.await.unwrap(), 0x16);
        assert!(matches!(outcome, Err(LinkError::Connect(_))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn refused_port_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (inbound, _events) = LinkInbound::detached();
        let outcome = WebSocketConnector
            .connect(&format!("ws://127.0.0.1:{port}/ws"), inbound)
            .await;

        assert!(matches!(outcome, Err(LinkError::Connect(_))));
    }
}
