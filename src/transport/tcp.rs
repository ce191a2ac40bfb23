use super::{Bound, Inbound, InboundRequest, Transport};
use crate::config::{
    advertised_endpoint, endpoint_addr, resolve_endpoint, BindingsConfig, DEFAULT_PUB_PORT,
    DEFAULT_ROUTER_PORT,
};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Frames larger than this are rejected and the connection is dropped.
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// TCP transport with 4-byte big-endian length-prefixed frames.
pub struct TcpTransport {
    publish_binding: String,
    router_binding: String,
    advertise_host: String,
    /// Writer queues of the subscribers connected to our publish endpoint.
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Bytes>>>>,
    /// Outgoing subscriptions, one reader task each.
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
    publications_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub fn new(bindings: &BindingsConfig) -> Result<Self> {
        Ok(Self {
            publish_binding: resolve_endpoint(&bindings.publish, DEFAULT_PUB_PORT)?,
            router_binding: resolve_endpoint(&bindings.router, DEFAULT_ROUTER_PORT)?,
            advertise_host: bindings.advertise_host.clone(),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Mutex::new(HashMap::new()),
            publications_tx: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    async fn listen(&self, binding: &str) -> Result<(TcpListener, String)> {
        let listener = TcpListener::bind(endpoint_addr(binding))
            .await
            .map_err(|e| ClusterError::Transport(format!("Failed to bind {}: {}", binding, e)))?;
        let local = format!("tcp://{}", listener.local_addr()?);
        Ok((listener, advertised_endpoint(&local, &self.advertise_host)))
    }

    fn lock_err<T>(e: std::sync::PoisonError<T>) -> ClusterError {
        ClusterError::Transport(format!("Lock error: {}", e))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn bind(&self) -> Result<Bound> {
        let (pub_listener, publish) = self.listen(&self.publish_binding).await?;
        let (router_listener, router) = self.listen(&self.router_binding).await?;

        let (publications_tx, publications) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        *self.publications_tx.lock().map_err(Self::lock_err)? = Some(publications_tx);

        let (subscriber_tx, mut subscriber_rx) = mpsc::unbounded_channel::<TcpStream>();
        tokio::spawn(accept_loop(pub_listener, subscriber_tx, self.cancel.clone()));
        let subscribers = Arc::clone(&self.subscribers);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            while let Some(stream) = subscriber_rx.recv().await {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(subscriber_writer(stream, rx, cancel.clone()));
                match subscribers.lock() {
                    Ok(mut subscribers) => subscribers.push(tx),
                    Err(_) => break,
                }
            }
        });

        let (router_stream_tx, mut router_stream_rx) = mpsc::unbounded_channel::<TcpStream>();
        tokio::spawn(accept_loop(router_listener, router_stream_tx, self.cancel.clone()));
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            while let Some(stream) = router_stream_rx.recv().await {
                tokio::spawn(serve_router(stream, requests_tx.clone(), cancel.clone()));
            }
        });

        info!(%publish, %router, "TCP transport bound");
        Ok(Bound {
            publish,
            router,
            inbound: Inbound {
                publications,
                requests,
            },
        })
    }

    fn publish(&self, frame: Bytes) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        }
    }

    async fn connect(&self, publish_endpoint: &str) -> Result<()> {
        let publications_tx = self
            .publications_tx
            .lock()
            .map_err(Self::lock_err)?
            .clone()
            .ok_or_else(|| ClusterError::Transport("Transport is not bound".to_string()))?;

        let token = {
            let mut subscriptions = self.subscriptions.lock().map_err(Self::lock_err)?;
            if subscriptions.contains_key(publish_endpoint) {
                return Ok(());
            }
            let token = self.cancel.child_token();
            subscriptions.insert(publish_endpoint.to_string(), token.clone());
            token
        };

        tokio::spawn(subscription_reader(
            endpoint_addr(publish_endpoint).to_string(),
            publications_tx,
            token,
        ));
        debug!(endpoint = publish_endpoint, "Subscribed");
        Ok(())
    }

    async fn disconnect(&self, publish_endpoint: &str) {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            if let Some(token) = subscriptions.remove(publish_endpoint) {
                token.cancel();
                debug!(endpoint = publish_endpoint, "Unsubscribed");
            }
        }
    }

    async fn request(&self, router_endpoint: &str, payload: Bytes) -> Result<Bytes> {
        let mut stream = TcpStream::connect(endpoint_addr(router_endpoint))
            .await
            .map_err(|e| {
                ClusterError::Transport(format!("Failed to reach {}: {}", router_endpoint, e))
            })?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &payload).await?;
        read_frame(&mut stream).await?.ok_or_else(|| {
            ClusterError::Transport(format!("{} closed the connection", router_endpoint))
        })
    }

    async fn close(&self) {
        self.cancel.cancel();
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    streams: mpsc::UnboundedSender<TcpStream>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%addr, "Accepted connection");
                    if streams.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Accept failed: {}", e),
            },
        }
    }
}

async fn subscriber_writer(
    mut stream: TcpStream,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!("Subscriber went away: {}", e);
            break;
        }
    }
}

async fn serve_router(
    stream: TcpStream,
    requests: mpsc::UnboundedSender<InboundRequest>,
    cancel: CancellationToken,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(payload)) => payload,
                Ok(None) => break,
                Err(e) => {
                    debug!("Router connection error: {}", e);
                    break;
                }
            },
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = InboundRequest {
            payload,
            reply: reply_tx,
        };
        if requests.send(request).is_err() {
            break;
        }
        let reply = match reply_rx.await {
            Ok(reply) => reply,
            Err(_) => break,
        };
        if write_frame(&mut writer, &reply).await.is_err() {
            break;
        }
    }
}

async fn subscription_reader(
    addr: String,
    publications: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            stream = TcpStream::connect(&addr) => stream,
        };

        match stream {
            Ok(stream) => {
                let mut reader = BufReader::new(stream);
                loop {
                    let frame = tokio::select! {
                        _ = cancel.cancelled() => return,
                        frame = read_frame(&mut reader) => frame,
                    };
                    match frame {
                        Ok(Some(frame)) => {
                            if publications.send(frame).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!(%addr, "Subscription read error: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => debug!(%addr, "Subscription connect failed: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ClusterError::Transport(format!(
            "Frame of {} bytes exceeds the {} bytes limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on a clean end of stream.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let frame_len = u32::from_be_bytes(len_buf) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(ClusterError::Transport(format!(
            "Invalid frame size: {}",
            frame_len
        )));
    }
    let mut frame_buf = BytesMut::zeroed(frame_len);
    reader.read_exact(&mut frame_buf).await?;
    Ok(Some(frame_buf.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Bytes::from_static(b"hello"))
        );
        assert_eq!(read_frame(&mut server).await.unwrap(), Some(Bytes::new()));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        assert!(read_frame(&mut server).await.is_err());
    }
}
