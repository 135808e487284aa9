use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use crate::server::Server;
use crate::session::{IncomingRpc, Session, SessionError};

/// Accepts websocket connections and registers each one as a peer.
pub async fn run(server: Arc<Server>, port: u16) {
    let addr: SocketAddr = (Ipv6Addr::UNSPECIFIED, port).into();
    let listener = TcpListener::bind(&addr).await.expect("listens on address");

    info!("Gateway listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tokio::spawn(handle_connection(server.clone(), stream, addr));
            }
            Err(err) => warn!("Failed to accept a connection: {}", err),
        }
    }
}

/// One frame of the wire envelope: requests carry a name, replies only
/// the id they answer.
#[derive(Debug, Deserialize)]
struct Envelope {
    id: u64,
    name: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
}

/// A [Session] over one websocket. Outbound frames funnel through a
/// single writer task, which keeps per-peer delivery in FIFO order.
struct WsSession {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: DashMap<u64, oneshot::Sender<Value>>,
    next_id: AtomicCell<u64>,
    closed: AtomicCell<bool>,
}

impl WsSession {
    fn envelope(&self, name: &str, params: Value) -> (u64, Message) {
        let id = self.next_id.fetch_add(1);
        let frame = json!({ "id": id, "name": name, "params": params });

        (id, Message::text(frame.to_string()))
    }

    fn resolve(&self, id: u64, result: Value) {
        if let Some((_, responder)) = self.pending.remove(&id) {
            let _ = responder.send(result);
        }
    }

    /// Fails every call still waiting for a reply.
    fn shutdown(&self) {
        self.closed.store(true);
        self.pending.clear();
    }
}

#[async_trait]
impl Session for WsSession {
    fn send(&self, name: &str, params: Value) {
        let (_, message) = self.envelope(name, params);
        let _ = self.outgoing.send(message);
    }

    async fn call(&self, name: &str, params: Value) -> Result<Value, SessionError> {
        if self.closed.load() {
            return Err(SessionError::Closed);
        }

        let (id, message) = self.envelope(name, params);
        let (responder, reply) = oneshot::channel();

        self.pending.insert(id, responder);

        if self.outgoing.send(message).is_err() {
            self.pending.remove(&id);
            return Err(SessionError::Closed);
        }

        reply.await.map_err(|_| SessionError::Closed)
    }

    fn close(&self) {
        let _ = self.outgoing.send(Message::Close(None));
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream, addr: SocketAddr) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            warn!("Handshake with {} failed: {}", addr, err);
            return;
        }
    };

    let (mut sink, mut source) = ws.split();
    let (outgoing, mut outbox) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let closing = matches!(message, Message::Close(_));

            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let session = Arc::new(WsSession {
        outgoing: outgoing.clone(),
        pending: Default::default(),
        next_id: AtomicCell::new(1),
        closed: AtomicCell::new(false),
    });

    let peer = server.register(session.clone());
    info!("Connection from {}", addr);

    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let envelope: Envelope = match serde_json::from_str(&text) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        warn!("Malformed message from {}: {}", addr, err);
                        continue;
                    }
                };

                match envelope.name {
                    // A request; the reply is correlated by id
                    Some(name) => {
                        let peer = peer.clone();
                        let outgoing = outgoing.clone();
                        let id = envelope.id;

                        tokio::spawn(async move {
                            let (responder, reply) = oneshot::channel();

                            peer.handle(IncomingRpc {
                                name,
                                params: envelope.params,
                                responder,
                            })
                            .await;

                            if let Ok(result) = reply.await {
                                let frame = json!({ "id": id, "result": result });
                                let _ = outgoing.send(Message::text(frame.to_string()));
                            }
                        });
                    }
                    // A reply to a server-initiated call
                    None => session.resolve(envelope.id, envelope.result),
                }
            }
            Ok(Message::Ping(payload)) => {
                let _ = outgoing.send(Message::Pong(payload));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!("Transport error from {}: {}", addr, err);
                break;
            }
        }
    }

    session.shutdown();
    peer.disconnect().await;
    writer.abort();

    info!("Connection {} closed", addr);
}
