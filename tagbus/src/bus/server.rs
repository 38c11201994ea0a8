//! The bus server: a TCP listener plus the global name↔id maps, the
//! last-value store and the subscription fabric.
//!
//! Each accepted connection gets a 16-bit identity, a framed read loop
//! and its own writer task, so one slow or bulky subscriber never blocks
//! the others. All maps are sharded (dashmap), which serialises SET, SUB
//! and GET per tag as required by the single-writer reasoning model.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{fragment, Command, Frame, FrameCodec, Message, Reassembler};

use super::BusError;

/// Per-connection outbound queue depth. Overflow means the peer cannot
/// keep up; the connection is dropped and the peer reconnects fresh.
const OUTBOUND_QUEUE: usize = 4096;

struct Stored {
    payload: Bytes,
    time_us: u64,
    author: u16,
}

struct TagRecord {
    name: String,
    stored: Option<Stored>,
    subscribers: HashSet<u16>,
}

struct ConnHandle {
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

struct ServerState {
    names: DashMap<String, u16>,
    records: DashMap<u16, TagRecord>,
    conns: DashMap<u16, ConnHandle>,
    // u32 counters so exhaustion of the 16-bit spaces is detected
    // without aliasing live identities.
    next_tag: AtomicU32,
    next_conn: AtomicU32,
}

/// The bus server. Bind, then `serve()` until a fatal fault.
pub struct BusServer {
    listener: TcpListener,
    tus: usize,
    state: Arc<ServerState>,
}

impl BusServer {
    pub async fn bind(addr: SocketAddr, tus: usize) -> io::Result<BusServer> {
        let listener = TcpListener::bind(addr).await?;
        Ok(BusServer {
            listener,
            tus,
            state: Arc::new(ServerState {
                names: DashMap::new(),
                records: DashMap::new(),
                conns: DashMap::new(),
                next_tag: AtomicU32::new(1),
                next_conn: AtomicU32::new(1),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails or the connection id
    /// space runs out. Tag state lives for the life of this call.
    pub async fn serve(self) -> Result<(), BusError> {
        info!(addr = %self.listener.local_addr()?, tus = self.tus, "tag bus listening");
        loop {
            let (socket, peer) = self.listener.accept().await?;
            let conn_id = self
                .state
                .allocate_conn()
                .ok_or(BusError::ConnIdsExhausted)?;
            debug!(%peer, conn_id, "connection accepted");
            tokio::spawn(connection(self.state.clone(), socket, conn_id, self.tus));
        }
    }
}

async fn connection(state: Arc<ServerState>, socket: TcpStream, conn_id: u16, tus: usize) {
    if let Err(error) = socket.set_nodelay(true) {
        debug!(conn_id, %error, "set_nodelay failed");
    }
    let (read_half, write_half) = socket.into_split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    let cancel = CancellationToken::new();
    state.conns.insert(
        conn_id,
        ConnHandle {
            tx: tx.clone(),
            cancel: cancel.clone(),
        },
    );

    let writer_tus = tus;
    let writer = tokio::spawn(async move {
        let mut framed = FramedWrite::new(write_half, FrameCodec::new(writer_tus));
        while let Some(message) = rx.recv().await {
            for frame in fragment(message, writer_tus) {
                if let Err(error) = framed.send(frame).await {
                    debug!(conn_id, %error, "write failed");
                    return;
                }
            }
        }
    });

    // Hello: tell the peer its connection id and the session TUS. Tag
    // ids start at 1, so tag_id 0 marks this frame unambiguously.
    let hello = Message::new(
        Command::Id,
        0,
        tus as u64,
        conn_id,
        Bytes::from_static(b"__bus__"),
    );
    let _ = tx.send(hello).await;

    let mut framed = FramedRead::new(read_half, FrameCodec::new(tus));
    let mut assembler = Reassembler::default();
    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            _ = cancel.cancelled() => break,
        };
        let frame: Frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(error)) => {
                warn!(conn_id, %error, "protocol violation, closing");
                state.post(conn_id, Message::error(0, &error.to_string()));
                break;
            }
            None => break,
        };
        match assembler.push(frame) {
            Ok(Some(message)) => state.dispatch(conn_id, message),
            Ok(None) => {}
            Err(error) => {
                warn!(conn_id, %error, "reassembly fault, closing");
                state.post(conn_id, Message::error(0, &error.to_string()));
                break;
            }
        }
    }

    state.drop_conn(conn_id);
    drop(tx);
    let _ = writer.await;
    debug!(conn_id, "connection finished");
}

impl ServerState {
    fn allocate_conn(&self) -> Option<u16> {
        let id = self.next_conn.fetch_add(1, Ordering::SeqCst);
        if id > u16::MAX as u32 {
            return None;
        }
        Some(id as u16)
    }

    fn allocate_tag(&self) -> Option<u16> {
        let id = self.next_tag.fetch_add(1, Ordering::SeqCst);
        if id > u16::MAX as u32 {
            return None;
        }
        Some(id as u16)
    }

    fn dispatch(&self, conn_id: u16, message: Message) {
        match message.command {
            Command::Id => self.handle_id(conn_id, message),
            Command::Set => self.handle_set(conn_id, message),
            Command::Get => self.reply_current(conn_id, message.tag_id),
            Command::Sub => self.handle_sub(conn_id, message),
            Command::Rta => self.handle_rta(conn_id, message),
            Command::Err => {
                warn!(
                    conn_id,
                    "ERR from peer: {}",
                    String::from_utf8_lossy(&message.payload)
                );
            }
        }
    }

    /// Resolve or allocate the id for a name and broadcast the mapping,
    /// so every peer learns it without per-peer negotiation.
    fn handle_id(&self, conn_id: u16, message: Message) {
        let name = match std::str::from_utf8(&message.payload) {
            Ok(name) if !name.is_empty() => name.to_owned(),
            _ => {
                self.post(conn_id, Message::error(0, "bad tag name"));
                return;
            }
        };

        let id = match self.names.get(&name).map(|entry| *entry) {
            Some(id) => id,
            None => {
                let Some(allocated) = self.allocate_tag() else {
                    self.post(conn_id, Message::error(0, "tag id space exhausted"));
                    return;
                };
                // A racing registration may have won; its id stands and
                // ours is simply never used.
                let id = *self.names.entry(name.clone()).or_insert(allocated);
                if id == allocated {
                    self.records.insert(
                        id,
                        TagRecord {
                            name: name.clone(),
                            stored: None,
                            subscribers: HashSet::new(),
                        },
                    );
                    info!(tag = %name, id, "tag registered");
                }
                id
            }
        };

        let reply = Message::new(Command::Id, id, 0, 0, message.payload);
        let targets: Vec<u16> = self.conns.iter().map(|entry| *entry.key()).collect();
        for target in targets {
            self.post(target, reply.clone());
        }
    }

    /// Store a published value and fan it out to every subscriber except
    /// the author. Stale stamps are dropped without comment.
    fn handle_set(&self, conn_id: u16, message: Message) {
        let author = if message.bus_id == 0 {
            conn_id
        } else {
            message.bus_id
        };

        let targets: Vec<u16>;
        {
            let Some(mut record) = self.records.get_mut(&message.tag_id) else {
                self.post(
                    conn_id,
                    Message::error(message.tag_id, "unknown tag id"),
                );
                return;
            };
            if let Some(stored) = &record.stored {
                if message.time_us < stored.time_us {
                    trace!(tag = %record.name, "stale set dropped");
                    return;
                }
            }
            record.stored = Some(Stored {
                payload: message.payload.clone(),
                time_us: message.time_us,
                author,
            });
            targets = record
                .subscribers
                .iter()
                .copied()
                .filter(|subscriber| *subscriber != author)
                .collect();
        }

        let forward = Message::new(
            Command::Set,
            message.tag_id,
            message.time_us,
            author,
            message.payload,
        );
        for target in targets {
            self.post(target, forward.clone());
        }
    }

    fn handle_sub(&self, conn_id: u16, message: Message) {
        let known = match self.records.get_mut(&message.tag_id) {
            Some(mut record) => {
                record.subscribers.insert(conn_id);
                true
            }
            None => false,
        };
        if !known {
            self.post(
                conn_id,
                Message::error(message.tag_id, "unknown tag id"),
            );
            return;
        }
        self.reply_current(conn_id, message.tag_id);
    }

    /// Send the stored value (or a null SET) to one connection.
    fn reply_current(&self, conn_id: u16, tag_id: u16) {
        let reply = match self.records.get(&tag_id) {
            None => {
                self.post(conn_id, Message::error(tag_id, "unknown tag id"));
                return;
            }
            Some(record) => match &record.stored {
                Some(stored) => Message::new(
                    Command::Set,
                    tag_id,
                    stored.time_us,
                    stored.author,
                    stored.payload.clone(),
                ),
                None => Message::new(Command::Set, tag_id, 0, 0, Bytes::new()),
            },
        };
        self.post(conn_id, reply);
    }

    /// Route a request to whichever connection most recently authored
    /// the tag, with the requester's identity in the bus_id field.
    fn handle_rta(&self, conn_id: u16, message: Message) {
        let requester = if message.bus_id == 0 {
            conn_id
        } else {
            message.bus_id
        };
        let author = match self.records.get(&message.tag_id) {
            None => {
                self.post(
                    conn_id,
                    Message::error(message.tag_id, "unknown tag id"),
                );
                return;
            }
            Some(record) => record.stored.as_ref().map(|stored| stored.author),
        };
        let live_author = author.filter(|author| self.conns.contains_key(author));
        let Some(author) = live_author else {
            self.post(
                conn_id,
                Message::error(message.tag_id, "no author for tag"),
            );
            return;
        };
        self.post(
            author,
            Message::new(
                Command::Rta,
                message.tag_id,
                message.time_us,
                requester,
                message.payload,
            ),
        );
    }

    /// Queue a message towards one connection. Overflow or a closed
    /// writer drops the connection; the peer reconnects and resyncs.
    fn post(&self, conn_id: u16, message: Message) {
        let Some(handle) = self.conns.get(&conn_id) else {
            return;
        };
        let tx = handle.tx.clone();
        drop(handle);
        if let Err(error) = tx.try_send(message) {
            match error {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(conn_id, "write queue overflow, dropping connection");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
            self.drop_conn(conn_id);
        }
    }

    /// Forget a connection: cancel its reader, drop its write queue and
    /// remove it from every subscriber set. Stored values and authorship
    /// stay; RTA towards a gone author answers ERR until someone
    /// re-authors the tag.
    fn drop_conn(&self, conn_id: u16) {
        if let Some((_, handle)) = self.conns.remove(&conn_id) {
            handle.cancel.cancel();
            for mut record in self.records.iter_mut() {
                record.subscribers.remove(&conn_id);
            }
            debug!(conn_id, "connection dropped");
        }
    }
}
