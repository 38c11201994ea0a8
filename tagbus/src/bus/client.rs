//! The bus client every process embeds: one TCP connection to the bus,
//! tag registration, by-exception publication and delivery, RTA routing
//! and reconnect with full-jitter backoff.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use crate::periodic::Backoff;
use crate::protocol::assembly::MAX_MESSAGE;
use crate::protocol::{fragment, Command, FrameCodec, Message, Reassembler, Value};
use crate::tags::registry::BusEvent;
use crate::tags::{Tag, TagRegistry};

use super::queue::{CoalescingQueue, QueuedSet};
use super::BusError;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 4096;

/// What the client currently knows about its connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatus {
    pub connected: bool,
    /// Our connection id on the bus, 0 while disconnected.
    pub bus_id: u16,
}

/// Handle to the per-process bus client task. Dropping the handle stops
/// the task and closes the connection.
pub struct BusClient {
    events: UnboundedSender<BusEvent>,
    status: watch::Receiver<ClientStatus>,
    task: JoinHandle<()>,
}

impl BusClient {
    /// Attach a registry to the bus at `addr` and start the connection
    /// task. Existing tags are registered immediately; tags created
    /// later are picked up as they appear.
    pub fn connect(registry: TagRegistry, addr: SocketAddr) -> BusClient {
        let (events, events_rx) = tokio::sync::mpsc::unbounded_channel();
        registry.attach_link(events.clone());
        let (status_tx, status) = watch::channel(ClientStatus::default());
        let worker = Worker {
            registry,
            addr,
            status: status_tx,
            cookie: 1,
        };
        let task = tokio::spawn(worker.run(events_rx));
        BusClient {
            events,
            status,
            task,
        }
    }

    pub fn status(&self) -> watch::Receiver<ClientStatus> {
        self.status.clone()
    }

    /// Wait until the hello has been processed and registration begun.
    pub async fn wait_connected(&self) -> ClientStatus {
        let mut status = self.status.clone();
        loop {
            let current = *status.borrow_and_update();
            if current.connected {
                return current;
            }
            if status.changed().await.is_err() {
                return ClientStatus::default();
            }
        }
    }

    /// Ask the bus for a tag's current value without subscribing.
    pub fn refresh(&self, name: &str) {
        let _ = self.events.send(BusEvent::Refresh {
            name: name.to_owned(),
        });
    }

    /// Send a request-to-author for `name`. Equivalent to
    /// [`Tag::rta`] for callers holding only the client.
    pub fn request(&self, name: &str, value: Value) {
        let _ = self.events.send(BusEvent::Request {
            name: name.to_owned(),
            value,
        });
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    registry: TagRegistry,
    addr: SocketAddr,
    status: watch::Sender<ClientStatus>,
    /// Requester cookie for JSON RTA payloads, monotone per client.
    cookie: u16,
}

/// Everything scoped to one live connection.
struct Session {
    writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    tus: usize,
    ids: HashMap<String, u16>,
    by_id: HashMap<u16, Arc<Tag>>,
    /// Updates waiting for their tag's ID round-trip.
    parked_sets: HashMap<String, QueuedSet>,
    parked_rtas: Vec<(String, Value)>,
}

impl Worker {
    async fn run(mut self, mut events: UnboundedReceiver<BusEvent>) {
        let queue = CoalescingQueue::new(QUEUE_CAPACITY);
        let mut backoff = Backoff::reconnect();
        loop {
            let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(self.addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    debug!(addr = %self.addr, %error, "bus dial failed");
                    if !offline_wait(backoff.next(), &mut events, &queue).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    debug!(addr = %self.addr, "bus dial timed out");
                    if !offline_wait(backoff.next(), &mut events, &queue).await {
                        return;
                    }
                    continue;
                }
            };
            backoff.reset();

            let outcome = self.session(stream, &mut events, &queue).await;
            let _ = self.status.send(ClientStatus::default());
            match outcome {
                // The handle is gone; nothing left to serve.
                Ok(()) => return,
                Err(error) => {
                    info!(%error, "bus connection lost, reconnecting");
                }
            }
            if !offline_wait(backoff.next(), &mut events, &queue).await {
                return;
            }
        }
    }

    async fn session(
        &mut self,
        stream: TcpStream,
        events: &mut UnboundedReceiver<BusEvent>,
        queue: &CoalescingQueue,
    ) -> Result<(), BusError> {
        if let Err(error) = stream.set_nodelay(true) {
            debug!(%error, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, FrameCodec::new(MAX_MESSAGE));
        let mut assembler = Reassembler::default();

        // The server speaks first: an ID frame with tag_id 0 carrying
        // our connection id and the session TUS.
        let hello = timeout(DIAL_TIMEOUT, read_message(&mut reader, &mut assembler))
            .await
            .map_err(|_| BusError::BadHello)??;
        if hello.command != Command::Id || hello.tag_id != 0 {
            return Err(BusError::BadHello);
        }
        let bus_id = hello.bus_id;
        let tus = (hello.time_us as usize).max(64);
        let _ = self.status.send(ClientStatus {
            connected: true,
            bus_id,
        });
        info!(bus_id, tus, "connected to tag bus");

        let mut session = Session {
            writer: FramedWrite::new(write_half, FrameCodec::new(tus)),
            tus,
            ids: HashMap::new(),
            by_id: HashMap::new(),
            parked_sets: HashMap::new(),
            parked_rtas: Vec::new(),
        };

        for name in self.registry.names() {
            session.send_id(&name).await?;
        }

        let mut last_read = Instant::now();
        let outcome = loop {
            let step = tokio::select! {
                maybe = events.recv() => match maybe {
                    None => break Ok(()),
                    Some(event) => self.handle_event(&mut session, queue, event).await,
                },
                (name, set) = queue.pop() => {
                    session.send_set(&name, set).await
                }
                next = reader.next() => {
                    match next {
                        None => break Err(BusError::Closed),
                        Some(frame) => {
                            last_read = Instant::now();
                            match frame.map_err(BusError::from).and_then(|frame| {
                                assembler.push(frame).map_err(BusError::from)
                            }) {
                                Ok(Some(message)) => {
                                    self.handle_message(&mut session, message).await
                                }
                                Ok(None) => Ok(()),
                                Err(error) => break Err(error),
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(last_read + IDLE_TIMEOUT) => {
                    break Err(BusError::IdleTimeout);
                }
            };
            if let Err(error) = step {
                break Err(error);
            }
        };

        // Whatever was waiting on an ID round-trip goes back to the
        // queue so the next session publishes it.
        for (name, set) in session.parked_sets.drain() {
            queue.push(&name, set);
        }
        outcome
    }

    async fn handle_event(
        &mut self,
        session: &mut Session,
        queue: &CoalescingQueue,
        event: BusEvent,
    ) -> Result<(), BusError> {
        match event {
            BusEvent::Created { name } => {
                if let Some(&id) = session.ids.get(&name) {
                    session.adopt(&self.registry, &name, id).await?;
                } else {
                    session.send_id(&name).await?;
                }
            }
            BusEvent::Publish {
                name,
                value,
                time_us,
            } => {
                queue.push(&name, QueuedSet { value, time_us });
            }
            BusEvent::Request { name, value } => {
                let value = self.stamp_cookie(value);
                match session.ids.get(&name).copied() {
                    Some(id) => session.send_rta(id, value).await?,
                    None => {
                        session.send_id(&name).await?;
                        session.parked_rtas.push((name, value));
                    }
                }
            }
            BusEvent::Refresh { name } => match session.ids.get(&name).copied() {
                Some(id) => {
                    session
                        .send(Message::new(Command::Get, id, 0, 0, bytes::Bytes::new()))
                        .await?
                }
                None => debug!(tag = %name, "refresh for unregistered tag"),
            },
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        session: &mut Session,
        message: Message,
    ) -> Result<(), BusError> {
        match message.command {
            Command::Id => {
                // Repeated hello frames carry tag_id 0 and are not a
                // mapping.
                if message.tag_id == 0 {
                    return Ok(());
                }
                let Ok(name) = std::str::from_utf8(&message.payload) else {
                    warn!("ID broadcast with non-utf8 name");
                    return Ok(());
                };
                let name = name.to_owned();
                let id = message.tag_id;
                session.ids.insert(name.clone(), id);
                if self.registry.get(&name).is_some() {
                    session.adopt(&self.registry, &name, id).await?;
                }
                if let Some(set) = session.parked_sets.remove(&name) {
                    session.send_set(&name, set).await?;
                }
                let due: Vec<Value> = {
                    let mut kept = Vec::new();
                    let mut due = Vec::new();
                    for (parked_name, value) in session.parked_rtas.drain(..) {
                        if parked_name == name {
                            due.push(value);
                        } else {
                            kept.push((parked_name, value));
                        }
                    }
                    session.parked_rtas = kept;
                    due
                };
                for value in due {
                    session.send_rta(id, value).await?;
                }
            }
            Command::Set => {
                let Some(tag) = session.by_id.get(&message.tag_id).cloned() else {
                    debug!(tag_id = message.tag_id, "SET for unknown tag");
                    return Ok(());
                };
                if message.payload.is_empty() {
                    // Null reply: nobody has written the tag yet.
                    return Ok(());
                }
                match Value::decode(&message.payload) {
                    Ok(value) => {
                        if let Err(error) =
                            tag.set_from(value, message.time_us, message.bus_id)
                        {
                            warn!(tag = tag.name(), %error, "remote set rejected");
                        }
                    }
                    Err(error) => warn!(tag = tag.name(), %error, "undecodable SET"),
                }
            }
            Command::Rta => {
                let Some(tag) = session.by_id.get(&message.tag_id).cloned() else {
                    debug!(tag_id = message.tag_id, "RTA for unknown tag");
                    return Ok(());
                };
                let Some(handler) = tag.rta_handler() else {
                    warn!(tag = tag.name(), "RTA but no handler installed");
                    return Ok(());
                };
                match Value::decode(&message.payload) {
                    Ok(value) => {
                        let result = std::panic::catch_unwind(
                            std::panic::AssertUnwindSafe(|| handler(&tag, value)),
                        );
                        if result.is_err() {
                            warn!(tag = tag.name(), "RTA handler panicked");
                        }
                    }
                    Err(error) => warn!(tag = tag.name(), %error, "undecodable RTA"),
                }
            }
            Command::Err => {
                warn!(
                    tag_id = message.tag_id,
                    "bus error: {}",
                    String::from_utf8_lossy(&message.payload)
                );
            }
            Command::Get | Command::Sub => {
                warn!(command = ?message.command, "unexpected command from server");
            }
        }
        Ok(())
    }

    /// Stamp a JSON request with the next cookie; 0 is reserved for
    /// broadcast responses and is skipped.
    fn stamp_cookie(&mut self, value: Value) -> Value {
        let cookie = self.cookie;
        self.cookie = self.cookie.checked_add(1).unwrap_or(1);
        value.with_cookie(cookie)
    }
}

impl Session {
    async fn send(&mut self, message: Message) -> Result<(), BusError> {
        for frame in fragment(message, self.tus) {
            self.writer.send(frame).await?;
        }
        Ok(())
    }

    async fn send_id(&mut self, name: &str) -> Result<(), BusError> {
        self.send(Message::new(
            Command::Id,
            0,
            0,
            0,
            bytes::Bytes::copy_from_slice(name.as_bytes()),
        ))
        .await
    }

    /// Wire a freshly mapped id to the local tag and subscribe to it.
    async fn adopt(
        &mut self,
        registry: &TagRegistry,
        name: &str,
        id: u16,
    ) -> Result<(), BusError> {
        let Some(tag) = registry.get(name) else {
            return Ok(());
        };
        if tag.id() != id {
            tag.set_id(id);
        }
        if self.by_id.insert(id, tag).is_none() {
            self.send(Message::new(Command::Sub, id, 0, 0, bytes::Bytes::new()))
                .await?;
        }
        Ok(())
    }

    async fn send_set(&mut self, name: &str, set: QueuedSet) -> Result<(), BusError> {
        match self.ids.get(name).copied() {
            Some(id) => {
                self.send(Message::new(
                    Command::Set,
                    id,
                    set.time_us,
                    0,
                    set.value.encode(),
                ))
                .await
            }
            None => {
                // Newest wins while the ID round-trip is in flight.
                self.parked_sets.insert(name.to_owned(), set);
                Ok(())
            }
        }
    }

    async fn send_rta(&mut self, id: u16, value: Value) -> Result<(), BusError> {
        self.send(Message::new(Command::Rta, id, 0, 0, value.encode()))
            .await
    }
}

async fn read_message(
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    assembler: &mut Reassembler,
) -> Result<Message, BusError> {
    while let Some(next) = reader.next().await {
        if let Some(message) = assembler.push(next?)? {
            return Ok(message);
        }
    }
    Err(BusError::Closed)
}

/// Sit out the backoff while keeping the outbound queue coalesced:
/// publishes keep folding into the bounded queue instead of piling up
/// in the event channel. Returns false once the client handle is gone.
async fn offline_wait(
    wait: Duration,
    events: &mut UnboundedReceiver<BusEvent>,
    queue: &CoalescingQueue,
) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                None => return false,
                Some(BusEvent::Publish { name, value, time_us }) => {
                    queue.push(&name, QueuedSet { value, time_us });
                }
                // Registration and requests need a connection; the
                // session replays registrations itself and a request
                // towards a dead bus has no author to reach.
                Some(BusEvent::Created { .. }) => {}
                Some(BusEvent::Request { name, .. }) => {
                    debug!(tag = %name, "request dropped while disconnected");
                }
                Some(BusEvent::Refresh { .. }) => {}
            },
            _ = tokio::time::sleep_until(deadline) => return true,
        }
    }
}
