// Room & client registry.
//
// All membership state lives behind one mutex: the client index keyed by
// client id and the room index keyed by room id. Every mutation and every
// broadcast takes that single lock, so a broadcast always sees one
// consistent membership snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use strand_common::protocol::{ClientContext, Params};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Frames a client may have queued before it counts as unresponsive.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Text frames queued for one client's socket task.
pub type ClientOutbound = mpsc::Sender<String>;

pub fn outbound_channel() -> (ClientOutbound, mpsc::Receiver<String>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: String,
    pub room_id: String,
    pub metadata: Params,
    /// Identifies the socket session that registered this client, so a
    /// stale session never removes a newer registration under the same id.
    pub session_id: Uuid,
    outbound: ClientOutbound,
}

impl Client {
    pub fn new(
        client_id: impl Into<String>,
        room_id: impl Into<String>,
        metadata: Params,
        outbound: ClientOutbound,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            room_id: room_id.into(),
            metadata,
            session_id: Uuid::new_v4(),
            outbound,
        }
    }

    pub fn context(&self) -> ClientContext {
        ClientContext {
            client_id: self.client_id.clone(),
            room_id: self.room_id.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// A closed socket task and a full queue both count as a failed write.
    fn send(&self, payload: &str) -> bool {
        self.outbound.try_send(payload.to_owned()).is_ok()
    }
}

#[derive(Debug, Default)]
struct Room {
    members: HashSet<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    clients: HashMap<String, Client>,
    rooms: HashMap<String, Room>,
    closed: bool,
}

impl RegistryState {
    fn detach(&mut self, client_id: &str) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        if let Some(room) = self.rooms.get_mut(&client.room_id) {
            room.members.remove(client_id);
            if room.members.is_empty() {
                self.rooms.remove(&client.room_id);
            }
        }
        Some(client)
    }

    fn deliver<'a>(
        &mut self,
        recipients: impl IntoIterator<Item = &'a String>,
        payload: &str,
    ) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for client_id in recipients {
            match self.clients.get(client_id) {
                Some(client) if client.send(payload) => report.delivered += 1,
                Some(_) => report.reaped.push(client_id.clone()),
                None => {}
            }
        }
        for client_id in &report.reaped {
            self.detach(client_id);
        }
        report
    }
}

/// Outcome of a fan-out send.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Clients whose socket was gone; they are no longer registered.
    pub reaped: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RoomRegistry {
    state: Mutex<RegistryState>,
}

impl RoomRegistry {
    /// Register a client in its room, creating the room if needed. A client
    /// already registered under the same id is replaced and returned. Fails
    /// with `Shutdown` once [`RoomRegistry::close_all`] has run.
    pub fn add_client(&self, client: Client) -> GatewayResult<Option<Client>> {
        let mut state = self.lock();
        if state.closed {
            return Err(GatewayError::Shutdown);
        }
        let replaced = state.detach(&client.client_id);
        state
            .rooms
            .entry(client.room_id.clone())
            .or_default()
            .members
            .insert(client.client_id.clone());
        state.clients.insert(client.client_id.clone(), client);
        Ok(replaced)
    }

    /// Remove a client from both indices. Removing an absent client is a no-op.
    pub fn remove_client(&self, client_id: &str) -> Option<Client> {
        self.lock().detach(client_id)
    }

    /// Remove `client_id` only if it is still registered by `session_id`.
    pub fn remove_session(&self, client_id: &str, session_id: Uuid) -> Option<Client> {
        let mut state = self.lock();
        let owned_by_session =
            state.clients.get(client_id).is_some_and(|client| client.session_id == session_id);
        if !owned_by_session {
            return None;
        }
        state.detach(client_id)
    }

    pub fn send_to_client(&self, client_id: &str, payload: &str) -> GatewayResult<()> {
        let mut state = self.lock();
        let client = state
            .clients
            .get(client_id)
            .ok_or_else(|| GatewayError::ClientNotFound(client_id.to_owned()))?;
        if client.send(payload) {
            return Ok(());
        }
        state.detach(client_id);
        Err(GatewayError::Transport(format!("socket for client `{client_id}` is closed")))
    }

    /// Send to every member of `room_id`. A missing or empty room is a no-op.
    pub fn broadcast_to_room(&self, room_id: &str, payload: &str) -> BroadcastReport {
        let mut state = self.lock();
        let Some(room) = state.rooms.get(room_id) else {
            return BroadcastReport::default();
        };
        let members: Vec<String> = room.members.iter().cloned().collect();
        let report = state.deliver(&members, payload);
        debug!(
            room_id,
            delivered = report.delivered,
            reaped = report.reaped.len(),
            "room broadcast"
        );
        report
    }

    /// Send to every registered client regardless of room.
    pub fn broadcast_all(&self, payload: &str) -> BroadcastReport {
        let mut state = self.lock();
        let everyone: Vec<String> = state.clients.keys().cloned().collect();
        let report = state.deliver(&everyone, payload);
        debug!(delivered = report.delivered, reaped = report.reaped.len(), "global broadcast");
        report
    }

    /// Unregister every client and refuse new ones. Dropping their outbound
    /// senders ends each socket task, which then closes its transport.
    pub fn close_all(&self) -> usize {
        let mut state = self.lock();
        state.closed = true;
        state.rooms.clear();
        let closed = state.clients.len();
        state.clients.clear();
        closed
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.lock().clients.contains_key(client_id)
    }

    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }

    pub fn room_of(&self, client_id: &str) -> Option<String> {
        self.lock().clients.get(client_id).map(|client| client.room_id.clone())
    }

    /// Sorted member ids of a room; empty when the room does not exist.
    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        let state = self.lock();
        let mut members: Vec<String> = state
            .rooms
            .get(room_id)
            .map(|room| room.members.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().expect("room registry lock poisoned")
    }

    #[cfg(test)]
    fn assert_consistent(&self) {
        let state = self.lock();
        for (client_id, client) in &state.clients {
            let rooms_holding: Vec<&String> = state
                .rooms
                .iter()
                .filter(|(_, room)| room.members.contains(client_id))
                .map(|(room_id, _)| room_id)
                .collect();
            assert_eq!(rooms_holding, vec![&client.room_id], "client {client_id} room mismatch");
        }
        for (room_id, room) in &state.rooms {
            assert!(!room.members.is_empty(), "room {room_id} should not linger empty");
            for member in &room.members {
                assert!(state.clients.contains_key(member), "room {room_id} has stale {member}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use tokio::sync::mpsc::Receiver;

    use super::*;

    fn client(client_id: &str, room_id: &str) -> (Client, Receiver<String>) {
        let (outbound, inbound) = outbound_channel();
        (Client::new(client_id, room_id, Params::new(), outbound), inbound)
    }

    fn drain(receiver: &mut Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = receiver.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn add_creates_room_and_indexes_client() {
        let registry = RoomRegistry::default();
        let (c1, _rx) = client("c1", "room-42");
        assert!(registry.add_client(c1).expect("registry is open").is_none());

        assert!(registry.contains("c1"));
        assert_eq!(registry.room_of("c1").as_deref(), Some("room-42"));
        assert_eq!(registry.room_members("room-42"), vec!["c1".to_string()]);
        registry.assert_consistent();
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = RoomRegistry::default();
        let (c1, _rx) = client("c1", "room-42");
        registry.add_client(c1).expect("registry is open");

        assert!(registry.remove_client("c1").is_some());
        assert!(registry.remove_client("c1").is_none());
        assert!(registry.remove_client("never-added").is_none());
        assert_eq!(registry.client_count(), 0);
        assert!(registry.room_members("room-42").is_empty());
        registry.assert_consistent();
    }

    #[test]
    fn re_adding_an_id_moves_it_between_rooms() {
        let registry = RoomRegistry::default();
        let (first, _first_rx) = client("c1", "a");
        let (second, _second_rx) = client("c1", "b");
        let first_session = first.session_id;

        registry.add_client(first).expect("registry is open");
        let replaced = registry
            .add_client(second)
            .expect("registry is open")
            .expect("first registration is replaced");
        assert_eq!(replaced.room_id, "a");

        assert!(registry.room_members("a").is_empty());
        assert_eq!(registry.room_members("b"), vec!["c1".to_string()]);
        assert!(registry.remove_session("c1", first_session).is_none());
        assert!(registry.contains("c1"));
        registry.assert_consistent();
    }

    #[test]
    fn send_to_missing_client_is_client_not_found() {
        let registry = RoomRegistry::default();
        let error = registry.send_to_client("c1", "ping").expect_err("client is absent");
        assert!(matches!(error, GatewayError::ClientNotFound(id) if id == "c1"));
    }

    #[test]
    fn send_to_client_queues_text() {
        let registry = RoomRegistry::default();
        let (c1, mut rx) = client("c1", "room");
        registry.add_client(c1).expect("registry is open");

        registry.send_to_client("c1", "ping").expect("send should succeed");
        assert_eq!(drain(&mut rx), vec!["ping".to_string()]);
    }

    #[test]
    fn room_broadcast_reaches_members_and_reaps_dead_sockets() {
        let registry = RoomRegistry::default();
        let (alive, mut alive_rx) = client("alive", "room-42");
        let (dead, dead_rx) = client("dead", "room-42");
        let (elsewhere, mut elsewhere_rx) = client("elsewhere", "other");
        registry.add_client(alive).expect("registry is open");
        registry.add_client(dead).expect("registry is open");
        registry.add_client(elsewhere).expect("registry is open");
        drop(dead_rx);

        let report = registry.broadcast_to_room("room-42", "hi");

        assert_eq!(report.delivered, 1);
        assert_eq!(report.reaped, vec!["dead".to_string()]);
        assert_eq!(drain(&mut alive_rx), vec!["hi".to_string()]);
        assert!(drain(&mut elsewhere_rx).is_empty());
        assert!(!registry.contains("dead"));
        assert!(registry.contains("alive"));
        assert!(registry.contains("elsewhere"));
        registry.assert_consistent();
    }

    #[test]
    fn client_that_stops_reading_is_reaped_once_its_queue_fills() {
        let registry = RoomRegistry::default();
        let (reader, mut reader_rx) = client("reader", "room-42");
        let (stalled, _stalled_rx) = client("stalled", "room-42");
        registry.add_client(reader).expect("registry is open");
        registry.add_client(stalled).expect("registry is open");

        for n in 0..OUTBOUND_QUEUE_CAPACITY {
            let report = registry.broadcast_to_room("room-42", &format!("frame-{n}"));
            assert!(report.reaped.is_empty(), "nobody is reaped before the queue fills");
            assert_eq!(drain(&mut reader_rx).len(), 1);
        }

        let report = registry.broadcast_to_room("room-42", "one too many");
        assert_eq!(report.reaped, vec!["stalled".to_string()]);
        assert_eq!(report.delivered, 1);
        assert!(!registry.contains("stalled"));
        assert_eq!(registry.room_members("room-42"), vec!["reader".to_string()]);
        registry.assert_consistent();
    }

    #[test]
    fn broadcast_to_unknown_room_is_noop() {
        let registry = RoomRegistry::default();
        assert_eq!(registry.broadcast_to_room("nowhere", "hi"), BroadcastReport::default());
    }

    #[test]
    fn broadcast_all_ignores_rooms_and_reaps() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = client("a", "one");
        let (b, mut b_rx) = client("b", "two");
        let (c, c_rx) = client("c", "two");
        registry.add_client(a).expect("registry is open");
        registry.add_client(b).expect("registry is open");
        registry.add_client(c).expect("registry is open");
        drop(c_rx);

        let report = registry.broadcast_all("everyone");
        assert_eq!(report.delivered, 2);
        assert_eq!(report.reaped, vec!["c".to_string()]);
        assert_eq!(drain(&mut a_rx), vec!["everyone".to_string()]);
        assert_eq!(drain(&mut b_rx), vec!["everyone".to_string()]);
        assert_eq!(registry.room_members("two"), vec!["b".to_string()]);
        registry.assert_consistent();
    }

    #[test]
    fn close_all_drops_every_outbound_channel() {
        let registry = RoomRegistry::default();
        let (a, mut a_rx) = client("a", "one");
        registry.add_client(a).expect("registry is open");

        assert_eq!(registry.close_all(), 1);
        assert_eq!(registry.client_count(), 0);
        assert!(matches!(
            a_rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn registration_after_close_all_is_refused() {
        let registry = RoomRegistry::default();
        registry.close_all();

        let (late, _late_rx) = client("late", "room-42");
        let error = registry.add_client(late).expect_err("registry is closed");
        assert!(matches!(error, GatewayError::Shutdown));
        assert!(!registry.contains("late"));
        assert!(registry.room_members("room-42").is_empty());
        registry.assert_consistent();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add { client: u8, room: u8 },
        Remove { client: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0u8..3).prop_map(|(client, room)| Op::Add { client, room }),
            (0u8..6).prop_map(|client| Op::Remove { client }),
        ]
    }

    proptest! {
        #[test]
        fn membership_stays_consistent(ops in proptest::collection::vec(op(), 0..64)) {
            let registry = RoomRegistry::default();
            let mut receivers = Vec::new();
            for op in ops {
                match op {
                    Op::Add { client: id, room } => {
                        let (entry, rx) = client(&format!("c{id}"), &format!("r{room}"));
                        receivers.push(rx);
                        registry.add_client(entry).expect("registry is open");
                    }
                    Op::Remove { client: id } => {
                        registry.remove_client(&format!("c{id}"));
                    }
                }
                registry.assert_consistent();
            }
        }
    }
}
