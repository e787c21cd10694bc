use super::*;
use crate::services::store::MemStore;
use crate::state::{DrawElement, Element, Session, test_helpers};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Duration, timeout};

// =============================================================================
// FIXTURES
// =============================================================================

/// Store whose writes always fail; reads behave like an empty default session.
struct FailingStore;

#[async_trait::async_trait]
impl SessionStore for FailingStore {
    async fn get_session(&self, session_id: i64) -> Result<Option<Session>, StoreError> {
        Ok(Some(Session { id: session_id, name: "broken".into(), created_at: 0, updated_at: 0 }))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(Vec::new())
    }

    async fn create_session(&self, _name: &str) -> Result<Session, StoreError> {
        Err(StoreError::Corrupt("read-only".into()))
    }

    async fn rename_session(&self, _session_id: i64, _name: &str) -> Result<Option<Session>, StoreError> {
        Err(StoreError::Corrupt("read-only".into()))
    }

    async fn list_elements(&self, _session_id: i64) -> Result<Vec<Element>, StoreError> {
        Ok(Vec::new())
    }

    async fn append_element(&self, _session_id: i64, _element: DrawElement) -> Result<Element, StoreError> {
        Err(StoreError::Corrupt("backing store unavailable".into()))
    }

    async fn clear_elements(&self, _session_id: i64) -> Result<(), StoreError> {
        Err(StoreError::Corrupt("backing store unavailable".into()))
    }
}

fn engine_with(store: Arc<dyn SessionStore>) -> RelayEngine {
    RelayEngine::new(store, test_helpers::test_relay_config())
}

/// Engine whose per-connection live-event budget is `outbound_buffer`.
fn engine_with_buffer(outbound_buffer: usize) -> RelayEngine {
    let config = RelayConfig { outbound_buffer, ..test_helpers::test_relay_config() };
    RelayEngine::new(Arc::new(MemStore::new()), config)
}

fn engine() -> (RelayEngine, Arc<dyn SessionStore>) {
    let store: Arc<dyn SessionStore> = Arc::new(MemStore::new());
    (engine_with(store.clone()), store)
}

struct Client {
    id: Uuid,
    rx: mpsc::Receiver<ServerEvent>,
}

impl Client {
    /// Everything queued so far.
    fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

async fn join(engine: &mut RelayEngine) -> Client {
    let joined = engine.connect().await.expect("connect");
    Client { id: joined.identity.connection_id, rx: joined.outbound }
}

/// Join `n` clients and discard their join traffic as it arrives.
async fn join_quiet(engine: &mut RelayEngine, n: usize) -> Vec<Client> {
    let mut clients = Vec::with_capacity(n);
    for _ in 0..n {
        clients.push(join(engine).await);
        for client in &mut clients {
            client.drain();
        }
    }
    clients
}

fn draw(id: &str) -> ClientEvent {
    ClientEvent::Draw { element: test_helpers::rectangle(id, (0.0, 0.0), (10.0, 10.0)) }
}

fn drawn_ids(events: &[ServerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::Draw { element } => Some(element.id.clone()),
            _ => None,
        })
        .collect()
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

#[tokio::test]
async fn join_on_empty_session_gets_empty_snapshot() {
    let (mut engine, _store) = engine();
    let mut client = join(&mut engine).await;

    let events = client.drain();
    assert_eq!(events, vec![ServerEvent::LoadSession { session_id: 1, elements: Vec::new() }]);
}

#[tokio::test]
async fn join_announces_newcomer_and_replays_roster() {
    let (mut engine, _store) = engine();
    let mut first = join(&mut engine).await;
    let mut second = join(&mut engine).await;
    first.drain();
    second.drain();

    let mut third = join(&mut engine).await;

    for peer in [&mut first, &mut second] {
        let events = peer.drain();
        assert_eq!(events.len(), 1);
        let ServerEvent::UserJoin { user } = &events[0] else {
            panic!("expected userJoin, got {events:?}");
        };
        assert_eq!(user.id, third.id);
    }

    let events = third.drain();
    let roster: Vec<Uuid> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::UserJoin { user } => Some(user.id),
            _ => None,
        })
        .collect();
    assert_eq!(roster, vec![first.id, second.id]);
    assert!(matches!(events.last(), Some(ServerEvent::LoadSession { .. })));
    assert_eq!(events.len(), 3);
}

#[tokio::test]
async fn late_joiner_gets_all_prior_draws_in_one_snapshot() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 1).await;
    let author = clients.remove(0);

    for id in ["d1", "d2", "d3"] {
        engine.handle_event(author.id, draw(id)).await;
    }

    let mut late = join(&mut engine).await;
    let events = late.drain();
    let loads: Vec<&ServerEvent> = events
        .iter()
        .filter(|e| matches!(e, ServerEvent::LoadSession { .. }))
        .collect();
    assert_eq!(loads.len(), 1);
    let ServerEvent::LoadSession { elements, .. } = loads[0] else {
        unreachable!();
    };
    let ids: Vec<&str> = elements.iter().map(|e| e.element.id.as_str()).collect();
    assert_eq!(ids, ["d1", "d2", "d3"]);

    // Live draws come after the snapshot.
    engine.handle_event(author.id, draw("d4")).await;
    assert_eq!(drawn_ids(&late.drain()), ["d4"]);
}

#[tokio::test]
async fn disconnect_sends_exactly_one_user_leave() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 3).await;
    let leaver = clients[0].id;

    engine.disconnect(leaver);
    engine.disconnect(leaver);

    for client in &mut clients[1..] {
        assert_eq!(client.drain(), vec![ServerEvent::UserLeave { user_id: leaver }]);
    }
    assert!(engine.registry().lookup(leaver).is_none());
}

#[tokio::test]
async fn events_after_close_are_dropped() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;
    let leaver = clients[0].id;
    engine.disconnect(leaver);
    clients[1].drain();

    engine.handle_event(leaver, ClientEvent::Cursor { x: 1.0, y: 1.0 }).await;
    engine.handle_event(leaver, draw("ghost")).await;

    assert!(clients[1].drain().is_empty());
    assert!(store.list_elements(1).await.unwrap().is_empty());
}

// =============================================================================
// EVENTS
// =============================================================================

#[tokio::test]
async fn draw_reaches_peers_but_not_sender() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 3).await;

    let rect = test_helpers::rectangle("rect-1", (0.0, 0.0), (10.0, 10.0));
    engine
        .handle_event(clients[0].id, ClientEvent::Draw { element: rect.clone() })
        .await;

    assert!(clients[0].drain().is_empty());
    for client in &mut clients[1..] {
        assert_eq!(client.drain(), vec![ServerEvent::Draw { element: rect.clone() }]);
    }
    let stored = store.list_elements(1).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].element, rect);
}

#[tokio::test]
async fn draws_arrive_in_send_order() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;

    let ids: Vec<String> = (0..20).map(|i| format!("d{i}")).collect();
    for id in &ids {
        engine.handle_event(clients[0].id, draw(id)).await;
    }

    assert_eq!(drawn_ids(&clients[1].drain()), ids);
}

#[tokio::test]
async fn cursor_is_stamped_with_sender_identity() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;
    let sender = engine
        .registry()
        .lookup(clients[0].id)
        .cloned()
        .expect("sender registered");

    engine
        .handle_event(clients[0].id, ClientEvent::Cursor { x: 10.0, y: 10.0 })
        .await;
    engine
        .handle_event(clients[0].id, ClientEvent::Cursor { x: 20.0, y: 20.0 })
        .await;

    assert!(clients[0].drain().is_empty());
    let events = clients[1].drain();
    let positions: Vec<(f64, f64)> = events
        .iter()
        .map(|e| match e {
            ServerEvent::Cursor { x, y, user_id, username, color } => {
                assert_eq!(*user_id, sender.connection_id);
                assert_eq!(username, &sender.display_name);
                assert_eq!(color, &sender.color);
                (*x, *y)
            }
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(positions, vec![(10.0, 10.0), (20.0, 20.0)]);
}

#[tokio::test]
async fn clear_canvas_reaches_everyone_including_sender() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 3).await;

    engine.handle_event(clients[1].id, draw("d1")).await;
    engine.handle_event(clients[1].id, draw("d2")).await;
    engine.handle_event(clients[0].id, ClientEvent::ClearCanvas).await;

    for (i, client) in clients.iter_mut().enumerate() {
        let events = client.drain();
        let clears = events.iter().filter(|e| **e == ServerEvent::ClearCanvas).count();
        assert_eq!(clears, 1, "client {i} should see exactly one clear");
        // Nothing from before the clear shows up after it.
        assert_eq!(events.last(), Some(&ServerEvent::ClearCanvas));
        if i != 1 {
            assert_eq!(drawn_ids(&events), ["d1", "d2"]);
        }
    }
    assert!(store.list_elements(1).await.unwrap().is_empty());

    let mut late = join(&mut engine).await;
    assert_eq!(late.drain().last(), Some(&ServerEvent::LoadSession { session_id: 1, elements: Vec::new() }));
}

#[tokio::test]
async fn undo_redo_forwards_full_state_without_persisting() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;

    let elements = vec![test_helpers::text("t1", "kept")];
    engine
        .handle_event(clients[0].id, ClientEvent::UndoRedo { elements: elements.clone() })
        .await;

    assert!(clients[0].drain().is_empty());
    assert_eq!(clients[1].drain(), vec![ServerEvent::UndoRedo { elements }]);
    assert!(store.list_elements(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn storage_failure_does_not_block_broadcast() {
    let mut engine = engine_with(Arc::new(FailingStore));
    let mut clients = join_quiet(&mut engine, 2).await;

    engine.handle_event(clients[0].id, draw("d1")).await;
    engine.handle_event(clients[0].id, ClientEvent::ClearCanvas).await;

    assert_eq!(clients[0].drain(), vec![ServerEvent::ClearCanvas]);
    let events = clients[1].drain();
    assert_eq!(drawn_ids(&events), ["d1"]);
    assert_eq!(events.last(), Some(&ServerEvent::ClearCanvas));
}

// =============================================================================
// ADMIN HOOKS
// =============================================================================

#[tokio::test]
async fn load_session_replaces_state_everywhere() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;
    let other = store.create_session("Other").await.unwrap();
    store
        .append_element(other.id, test_helpers::text("t1", "hi"))
        .await
        .unwrap();

    engine.load_session(other.id).await.unwrap();
    assert_eq!(engine.active_session_id(), other.id);

    for client in &mut clients {
        let events = client.drain();
        let [ServerEvent::LoadSession { session_id, elements }] = events.as_slice() else {
            panic!("expected one loadSession, got {events:?}");
        };
        assert_eq!(*session_id, other.id);
        assert_eq!(elements.len(), 1);
    }

    // Subsequent draws land in the newly active session.
    engine.handle_event(clients[0].id, draw("d1")).await;
    assert_eq!(store.list_elements(other.id).await.unwrap().len(), 2);
    assert!(store.list_elements(1).await.unwrap().is_empty());
}

#[tokio::test]
async fn load_unknown_session_keeps_pointer() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 1).await;

    let err = engine.load_session(99).await.unwrap_err();
    assert!(matches!(err, RelayError::SessionNotFound(99)));
    assert_eq!(engine.active_session_id(), 1);
    assert!(clients[0].drain().is_empty());
}

#[tokio::test]
async fn clear_session_broadcasts_only_when_active() {
    let (mut engine, store) = engine();
    let mut clients = join_quiet(&mut engine, 2).await;
    let other = store.create_session("Other").await.unwrap();

    engine.clear_session(other.id).await.unwrap();
    assert!(clients.iter_mut().all(|c| c.drain().is_empty()));

    engine.clear_session(1).await.unwrap();
    for client in &mut clients {
        assert_eq!(client.drain(), vec![ServerEvent::ClearCanvas]);
    }
}

#[tokio::test]
async fn clear_session_store_failure_is_reported_and_silent() {
    let mut engine = engine_with(Arc::new(FailingStore));
    let mut clients = join_quiet(&mut engine, 1).await;

    let err = engine.clear_session(1).await.unwrap_err();
    assert!(matches!(err, RelayError::Store(_)));
    assert!(clients[0].drain().is_empty());
}

#[tokio::test]
async fn presence_lists_connections_in_join_order() {
    let (mut engine, _store) = engine();
    let clients = join_quiet(&mut engine, 2).await;

    let presence = engine.presence();
    assert_eq!(presence.active_session_id, 1);
    let ids: Vec<Uuid> = presence.users.iter().map(|u| u.id).collect();
    assert_eq!(ids, vec![clients[0].id, clients[1].id]);
}

// =============================================================================
// BACKPRESSURE
// =============================================================================

#[tokio::test]
async fn full_outbound_queue_evicts_connection() {
    let mut engine = engine_with_buffer(2);
    let mut healthy = join_quiet(&mut engine, 2).await;
    let author = healthy[0].id;

    // Never read from: two live events fit behind its join snapshot.
    let mut slow = join(&mut engine).await;
    for client in &mut healthy {
        client.drain();
    }

    for id in ["d1", "d2"] {
        engine.handle_event(author, draw(id)).await;
        healthy[1].drain();
    }
    assert!(engine.registry().lookup(slow.id).is_some());

    engine.handle_event(author, draw("d3")).await;
    assert!(engine.registry().lookup(slow.id).is_none());

    assert_eq!(healthy[0].drain(), vec![ServerEvent::UserLeave { user_id: slow.id }]);
    let events = healthy[1].drain();
    assert_eq!(drawn_ids(&events), ["d3"]);
    assert_eq!(events.last(), Some(&ServerEvent::UserLeave { user_id: slow.id }));

    // The evicted queue yields what fit, then closes.
    let queued = slow.drain();
    assert_eq!(queued.len(), 5);
    assert!(matches!(queued[2], ServerEvent::LoadSession { .. }));
    assert_eq!(drawn_ids(&queued), ["d1", "d2"]);
    assert!(slow.rx.recv().await.is_none());
}

#[tokio::test]
async fn roster_larger_than_queue_still_joins() {
    let mut engine = engine_with_buffer(2);
    let mut peers = join_quiet(&mut engine, 6).await;

    let mut newcomer = join(&mut engine).await;
    assert!(engine.registry().lookup(newcomer.id).is_some());

    let events = newcomer.drain();
    assert_eq!(events.len(), 7);
    let roster: Vec<Uuid> = events
        .iter()
        .filter_map(|e| match e {
            ServerEvent::UserJoin { user } => Some(user.id),
            _ => None,
        })
        .collect();
    assert_eq!(roster, peers.iter().map(|p| p.id).collect::<Vec<_>>());
    assert_eq!(events.last(), Some(&ServerEvent::LoadSession { session_id: 1, elements: Vec::new() }));

    // Peers see the join and no departure.
    for peer in &mut peers {
        let events = peer.drain();
        assert!(matches!(events.as_slice(), [ServerEvent::UserJoin { user }] if user.id == newcomer.id));
    }

    // The newcomer still has its full live-event budget.
    engine.handle_event(peers[0].id, draw("d1")).await;
    engine.handle_event(peers[0].id, draw("d2")).await;
    assert!(engine.registry().lookup(newcomer.id).is_some());
    assert_eq!(drawn_ids(&newcomer.drain()), ["d1", "d2"]);
}

#[tokio::test]
async fn closed_outbound_queue_evicts_on_next_fan_out() {
    let (mut engine, _store) = engine();
    let mut clients = join_quiet(&mut engine, 3).await;
    let gone = clients.pop().expect("three clients");
    drop(gone.rx);

    engine.handle_event(clients[0].id, draw("d1")).await;

    assert_eq!(
        clients[1].drain(),
        vec![
            ServerEvent::Draw { element: test_helpers::rectangle("d1", (0.0, 0.0), (10.0, 10.0)) },
            ServerEvent::UserLeave { user_id: gone.id },
        ]
    );
    // A later disconnect from the transport does not announce twice.
    engine.disconnect(gone.id);
    assert_eq!(clients[0].drain(), vec![ServerEvent::UserLeave { user_id: gone.id }]);
    assert_eq!(clients[1].rx.try_recv(), Err(TryRecvError::Empty));
}

#[tokio::test]
async fn connection_cap_rejects_registration() {
    let store: Arc<dyn SessionStore> = Arc::new(MemStore::new());
    let config = RelayConfig { max_connections: Some(1), ..test_helpers::test_relay_config() };
    let mut engine = RelayEngine::new(store, config);

    let _first = join(&mut engine).await;
    let err = engine.connect().await.unwrap_err();
    assert!(matches!(err, RelayError::Registry(RegistryError::Full { limit: 1 })));
}

// =============================================================================
// HANDLE
// =============================================================================

async fn recv(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("event receive timed out")
        .expect("outbound queue closed")
}

#[tokio::test]
async fn handle_serializes_events_through_the_task() {
    let state = test_helpers::test_app_state();
    let relay = state.relay;

    let joined = relay.connect().await.unwrap();
    let (a, mut rx_a) = (joined.identity.connection_id, joined.outbound);
    assert!(matches!(recv(&mut rx_a).await, ServerEvent::LoadSession { .. }));

    let joined = relay.connect().await.unwrap();
    let (b, mut rx_b) = (joined.identity.connection_id, joined.outbound);
    assert!(matches!(recv(&mut rx_a).await, ServerEvent::UserJoin { user } if user.id == b));
    assert!(matches!(recv(&mut rx_b).await, ServerEvent::UserJoin { user } if user.id == a));
    assert!(matches!(recv(&mut rx_b).await, ServerEvent::LoadSession { .. }));

    relay.submit(a, draw("d1")).await.unwrap();
    relay.submit(a, ClientEvent::ClearCanvas).await.unwrap();
    relay.submit(a, draw("d2")).await.unwrap();

    assert!(matches!(recv(&mut rx_b).await, ServerEvent::Draw { element } if element.id == "d1"));
    assert_eq!(recv(&mut rx_b).await, ServerEvent::ClearCanvas);
    assert!(matches!(recv(&mut rx_b).await, ServerEvent::Draw { element } if element.id == "d2"));
    assert_eq!(recv(&mut rx_a).await, ServerEvent::ClearCanvas);

    relay.disconnect(a).await.unwrap();
    assert_eq!(recv(&mut rx_b).await, ServerEvent::UserLeave { user_id: a });

    let presence = relay.presence().await.unwrap();
    assert_eq!(presence.users.len(), 1);
    let elements = state.store.list_elements(1).await.unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].element.id, "d2");
}
