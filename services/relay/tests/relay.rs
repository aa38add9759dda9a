use futures_util::{SinkExt, StreamExt};
use newme_realtime_core::signaling::{RelayBus, SignalingChannel};
use newme_realtime_types::{ParticipantId, SessionDescription, SessionId};
use newme_signaling_relay::{router::create_router, state::AppState};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

async fn spawn_relay() -> (SocketAddr, Arc<AppState>) {
    let state = Arc::new(AppState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = create_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn wait_for_members(state: &AppState, room: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while state.rooms.member_count(room) != count {
        assert!(
            tokio::time::Instant::now() < deadline,
            "room {room} never reached {count} members"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_frames_reach_peers_but_not_the_sender() {
    let (addr, state) = spawn_relay().await;
    let url = format!("ws://{addr}/ws/webrtc_session_s1");
    let (mut alice, _) = connect_async(url.as_str()).await.unwrap();
    let (mut bob, _) = connect_async(url.as_str()).await.unwrap();
    wait_for_members(&state, "webrtc_session_s1", 2).await;

    alice.send(Message::Text("hello bob".into())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), bob.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(frame, Message::Text("hello bob".into()));

    let echoed = tokio::time::timeout(Duration::from_millis(100), alice.next()).await;
    assert!(echoed.is_err(), "sender received its own frame");
}

#[tokio::test]
async fn test_rooms_do_not_leak_into_each_other() {
    let (addr, state) = spawn_relay().await;
    let (mut alice, _) = connect_async(format!("ws://{addr}/ws/room-a")).await.unwrap();
    let (mut carol, _) = connect_async(format!("ws://{addr}/ws/room-b")).await.unwrap();
    wait_for_members(&state, "room-a", 1).await;
    wait_for_members(&state, "room-b", 1).await;

    alice.send(Message::Text("only room a".into())).await.unwrap();

    let leaked = tokio::time::timeout(Duration::from_millis(100), carol.next()).await;
    assert!(leaked.is_err());
}

#[tokio::test]
async fn test_closed_sockets_leave_their_room() {
    let (addr, state) = spawn_relay().await;
    let (mut alice, _) = connect_async(format!("ws://{addr}/ws/room-a")).await.unwrap();
    wait_for_members(&state, "room-a", 1).await;

    alice.close(None).await.unwrap();

    wait_for_members(&state, "room-a", 0).await;
    assert_eq!(state.rooms.room_count(), 0);
}

#[tokio::test]
async fn test_signaling_channels_negotiate_through_the_relay() {
    let (addr, state) = spawn_relay().await;
    let bus = Arc::new(RelayBus::new(format!("ws://{addr}/ws")));
    let session = SessionId::new("s2");

    let alice = SignalingChannel::new(bus.clone(), ParticipantId::new("alice"));
    let bob = SignalingChannel::new(bus.clone(), ParticipantId::new("bob"));
    alice.join(&session).await.unwrap();
    bob.join(&session).await.unwrap();
    wait_for_members(&state, &session.channel_name(), 2).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let _sub = bob.on_sdp(move |signal| sink.lock().push(signal.clone()));
    let own = Arc::new(Mutex::new(0usize));
    let own_sink = own.clone();
    let _own_sub = alice.on_sdp(move |_| *own_sink.lock() += 1);

    alice
        .send_sdp(SessionDescription::offer("v=0 relay"))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while received.lock().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "offer never arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let signal = received.lock()[0].clone();
    assert_eq!(signal.from, ParticipantId::new("alice"));
    assert_eq!(signal.payload, SessionDescription::offer("v=0 relay"));
    assert_eq!(*own.lock(), 0);

    alice.leave().await;
    bob.leave().await;
    wait_for_members(&state, &session.channel_name(), 0).await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _state) = spawn_relay().await;
    let body = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");
}
