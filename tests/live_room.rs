//! Two users in one room over a real listener: HTTP directory calls with
//! `reqwest`, the channel through `WsConnector` and `RoomSession`.

use std::sync::Arc;
use std::time::Duration;

use canvasroom::client::{
    ClientConfig, ClientError, ConnectionRegistry, ConnectionStatus, HttpPermissionSource, PermissionGate, RoomSession,
    SessionEvent, WsConnector,
};
use canvasroom::config::Config;
use canvasroom::db::MemoryRoomStore;
use canvasroom::model::{Room, Shape, WorkspaceRole};
use canvasroom::routes;
use canvasroom::services::permission::Permission;
use canvasroom::state::AppState;
use tokio::time::timeout;
use uuid::Uuid;

struct Live {
    base_url: String,
    store: Arc<MemoryRoomStore>,
}

async fn start_server() -> Live {
    let store = Arc::new(MemoryRoomStore::new());
    let state = AppState::new(store.clone(), Config::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, routes::app(state)).await.unwrap();
    });
    Live { base_url: format!("http://{addr}"), store }
}

async fn create_room(live: &Live, token: &str, workspace_id: Uuid) -> Room {
    let response = reqwest::Client::new()
        .post(format!("{}/rooms", live.base_url))
        .bearer_auth(token)
        .json(&serde_json::json!({"name": "Roadmap", "workspaceId": workspace_id}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    response.json().await.unwrap()
}

async fn join(live: &Live, token: &str, room_id: Uuid, user_id: Uuid) -> RoomSession {
    let config = ClientConfig::new(live.base_url.clone(), token);
    let registry = ConnectionRegistry::new(Arc::new(WsConnector::new(config.clone())));
    let source = Arc::new(HttpPermissionSource::new(&config).unwrap());
    let gate = Arc::new(PermissionGate::new(source, config.permission_ttl));
    let mut session = RoomSession::open(&registry, gate, room_id, user_id, &config).await.unwrap();
    wait_for(&mut session, |event| *event == SessionEvent::Synced).await;
    assert_eq!(session.status(), ConnectionStatus::Connected);
    session
}

/// Drive the session until `matches` accepts an event.
async fn wait_for(session: &mut RoomSession, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = session.next_event().await.expect("session ended");
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

fn sticky(id: &str, x: f64) -> Shape {
    Shape {
        id: id.into(),
        kind: "sticky".into(),
        x,
        y: 0.0,
        width: 120.0,
        height: 80.0,
        fill: "#ffe066".into(),
        stroke: "#000000".into(),
        stroke_width: 1.0,
        opacity: 1.0,
        rotation: 0.0,
        scale_x: 1.0,
        scale_y: 1.0,
        z_index: 0,
    }
}

#[tokio::test]
async fn editor_writes_reach_a_viewer_who_cannot_write_back() {
    let live = start_server().await;
    let workspace = Uuid::new_v4();
    let (owner, viewer) = (Uuid::new_v4(), Uuid::new_v4());
    live.store.add_member(workspace, owner, WorkspaceRole::Member).await;
    live.store.add_member(workspace, viewer, WorkspaceRole::Member).await;
    let owner_token = live.store.issue_session(owner).await;
    let viewer_token = live.store.issue_session(viewer).await;

    let room = create_room(&live, &owner_token, workspace).await;
    let mut editing = join(&live, &owner_token, room.id, owner).await;
    let mut watching = join(&live, &viewer_token, room.id, viewer).await;

    assert!(editing.can(Permission::Edit));
    assert!(watching.can(Permission::View));
    assert!(!watching.can(Permission::Edit));

    editing.put_shape(sticky("note-1", 10.0)).unwrap();
    wait_for(&mut watching, |event| *event == SessionEvent::ShapeChanged("note-1".into())).await;
    assert_eq!(watching.shapes().get("note-1"), Some(&sticky("note-1", 10.0)));

    wait_for(&mut editing, |event| *event == SessionEvent::ShapeSettled("note-1".into())).await;
    assert!(!editing.shapes().has_pending("note-1"));
    assert_eq!(editing.shapes().get("note-1"), Some(&sticky("note-1", 10.0)));

    assert!(matches!(watching.put_shape(sticky("note-2", 0.0)), Err(ClientError::Forbidden(Permission::Edit))));
    assert!(watching.shapes().get("note-2").is_none());

    editing.chat("hello").unwrap();
    let chat = wait_for(&mut watching, |event| matches!(event, SessionEvent::Chat(_))).await;
    let SessionEvent::Chat(line) = chat else { unreachable!() };
    assert_eq!(line.text, "hello");
}

#[tokio::test]
async fn deleting_the_room_over_http_ends_live_sessions() {
    let live = start_server().await;
    let workspace = Uuid::new_v4();
    let owner = Uuid::new_v4();
    live.store.add_member(workspace, owner, WorkspaceRole::Member).await;
    let token = live.store.issue_session(owner).await;

    let room = create_room(&live, &token, workspace).await;
    let mut session = join(&live, &token, room.id, owner).await;

    let response = reqwest::Client::new()
        .delete(format!("{}/rooms/{}", live.base_url, room.id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    wait_for(&mut session, |event| *event == SessionEvent::RoomDeleted).await;

    let response = reqwest::Client::new()
        .get(format!("{}/rooms/{}/permissions", live.base_url, room.id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let permissions: serde_json::Value = response.json().await.unwrap();
    assert_eq!(permissions["canView"], false);
}

#[tokio::test]
async fn unknown_token_is_rejected_everywhere() {
    let live = start_server().await;
    let response = reqwest::Client::new()
        .get(format!("{}/rooms?workspaceId={}", live.base_url, Uuid::new_v4()))
        .bearer_auth("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let health = reqwest::get(format!("{}/healthz", live.base_url)).await.unwrap();
    assert!(health.status().is_success());
}
