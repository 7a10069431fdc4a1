use std::{sync::Arc, time::Duration};

use coachline::{
    AppState,
    config::Config,
    conversation::UserId,
    routes::USER_HEADER,
    store::{ChangeFeed, PublishingStore, SqliteMessageStore},
};
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    base: String,
    http: reqwest::Client,
    coach: UserId,
    trainee: UserId,
}

impl Server {
    async fn start() -> Self {
        let feed = ChangeFeed::new();
        let store = SqliteMessageStore::open("sqlite::memory:").await.unwrap();
        let state = AppState::new(
            Arc::new(PublishingStore::new(store, feed.clone())),
            feed,
            &Config::default(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, coachline::app(state)).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            coach: UserId::new(),
            trainee: UserId::new(),
        }
    }

    fn thread(&self, tail: &str) -> String {
        format!("{}/coaches/{}/trainees/{}/{tail}", self.base, self.coach, self.trainee)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn socket(&self, user: UserId) -> Socket {
        let url = format!("{}?user_id={user}", self.thread("ws").replacen("http", "ws", 1));
        tokio_tungstenite::connect_async(url).await.unwrap().0
    }

    fn as_user(&self, user: UserId, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header(USER_HEADER, user.to_string())
    }
}

#[tokio::test]
async fn message_lifecycle_over_http() {
    let s = Server::start().await;

    let sent = s
        .as_user(s.coach, s.http.post(s.thread("messages")))
        .json(&json!({ "body": "Hello **there**" }))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), StatusCode::CREATED);
    let sent: Value = sent.json().await.unwrap();
    assert_eq!(sent["sender_role"], "coach");
    let id = sent["id"].as_str().unwrap().to_owned();

    let listed: Value = s
        .as_user(s.trainee, s.http.get(s.thread("messages")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["is_mine"], false);
    assert!(listed[0]["html"].as_str().unwrap().contains("<strong>there</strong>"));

    let unread: Value = s
        .as_user(s.trainee, s.http.get(s.url("/unread")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(unread["total"], 1);

    let edited = s
        .as_user(s.coach, s.http.patch(s.url(&format!("/messages/{id}"))))
        .json(&json!({ "body": "Hello again", "expected_version": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(edited.status(), StatusCode::OK);

    let stale = s
        .as_user(s.coach, s.http.patch(s.url(&format!("/messages/{id}"))))
        .json(&json!({ "body": "late", "expected_version": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(stale.status(), StatusCode::CONFLICT);

    let read: Value = s
        .as_user(s.trainee, s.http.post(s.url("/messages/read")))
        .json(&json!({ "ids": [id] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read[0]["is_read"], true);

    let deleted = s
        .as_user(s.coach, s.http.delete(s.url(&format!("/messages/{id}"))))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn outsiders_and_anonymous_callers_are_refused() {
    let s = Server::start().await;

    let anonymous = s.http.get(s.thread("messages")).send().await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let stranger = s
        .as_user(UserId::new(), s.http.get(s.thread("messages")))
        .send()
        .await
        .unwrap();
    assert_eq!(stranger.status(), StatusCode::FORBIDDEN);

    let garbled = s
        .http
        .get(s.thread("messages"))
        .header(USER_HEADER, "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(garbled.status(), StatusCode::BAD_REQUEST);

    let empty = s
        .as_user(s.trainee, s.http.post(s.thread("messages")))
        .json(&json!({ "body": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);
    let body: Value = empty.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn presence_and_typing_endpoints() {
    let s = Server::start().await;

    let beat = s
        .as_user(s.trainee, s.http.post(s.url("/presence/heartbeat")))
        .send()
        .await
        .unwrap();
    assert_eq!(beat.status(), StatusCode::NO_CONTENT);

    let presence: Value = s
        .as_user(s.coach, s.http.get(s.url(&format!("/presence?ids={},{}", s.trainee, s.coach))))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(presence[s.trainee.to_string()]["is_online"], true);
    assert_eq!(presence[s.coach.to_string()]["is_online"], false);

    let typing = s
        .as_user(s.trainee, s.http.post(s.thread("typing")))
        .json(&json!({ "is_typing": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(typing.status(), StatusCode::NO_CONTENT);
}

/// Next frame of the given kind, skipping the others.
async fn next_frame(socket: &mut Socket, kind: &str) -> Value {
    let wait = async {
        loop {
            let message = socket.next().await.unwrap().unwrap();
            let Ok(text) = message.to_text() else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            if frame["kind"] == kind {
                return frame;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await.unwrap()
}

#[tokio::test]
async fn socket_streams_messages_and_unread_counts() {
    let s = Server::start().await;
    let mut socket = s.socket(s.trainee).await;

    let sent = s
        .as_user(s.coach, s.http.post(s.thread("messages")))
        .json(&json!({ "body": "check in" }))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), StatusCode::CREATED);

    let inserted = next_frame(&mut socket, "store").await;
    assert_eq!(inserted["type"], "inserted");
    assert_eq!(inserted["body"], "check in");

    let mut unread = next_frame(&mut socket, "unread").await;
    while unread["total"] != 1 {
        unread = next_frame(&mut socket, "unread").await;
    }
    assert_eq!(unread["by_counterparty"][s.coach.to_string()], 1);

    // the open socket heartbeats for its user
    let presence: Value = s
        .as_user(s.coach, s.http.get(s.url(&format!("/presence?ids={}", s.trainee))))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(presence[s.trainee.to_string()]["is_online"], true);
}
