use futures_util::StreamExt;
use pairline::config::{Config, SignalingConfig};
use pairline::media::{MediaCapability, SampleSource};
use pairline::peer::RtcTransportFactory;
use pairline::signaling::{events, Envelope};
use pairline::store::{CallStore, ConnectionState};
use pairline::{Orchestrator, SignalingChannel};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;

async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("client never connected")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn next_event(ws: &mut WebSocketStream<TcpStream>) -> String {
    let read = async {
        loop {
            match ws.next().await {
                Some(Ok(msg)) if msg.is_text() => {
                    let env: Envelope = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                    return env.event;
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    };
    timeout(Duration::from_secs(5), read)
        .await
        .expect("no event from client")
}

#[tokio::test]
async fn join_reaches_server_on_startup_and_after_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut config = Config::default();
    config.signaling = SignalingConfig {
        url: format!("ws://{addr}"),
        reconnect_delay_ms: 50,
    };
    let channel = SignalingChannel::new(config.signaling.clone());
    let store = Arc::new(CallStore::new());
    let media = Arc::new(MediaCapability::new(Arc::new(SampleSource), &config.media));
    let mut orch = Orchestrator::new(
        &config,
        channel.clone(),
        media,
        Arc::new(RtcTransportFactory::default()),
        store.clone(),
    );
    orch.attach();
    let handle = orch.handle();
    let call = tokio::spawn(orch.run());

    // same order as the headless client: connect, then start right away
    channel.connect();
    assert!(handle.start());

    let mut first = accept(&listener).await;
    assert_eq!(next_event(&mut first).await, events::JOIN);

    // server restarts the link; matchmaking state is gone with it
    first.close(None).await.unwrap();
    drop(first);

    let mut second = accept(&listener).await;
    assert_eq!(next_event(&mut second).await, events::JOIN);
    assert_eq!(channel.generation(), 2);
    assert_eq!(store.snapshot().connection_state, ConnectionState::Searching);

    assert!(handle.shutdown());
    call.await.unwrap();
    channel.disconnect();
}
