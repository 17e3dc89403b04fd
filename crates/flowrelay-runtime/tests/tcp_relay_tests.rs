//! Relay scenarios over real TCP sockets on the loopback interface

use std::net::SocketAddr;
use std::time::Duration;

use flowrelay_core::{
    Drain, DrainConfig, Engine, EventHandler, FlowController, Handshaker, Pool, Relay,
    RelayConfig, Spout, SpoutConfig,
};
use flowrelay_runtime::{Driver, DriverConfig};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

const SCENARIO_TIMEOUT: Duration = Duration::from_secs(10);

async fn relay_driver(config: DriverConfig) -> (Driver, SocketAddr) {
    let mut driver = Driver::new(Engine::new(), config).unwrap();
    let local = driver.listen("127.0.0.1", 0).await.unwrap();
    (driver, local)
}

async fn run_spout(address: &str, count: u32) -> Spout {
    let mut engine = Engine::new();
    Pool::new().outgoing(&mut engine, address, None).unwrap();

    let mut driver = Driver::new(engine, DriverConfig::testing()).unwrap();
    let mut handshaker = Handshaker::new();
    let mut spout = Spout::new(&SpoutConfig {
        count,
        body: "msg".to_string(),
    });
    let mut handlers: [&mut dyn EventHandler; 2] = [&mut handshaker, &mut spout];
    driver.run(&mut handlers).await.unwrap();
    spout
}

async fn run_drain(address: &str, count: u32) -> Drain {
    let mut engine = Engine::new();
    Pool::new().incoming(&mut engine, address, None).unwrap();

    let mut driver = Driver::new(engine, DriverConfig::testing()).unwrap();
    let mut handshaker = Handshaker::new();
    let mut drain = Drain::new(&DrainConfig {
        count,
        block: false,
    });
    let mut handlers: [&mut dyn EventHandler; 2] = [&mut handshaker, &mut drain];
    driver.run(&mut handlers).await.unwrap();
    drain
}

#[tokio::test]
async fn test_spout_then_drain_over_tcp() {
    let (mut server, local) = relay_driver(DriverConfig::testing()).await;
    let config = RelayConfig::default();
    let mut handshaker = Handshaker::new();
    let mut flow = FlowController::new(config.credit_window).unwrap();
    let mut relay = Relay::new(&config);
    let mut handlers: [&mut dyn EventHandler; 3] = [&mut handshaker, &mut flow, &mut relay];

    let address = format!("//{}/queue", local);
    let clients = async {
        let spout = run_spout(&address, 3).await;
        let drain = run_drain(&address, 5).await;
        (spout, drain)
    };

    let (spout, drain) = timeout(SCENARIO_TIMEOUT, async {
        tokio::select! {
            result = server.run(&mut handlers) => panic!("relay exited early: {:?}", result),
            outcome = clients => outcome,
        }
    })
    .await
    .expect("scenario timed out");

    assert_eq!(spout.sent(), 3);
    assert_eq!(spout.confirmed(), 3);
    assert_eq!(spout.rejected(), 0);

    assert!(drain.is_done());
    assert_eq!(drain.received(), 3);
    let bodies: Vec<&[u8]> = drain.messages().iter().map(|m| m.payload()).collect();
    assert_eq!(bodies, vec![&b"msg 0"[..], &b"msg 1"[..], &b"msg 2"[..]]);
}

#[tokio::test]
async fn test_idle_peer_is_disconnected() {
    let (mut server, local) = relay_driver(DriverConfig {
        idle_timeout_secs: Some(1),
        ..DriverConfig::default()
    })
    .await;
    let mut handshaker = Handshaker::new();
    let mut handlers: [&mut dyn EventHandler; 1] = [&mut handshaker];

    let silent_peer = async {
        let mut stream = TcpStream::connect(local).await.unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        received
    };

    let received = timeout(SCENARIO_TIMEOUT, async {
        tokio::select! {
            result = server.run(&mut handlers) => panic!("relay exited early: {:?}", result),
            received = silent_peer => received,
        }
    })
    .await
    .expect("idle connection was never closed");

    assert!(received.is_empty());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed = listener.local_addr().unwrap();
    drop(listener);

    let mut engine = Engine::new();
    Pool::new()
        .incoming(&mut engine, &format!("//{}/queue", closed), None)
        .unwrap();
    let mut driver = Driver::new(engine, DriverConfig::testing()).unwrap();
    let mut handshaker = Handshaker::new();
    let mut handlers: [&mut dyn EventHandler; 1] = [&mut handshaker];

    let result = timeout(SCENARIO_TIMEOUT, driver.run(&mut handlers))
        .await
        .expect("driver did not give up");

    assert!(result.is_err());
    assert_eq!(driver.engine().connection_count(), 0);
}
