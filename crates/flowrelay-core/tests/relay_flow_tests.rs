//! End-to-end relay scenarios over the in-memory loopback
//!
//! Producers and consumers run their own engines and talk to one relay
//! engine through `Loopback`, exercising handshakes, credit replenishment,
//! the send loop and both drain modes.

mod test_utils;

use flowrelay_core::{
    Address, BacklogConfig, Drain, DrainConfig, EngineConfig, RelayConfig, SelectionPolicy, Spout,
    SpoutConfig,
};
use test_utils::{run, Client, RelayServer};

const QUEUE: &str = "//localhost/queue";

fn spout(count: u32, body: &str) -> Spout {
    Spout::new(&SpoutConfig {
        count,
        body: body.to_string(),
    })
}

fn drain(count: u32, block: bool) -> Drain {
    Drain::new(&DrainConfig { count, block })
}

/// Publish `count` messages and wait for the producer to disconnect
fn publish(server: &mut RelayServer, count: u32) {
    let mut producer = Client::outgoing(server, QUEUE, spout(count, "msg"));
    run(server, &mut [&mut producer]);
    assert!(producer.handler.is_done());
    assert_eq!(producer.handler.confirmed(), count);
    assert!(producer.is_disconnected());
}

fn backlog(server: &RelayServer) -> usize {
    server.relay.store().backlog(&Address::from(QUEUE))
}

#[test]
fn test_messages_are_buffered_without_consumer() {
    let mut server = RelayServer::new(RelayConfig::default());

    publish(&mut server, 3);

    assert_eq!(backlog(&server), 3);
    assert_eq!(server.relay.stats().received, 3);
    assert_eq!(server.engine.connection_count(), 0);
}

#[test]
fn test_blocking_drain_stops_at_count() {
    let mut server = RelayServer::new(RelayConfig::default());
    publish(&mut server, 5);

    let mut consumer = Client::incoming(&mut server, QUEUE, drain(3, true));
    run(&mut server, &mut [&mut consumer]);

    assert_eq!(consumer.handler.received(), 3);
    assert!(consumer.handler.is_done());
    assert!(consumer.is_disconnected());
    assert_eq!(backlog(&server), 2);

    let bodies: Vec<String> = consumer
        .handler
        .messages()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(bodies, vec!["msg 0", "msg 1", "msg 2"]);
}

#[test]
fn test_non_blocking_drain_ends_when_backlog_runs_out() {
    let mut server = RelayServer::new(RelayConfig::default());
    publish(&mut server, 2);

    let mut consumer = Client::incoming(&mut server, QUEUE, drain(5, false));
    run(&mut server, &mut [&mut consumer]);

    assert_eq!(consumer.handler.received(), 2);
    assert!(consumer.handler.is_done());
    assert!(consumer.is_disconnected());
    assert!(!server.relay.store().contains(&Address::from(QUEUE)));
}

#[test]
fn test_non_blocking_drain_of_empty_address() {
    let mut server = RelayServer::new(RelayConfig::default());

    let mut consumer = Client::incoming(&mut server, QUEUE, drain(5, false));
    run(&mut server, &mut [&mut consumer]);

    assert_eq!(consumer.handler.received(), 0);
    assert!(consumer.handler.is_done());
    assert!(consumer.is_disconnected());
}

#[test]
fn test_waiting_consumer_receives_new_messages() {
    let mut server = RelayServer::new(RelayConfig::default());
    let mut consumer = Client::incoming(&mut server, QUEUE, drain(2, true));
    run(&mut server, &mut [&mut consumer]);
    assert!(!consumer.handler.is_done());

    let mut producer = Client::outgoing(&mut server, QUEUE, spout(2, "live"));
    run(&mut server, &mut [&mut consumer, &mut producer]);

    assert_eq!(consumer.handler.received(), 2);
    assert!(consumer.handler.is_done());
    assert!(producer.handler.is_done());
    assert_eq!(backlog(&server), 0);
}

#[test]
fn test_small_window_is_replenished() {
    let mut server = RelayServer::new(RelayConfig::testing());

    publish(&mut server, 10);

    assert_eq!(server.relay.stats().received, 10);
    assert_eq!(backlog(&server), 10);
}

#[test]
fn test_fragmented_messages_arrive_whole() {
    let mut server = RelayServer::with_engine(RelayConfig::default(), EngineConfig::fragmenting(3));
    let mut producer = Client::connect(
        &mut server,
        QUEUE,
        spout(1, "Hello World!"),
        true,
        EngineConfig::fragmenting(3),
    );
    run(&mut server, &mut [&mut producer]);
    assert_eq!(backlog(&server), 1);

    let mut consumer = Client::incoming(&mut server, QUEUE, drain(1, false));
    run(&mut server, &mut [&mut consumer]);

    assert_eq!(consumer.handler.received(), 1);
    assert_eq!(consumer.handler.messages()[0].payload(), b"Hello World!");
}

#[test]
fn test_full_backlog_rejects_producer() {
    let config = RelayConfig {
        backlog: BacklogConfig::reject_after(2),
        ..RelayConfig::default()
    };
    let mut server = RelayServer::new(config);

    let mut producer = Client::outgoing(&mut server, QUEUE, spout(3, "msg"));
    run(&mut server, &mut [&mut producer]);

    assert!(producer.handler.is_done());
    assert_eq!(producer.handler.confirmed(), 3);
    assert_eq!(producer.handler.rejected(), 1);
    assert_eq!(backlog(&server), 2);
    assert_eq!(server.relay.stats().rejected, 1);
}

#[test]
fn test_round_robin_spreads_across_consumers() {
    let config = RelayConfig {
        selection: SelectionPolicy::RoundRobin,
        ..RelayConfig::default()
    };
    let mut server = RelayServer::new(config);
    let mut first = Client::incoming(&mut server, QUEUE, drain(1, true));
    let mut second = Client::incoming(&mut server, QUEUE, drain(1, true));
    run(&mut server, &mut [&mut first, &mut second]);

    let mut producer = Client::outgoing(&mut server, QUEUE, spout(2, "msg"));
    run(&mut server, &mut [&mut first, &mut second, &mut producer]);

    assert_eq!(first.handler.received(), 1);
    assert_eq!(second.handler.received(), 1);
    assert_eq!(backlog(&server), 0);
}

#[test]
fn test_zero_count_consumer_takes_nothing() {
    let mut server = RelayServer::new(RelayConfig::default());
    publish(&mut server, 1);

    let mut consumer = Client::incoming(&mut server, QUEUE, drain(0, true));
    run(&mut server, &mut [&mut consumer]);

    assert!(consumer.handler.is_done());
    assert_eq!(consumer.handler.received(), 0);
    assert_eq!(backlog(&server), 1);
}
