mod common;

use common::{chat_destination, node, setup, Net};
use trellis_core::error::TrellisError;
use trellis_transport::link::{LinkStatus, CLOSE_AFTER_SECS, STALE_AFTER_SECS};
use trellis_transport::transport::TransportAction;

fn establish(net: &mut Net, a: usize, b: usize) -> (trellis_core::hash::AddressHash, trellis_transport::link::LinkId) {
    let dest = chat_destination(&mut net.engines[a], "alpha");
    net.announce(a, &dest, 1.0);
    net.run(1.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 2.0).expect("link opens");
    net.absorb(b, actions);
    net.run(2.0);

    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Active));
    (dest, link_id)
}

/// Silence moves an active link to stale; one inbound packet restores it.
#[test]
fn stale_then_recover() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let (_dest, link_id) = establish(&mut net, a, b);

    // Drain the keepalives so silence is genuine on both sides.
    net.set_loss(|_| true);
    net.tick_all(2.0 + STALE_AFTER_SECS + 1.0);
    net.run(2.0 + STALE_AFTER_SECS + 1.0);
    net.clear_loss();

    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Stale));

    let now = 2.0 + STALE_AFTER_SECS + 2.0;
    let actions = net.engines[a].send_link_data(&link_id, b"still here", now).expect("data");
    net.absorb(a, actions);
    net.run(now);

    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Active));
}

/// Silence past the teardown threshold closes the link and fails its
/// resources.
#[test]
fn silence_closes_link() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let (_dest, link_id) = establish(&mut net, a, b);

    net.set_loss(|_| true);
    net.tick_all(2.0 + STALE_AFTER_SECS + 1.0);
    net.tick_all(2.0 + CLOSE_AFTER_SECS + 1.0);
    net.run(2.0 + CLOSE_AFTER_SECS + 1.0);
    net.clear_loss();

    assert_eq!(net.engines[b].link_status(&link_id), None);
    assert!(net.take_events(b).iter().any(|event| matches!(
        event,
        TransportAction::LinkClosed { reason: TrellisError::LinkClosed, .. }
    )));
}

/// An explicit close emits a teardown the peer honors immediately.
#[test]
fn teardown_propagates() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let (_dest, link_id) = establish(&mut net, a, b);

    let actions = net.engines[b].close_link(&link_id, 3.0);
    net.absorb(b, actions);
    net.run(3.0);

    assert_eq!(net.engines[b].link_status(&link_id), None);
    assert_eq!(net.engines[a].link_status(&link_id), None);
    assert!(net.take_events(a).iter().any(|event| matches!(
        event,
        TransportAction::LinkClosed { .. }
    )));
}

/// A link request that never completes is retired by the handshake timer.
#[test]
fn handshake_timeout_closes_pending() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let dest = chat_destination(&mut net.engines[a], "alpha");
    net.announce(a, &dest, 1.0);
    net.run(1.0);

    net.set_loss(|_| true);
    let (link_id, actions) = net.engines[b].open_link(&dest, 2.0).expect("link opens");
    net.absorb(b, actions);
    net.run(2.0);

    net.tick_all(60.0);
    net.clear_loss();

    assert_eq!(net.engines[b].link_status(&link_id), None);
    assert!(net.take_events(b).iter().any(|event| matches!(
        event,
        TransportAction::LinkClosed { reason: TrellisError::HandshakeTimeout, .. }
    )));
}
