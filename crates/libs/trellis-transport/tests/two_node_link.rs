mod common;

use common::{chat_destination, node, setup, Net};
use trellis_transport::link::LinkStatus;
use trellis_transport::transport::TransportAction;

/// Two directly connected nodes: announce, path with one hop, link
/// activation after a single round trip, and a 200-byte in-link delivery.
#[test]
fn announce_link_and_deliver() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let dest = chat_destination(&mut net.engines[a], "alpha");

    net.announce(a, &dest, 1.0);
    net.run(1.0);

    assert_eq!(net.engines[b].hops_to(&dest), Some(1));
    assert!(net.engines[b].knows_destination(&dest));
    assert!(net
        .take_events(b)
        .iter()
        .any(|event| matches!(event, TransportAction::PathUpdated { destination, hops: 1 } if *destination == dest)));

    // One round trip: request out, proof back activates B, B's own proof
    // activates A.
    let (link_id, actions) = net.engines[b].open_link(&dest, 2.0).expect("link opens");
    net.absorb(b, actions);
    net.run(2.0);

    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Active));
    assert_eq!(net.engines[a].link_status(&link_id), Some(LinkStatus::Active));
    assert!(net
        .take_events(b)
        .iter()
        .any(|event| matches!(event, TransportAction::LinkActivated { link_id: id } if *id == link_id)));

    let payload = vec![0x42u8; 200];
    let actions = net.engines[b].send_link_data(&link_id, &payload, 3.0).expect("link data");
    net.absorb(b, actions);
    net.run(3.0);

    let delivered = net.take_events(a).into_iter().any(|event| match event {
        TransportAction::LinkData { link_id: id, data } => id == link_id && data == payload,
        _ => false,
    });
    assert!(delivered, "200-byte payload should reach the responder");
}

#[test]
fn identify_after_activation() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let dest = chat_destination(&mut net.engines[a], "alpha");
    net.announce(a, &dest, 1.0);
    net.run(1.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 2.0).expect("link opens");
    net.absorb(b, actions);
    net.run(2.0);

    let b_identity = net.engines[b].identity_hash();
    let actions = net.engines[b].identify_on_link(&link_id, 3.0).expect("identify");
    net.absorb(b, actions);
    net.run(3.0);

    assert_eq!(net.engines[a].link_peer_identity(&link_id), Some(b_identity));
    assert!(net
        .take_events(a)
        .iter()
        .any(|event| matches!(event, TransportAction::LinkIdentified { identity_hash, .. } if *identity_hash == b_identity)));
}

#[test]
fn outbound_without_path_reports_no_path() {
    setup();

    let mut net = Net::new();
    let b = net.add_node(node("b", false));
    let other = net.add_node(node("other", false));
    net.connect(b, other, 1_000_000);

    let unknown = trellis_core::hash::AddressHash::of(b"nowhere");
    assert!(net.engines[b].send_data(&unknown, b"payload", 1.0).is_err());

    let packet = trellis_core::packet::Packet {
        destination: unknown,
        ..Default::default()
    };
    let actions = net.engines[b].outbound(packet, 1.0);
    assert!(actions
        .iter()
        .any(|action| matches!(action, TransportAction::Drop { reason: trellis_core::error::TrellisError::NoPath })));
}

#[test]
fn register_destination_is_idempotent() {
    setup();

    let mut engine = node("a", false);
    let identity = trellis_core::identity::PrivateIdentity::new_from_rand(rand_core::OsRng);
    let first = engine
        .register_destination(trellis_core::destination::new_in(identity.clone(), "chat", "alpha"));
    let second = engine
        .register_destination(trellis_core::destination::new_in(identity, "chat", "alpha"));

    assert_eq!(first, second);
}
