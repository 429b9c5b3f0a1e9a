mod common;

use common::{chat_destination, node, setup, Net};
use rand_core::OsRng;
use trellis_core::destination::{DestinationName, GroupDestination, PlainInputDestination};
use trellis_core::packet::{
    DestinationType, Header, Packet, PacketDataBuffer, PacketType,
};
use trellis_transport::transport::TransportAction;

/// Single-destination datagrams encrypt to the announced ratchet key when
/// one is cached and still decrypt at the destination.
#[test]
fn single_datagram_with_ratchet() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let dest = chat_destination(&mut net.engines[a], "alpha");
    net.engines[a]
        .destination_mut(&dest)
        .expect("registered destination")
        .enable_ratchets(OsRng, 0.0);

    net.announce(a, &dest, 1.0);
    net.run(1.0);

    let actions = net.engines[b].send_data(&dest, b"ratcheted datagram", 2.0).expect("send");
    net.absorb(b, actions);
    net.run(2.0);

    let delivered = net.take_events(a).into_iter().any(|event| match event {
        TransportAction::DeliverLocal { data, .. } => data == b"ratcheted datagram",
        _ => false,
    });
    assert!(delivered);
}

/// Group members share a key; the datagram decrypts for a member and
/// never for an outsider.
#[test]
fn group_datagram_delivery() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let name = DestinationName::new("chat", "ops");
    let group_key = [0x31u8; 32];
    let receiver_group = GroupDestination::new(&group_key, name);
    let group_hash = net.engines[a].register_group_destination(receiver_group);

    let sender_group = GroupDestination::new(&group_key, name);
    let ciphertext = sender_group.encrypt(OsRng, b"to the group").expect("ciphertext");

    let mut data = PacketDataBuffer::empty();
    data.push(&ciphertext).expect("fits");
    let packet = Packet {
        header: Header {
            destination_type: DestinationType::Group,
            packet_type: PacketType::Data,
            ..Default::default()
        },
        ifac: None,
        destination: group_hash,
        transport: None,
        context: trellis_core::packet::PacketContext::None,
        data,
    };

    let actions = net.engines[b].outbound(packet, 2.0);
    net.absorb(b, actions);
    net.run(2.0);

    let delivered = net.take_events(a).into_iter().any(|event| match event {
        TransportAction::DeliverLocal { destination, data, .. } => {
            destination == group_hash && data == b"to the group"
        }
        _ => false,
    });
    assert!(delivered);
}

/// Plain destinations deliver their payload as-is.
#[test]
fn plain_datagram_delivery() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let plain = PlainInputDestination::new(DestinationName::new("info", "beacon"));
    let plain_hash = net.engines[a].register_plain_destination(&plain);

    let packet = Packet {
        header: Header {
            destination_type: DestinationType::Plain,
            packet_type: PacketType::Data,
            ..Default::default()
        },
        ifac: None,
        destination: plain_hash,
        transport: None,
        context: trellis_core::packet::PacketContext::None,
        data: PacketDataBuffer::from_slice(b"cleartext beacon"),
    };

    let actions = net.engines[b].outbound(packet, 2.0);
    net.absorb(b, actions);
    net.run(2.0);

    let delivered = net.take_events(a).into_iter().any(|event| match event {
        TransportAction::DeliverLocal { data, .. } => data == b"cleartext beacon",
        _ => false,
    });
    assert!(delivered);
}

/// Malformed frames are dropped and counted, never partially applied.
#[test]
fn malformed_frames_are_counted() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    let (iface_a, _) = net.connect(a, b, 1_000_000);

    let actions = net.engines[a].inbound(&[0u8; 4], iface_a, 1.0);
    assert!(actions.iter().any(|action| matches!(
        action,
        TransportAction::Drop { reason: trellis_core::error::TrellisError::MalformedPacket }
    )));
    assert_eq!(net.engines[a].stats().malformed, 1);
}
