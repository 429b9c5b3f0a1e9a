mod common;

use common::{node, setup, Net};
use rand_core::OsRng;
use trellis_core::destination::new_in;
use trellis_core::identity::PrivateIdentity;
use trellis_transport::link::LinkStatus;

/// Responder announces with ratchets; a new initiator keys its link to the
/// freshest ratchet and still reaches Active.
#[test]
fn link_uses_current_ratchet() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let mut destination = new_in(PrivateIdentity::new_from_rand(OsRng), "chat", "alpha");
    destination.enable_ratchets(OsRng, 0.0);
    let dest = net.engines[a].register_destination(destination);

    net.announce(a, &dest, 1.0);
    net.run(1.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 2.0).expect("link opens");
    net.absorb(b, actions);
    net.run(2.0);

    assert_eq!(net.engines[a].link_status(&link_id), Some(LinkStatus::Active));
    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Active));
}

/// After rotation with a retention window, sessions keyed to the previous
/// ratchet still come up: the responder retains the retired secret.
#[test]
fn retained_ratchet_still_accepts_links() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let mut destination = new_in(PrivateIdentity::new_from_rand(OsRng), "chat", "alpha");
    destination.enable_ratchets(OsRng, 0.0);
    let dest = net.engines[a].register_destination(destination);

    // B learns the pre-rotation ratchet.
    net.announce(a, &dest, 1.0);
    net.run(1.0);

    net.engines[a]
        .destination_mut(&dest)
        .expect("registered destination")
        .rotate_ratchet(OsRng, 700.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 701.0).expect("link opens");
    net.absorb(b, actions);
    net.run(701.0);

    assert_eq!(net.engines[a].link_status(&link_id), Some(LinkStatus::Active));
}

/// Once the old secret falls out of the retention window, a session keyed
/// to the previous ratchet cannot be established: the responder can no
/// longer derive its keys.
#[test]
fn rotated_out_ratchet_is_unusable() {
    setup();

    let mut net = Net::new();
    let a = net.add_node(node("a", false));
    let b = net.add_node(node("b", false));
    net.connect(a, b, 1_000_000);

    let mut destination = new_in(PrivateIdentity::new_from_rand(OsRng), "chat", "alpha");
    destination.enable_ratchets(OsRng, 0.0);
    destination.set_retained_ratchets(1).expect("retention window");
    let dest = net.engines[a].register_destination(destination);

    // B caches the old ratchet key from the first announce.
    net.announce(a, &dest, 1.0);
    net.run(1.0);

    // Rotation discards the only retained secret.
    net.engines[a]
        .destination_mut(&dest)
        .expect("registered destination")
        .rotate_ratchet(OsRng, 700.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 701.0).expect("request sent");
    net.absorb(b, actions);
    net.run(701.0);

    assert_eq!(net.engines[b].link_status(&link_id), Some(LinkStatus::Pending));
    assert_eq!(net.engines[a].link_status(&link_id), None);

    // A fresh announce distributes the new ratchet and links work again.
    net.announce(a, &dest, 702.0);
    net.run(702.0);

    let (link_id, actions) = net.engines[b].open_link(&dest, 703.0).expect("link opens");
    net.absorb(b, actions);
    net.run(703.0);

    assert_eq!(net.engines[a].link_status(&link_id), Some(LinkStatus::Active));
}
