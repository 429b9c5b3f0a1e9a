//! Reference tokio embedding of the transport engine. One driver task owns
//! the engine and is the only place that mutates it; interface readers feed
//! a single event queue, a timer drives the maintenance tick, and engine
//! actions fan out to per-interface writer channels plus an event
//! broadcast.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use trellis_core::destination::SingleInputDestination;
use trellis_core::error::TrellisError;
use trellis_core::hash::AddressHash;

use crate::iface::{InterfaceDesc, InterfaceId};
use crate::link::LinkId;
use crate::transport::{TransportAction, TransportEngine};

const EVENT_QUEUE_CAPACITY: usize = 256;
const EVENT_BROADCAST_CAPACITY: usize = 64;
const WRITER_QUEUE_CAPACITY: usize = 128;

pub enum HostEvent {
    Inbound { iface: InterfaceId, frame: Vec<u8> },
    AttachInterface { desc: InterfaceDesc, writer: mpsc::Sender<Vec<u8>> },
    DetachInterface { iface: InterfaceId },
    RegisterDestination { destination: Box<SingleInputDestination> },
    Announce { destination: AddressHash, app_data: Option<Vec<u8>> },
    OpenLink {
        destination: AddressHash,
        reply: oneshot::Sender<Result<LinkId, TrellisError>>,
    },
    SendLinkData { link_id: LinkId, payload: Vec<u8> },
    SendResource {
        link_id: LinkId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<AddressHash, TrellisError>>,
    },
    CloseLink { link_id: LinkId },
    Identify { link_id: LinkId },
    SendData { destination: AddressHash, payload: Vec<u8> },
    RequestPath { destination: AddressHash },
}

/// Handle to a running driver task.
pub struct TransportHost {
    event_tx: mpsc::Sender<HostEvent>,
    notifications: broadcast::Sender<TransportAction>,
    cancel: CancellationToken,
}

impl TransportHost {
    /// Spawns the driver task. The engine moves into the task; all further
    /// access goes through events.
    pub fn spawn(engine: TransportEngine, tick_interval: Duration) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (notifications, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(drive(engine, event_rx, notifications.clone(), cancel.clone(), tick_interval));

        Self { event_tx, notifications, cancel }
    }

    pub fn events(&self) -> broadcast::Receiver<TransportAction> {
        self.notifications.subscribe()
    }

    pub async fn submit(&self, event: HostEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Registers an interface and returns the channel its writer should
    /// drain. Frames read from the medium go back in via
    /// `HostEvent::Inbound`.
    pub async fn attach_interface(&self, desc: InterfaceDesc) -> mpsc::Receiver<Vec<u8>> {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_QUEUE_CAPACITY);
        self.submit(HostEvent::AttachInterface { desc, writer: writer_tx }).await;
        writer_rx
    }

    pub async fn register_destination(&self, destination: SingleInputDestination) -> AddressHash {
        let address_hash = destination.desc.address_hash;
        self.submit(HostEvent::RegisterDestination { destination: Box::new(destination) }).await;
        address_hash
    }

    pub async fn open_link(&self, destination: AddressHash) -> Result<LinkId, TrellisError> {
        let (reply, response) = oneshot::channel();
        self.submit(HostEvent::OpenLink { destination, reply }).await;
        response.await.map_err(|_| TrellisError::LinkClosed)?
    }

    pub async fn send_resource(
        &self,
        link_id: LinkId,
        data: Vec<u8>,
    ) -> Result<AddressHash, TrellisError> {
        let (reply, response) = oneshot::channel();
        self.submit(HostEvent::SendResource { link_id, data, reply }).await;
        response.await.map_err(|_| TrellisError::LinkClosed)?
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for TransportHost {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(
    mut engine: TransportEngine,
    mut event_rx: mpsc::Receiver<HostEvent>,
    notifications: broadcast::Sender<TransportAction>,
    cancel: CancellationToken,
    tick_interval: Duration,
) {
    let started = Instant::now();
    let mut writers: HashMap<InterfaceId, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut ticker = tokio::time::interval(tick_interval);

    loop {
        let now = started.elapsed().as_secs_f64();

        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            }
            _ = ticker.tick() => {
                let actions = engine.tick(now);
                dispatch(actions, &mut writers, &notifications).await;
            }
            event = event_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                let actions = apply(&mut engine, event, &mut writers, now);
                dispatch(actions, &mut writers, &notifications).await;
            }
        }
    }
}

fn apply(
    engine: &mut TransportEngine,
    event: HostEvent,
    writers: &mut HashMap<InterfaceId, mpsc::Sender<Vec<u8>>>,
    now: f64,
) -> Vec<TransportAction> {
    match event {
        HostEvent::Inbound { iface, frame } => engine.inbound(&frame, iface, now),
        HostEvent::AttachInterface { desc, writer } => {
            writers.insert(desc.id, writer);
            engine.register_interface(desc, now);
            Vec::new()
        }
        HostEvent::DetachInterface { iface } => {
            writers.remove(&iface);
            engine.deregister_interface(&iface);
            Vec::new()
        }
        HostEvent::RegisterDestination { destination } => {
            engine.register_destination(*destination);
            Vec::new()
        }
        HostEvent::Announce { destination, app_data } => {
            engine.announce(&destination, app_data.as_deref(), now).unwrap_or_default()
        }
        HostEvent::OpenLink { destination, reply } => match engine.open_link(&destination, now) {
            Ok((link_id, actions)) => {
                let _ = reply.send(Ok(link_id));
                actions
            }
            Err(reason) => {
                let _ = reply.send(Err(reason));
                Vec::new()
            }
        },
        HostEvent::SendLinkData { link_id, payload } => {
            engine.send_link_data(&link_id, &payload, now).unwrap_or_default()
        }
        HostEvent::SendResource { link_id, data, reply } => {
            match engine.send_resource(&link_id, &data, now) {
                Ok((resource_id, actions)) => {
                    let _ = reply.send(Ok(resource_id));
                    actions
                }
                Err(reason) => {
                    let _ = reply.send(Err(reason));
                    Vec::new()
                }
            }
        }
        HostEvent::CloseLink { link_id } => engine.close_link(&link_id, now),
        HostEvent::Identify { link_id } => {
            engine.identify_on_link(&link_id, now).unwrap_or_default()
        }
        HostEvent::SendData { destination, payload } => {
            engine.send_data(&destination, &payload, now).unwrap_or_default()
        }
        HostEvent::RequestPath { destination } => engine.request_path(&destination, now),
    }
}

async fn dispatch(
    actions: Vec<TransportAction>,
    writers: &mut HashMap<InterfaceId, mpsc::Sender<Vec<u8>>>,
    notifications: &broadcast::Sender<TransportAction>,
) {
    for action in actions {
        match action {
            TransportAction::SendFrame { iface, bytes } => {
                if let Some(writer) = writers.get(&iface) {
                    if writer.send(bytes).await.is_err() {
                        log::warn!("host: writer for {} is gone", iface);
                    }
                }
            }
            other => {
                let _ = notifications.send(other);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rand_core::OsRng;
    use trellis_core::destination::new_in;
    use trellis_core::hash::AddressHash;
    use trellis_core::identity::PrivateIdentity;

    use super::{HostEvent, TransportHost};
    use crate::iface::{InterfaceDesc, InterfaceMode};
    use crate::transport::{TransportAction, TransportConfig, TransportEngine};

    fn fast_iface() -> InterfaceDesc {
        InterfaceDesc::new(
            AddressHash::random(OsRng),
            10_000_000,
            500,
            InterfaceMode::Full,
        )
    }

    #[tokio::test]
    async fn announce_crosses_between_hosts() {
        let host_a = TransportHost::spawn(
            TransportEngine::new(TransportConfig::new("a", &PrivateIdentity::new_from_rand(OsRng))),
            Duration::from_millis(50),
        );
        let host_b = TransportHost::spawn(
            TransportEngine::new(TransportConfig::new("b", &PrivateIdentity::new_from_rand(OsRng))),
            Duration::from_millis(50),
        );

        let iface_a = fast_iface();
        let iface_b = fast_iface();
        let mut writer_a = host_a.attach_interface(iface_a).await;
        let _writer_b = host_b.attach_interface(iface_b).await;

        // Frames leaving A's interface arrive on B's.
        {
            let host_b_events = host_b.event_tx.clone();
            tokio::spawn(async move {
                while let Some(frame) = writer_a.recv().await {
                    let _ = host_b_events
                        .send(HostEvent::Inbound { iface: iface_b.id, frame })
                        .await;
                }
            });
        }

        let destination = new_in(PrivateIdentity::new_from_rand(OsRng), "chat", "alpha");
        let dest_hash = host_a.register_destination(destination).await;

        let mut events = host_b.events();
        host_a.submit(HostEvent::Announce { destination: dest_hash, app_data: None }).await;

        let received = tokio::time::timeout(Duration::from_secs(2), async move {
            loop {
                match events.recv().await {
                    Ok(TransportAction::AnnounceReceived { destination, .. }) => {
                        return destination;
                    }
                    Ok(_) => continue,
                    Err(_) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("announce should arrive");

        assert_eq!(received, dest_hash);
    }
}
