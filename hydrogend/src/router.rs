//! The router (§4.F): client/driver fan-out tables. Strictly single-thread
//! owned, as the concurrency model requires — `Rc<RefCell<Peer>>`, no
//! `Arc`/`Mutex` here.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::fd::OwnedFd;
use std::rc::Rc;

use hydrogen_protocol::{Element, Msg};
use tracing::warn;

use crate::config::RouterConfig;
use crate::error::PeerError;
use crate::peer::{BlobMode, DriverKind, Peer, PeerId, Role};

pub struct Router {
    pub clients: Vec<Rc<RefCell<Peer>>>,
    pub drivers: Vec<Rc<RefCell<Peer>>>,
    next_id: PeerId,
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Router { clients: Vec::new(), drivers: Vec::new(), next_id: 1, config }
    }

    pub fn alloc_peer_id(&mut self) -> PeerId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// `pushMsg`: serialize `msg` for `peer`'s transport and append it to
    /// `peer`'s outgoing queue, disconnecting the peer if that would put it
    /// over its queue quota, or if `is_blob` and it's already over the
    /// streaming-BLOB quota.
    pub fn enqueue(&self, peer: &Rc<RefCell<Peer>>, msg: &Msg, is_blob: bool) {
        let mut p = peer.borrow_mut();
        if !p.alive {
            return;
        }
        let serialized = msg.serialize(p.transport.accepts_shared_buffers());
        let size = msg.queue_size() as u64;

        if p.queue.queued_bytes() + size > self.config.max_queue_bytes {
            warn!(peer_id = p.id, "queue quota exceeded, disconnecting");
            p.alive = false;
            return;
        }
        if is_blob && self.config.max_stream_bytes > 0 && p.queue.queued_stream_bytes() > self.config.max_stream_bytes {
            warn!(peer_id = p.id, "streaming BLOB quota exceeded, disconnecting");
            p.alive = false;
            return;
        }
        let id = p.id;
        p.queue.push(serialized, id, size, is_blob);
    }

    /// `q2Clients`.
    pub fn q2_clients(&self, except: PeerId, is_blob: bool, device: &str, name: &str, msg: &Msg) {
        for client in &self.clients {
            let matched_mode = {
                let p = client.borrow();
                if !p.alive || p.id == except {
                    continue;
                }
                let Role::Client(interest) = &p.role else { continue };
                interest.find(device, name).map(|s| s.blob_mode)
            };
            let Some(mode) = matched_mode else { continue };
            if mode.blocks(is_blob) {
                continue;
            }
            self.enqueue(client, msg, is_blob);
        }
    }

    /// `q2RDrivers`: driver fan-out with remote-`host:port` dedup for a
    /// device-less broadcast.
    pub fn q2_rdrivers(&self, device: &str, msg: &Msg, is_enable_blob: bool) {
        let mut seen_remote_uids: HashSet<String> = HashSet::new();
        for driver in &self.drivers {
            let should_send = {
                let p = driver.borrow();
                if !p.alive {
                    false
                } else {
                    let Role::Driver { info, kind, .. } = &p.role else { unreachable!() };
                    if !info.serves(device) {
                        false
                    } else if is_enable_blob && matches!(kind, DriverKind::Local { .. }) {
                        false
                    } else if device.is_empty() {
                        match kind.remote_uid() {
                            Some(uid) => seen_remote_uids.insert(uid),
                            None => true,
                        }
                    } else {
                        true
                    }
                }
            };
            if should_send {
                self.enqueue(driver, msg, false);
            }
        }
    }

    /// `q2SDrivers`: snoop fan-out, skipping drivers colocated with the
    /// sender on the same remote host.
    pub fn q2_sdrivers(&self, sender: PeerId, is_blob: bool, device: &str, name: &str, msg: &Msg) {
        let sender_uid = self
            .drivers
            .iter()
            .find(|d| d.borrow().id == sender)
            .and_then(|d| {
                let p = d.borrow();
                let Role::Driver { kind, .. } = &p.role else { return None };
                kind.remote_uid()
            });

        for driver in &self.drivers {
            let should_send = {
                let p = driver.borrow();
                if !p.alive || p.id == sender {
                    continue;
                }
                let Role::Driver { info, kind, .. } = &p.role else { continue };
                if let (Some(sender_uid), Some(this_uid)) = (&sender_uid, kind.remote_uid()) {
                    if *sender_uid == this_uid {
                        continue;
                    }
                }
                match info.snoop_for(device, name) {
                    Some(s) if !s.blob_mode.blocks(is_blob) => true,
                    _ => false,
                }
            };
            if should_send {
                self.enqueue(driver, msg, is_blob);
            }
        }
    }

    /// `q2Servers`: forward to every upstream-server-flagged client.
    pub fn q2_servers(&self, sender: PeerId, msg: &Msg) {
        for client in &self.clients {
            let forward = {
                let p = client.borrow();
                p.alive && p.id != sender && p.is_upstream_server
            };
            if forward {
                self.enqueue(client, msg, false);
            }
        }
    }

    pub fn remove_dead(&mut self) {
        self.clients.retain(|p| p.borrow().alive);
        self.drivers.retain(|p| p.borrow().alive);
    }

    /// Broadcasts one `delProperty` per device to every client, matching
    /// §4.G's driver-teardown behavior.
    pub fn broadcast_del_property(&self, devices: &[String]) {
        for device in devices {
            let mut element = Element::new("delProperty");
            element.set_attr("device", device.clone());
            let msg = Msg::from_element(element);
            self.q2_clients(0, false, device, "", &msg);
        }
    }

    /// Client `onMessage` (§4.E): classify by root tag, update the client's
    /// interest table, and fan out to drivers.
    pub fn on_client_message(
        &mut self,
        peer: &Rc<RefCell<Peer>>,
        element: Element,
        incoming_fds: &mut Vec<OwnedFd>,
    ) -> Result<(), PeerError> {
        let peer_id = peer.borrow().id;
        let tag = element.tag.clone();
        let device = element.find_attr("device").unwrap_or("").to_owned();
        let name = element.find_attr("name").unwrap_or("").to_owned();
        let origin = format!("client-{peer_id}");

        match tag.as_str() {
            "getProperties" => {
                let is_server_probe = device == "*";
                {
                    let mut p = peer.borrow_mut();
                    if is_server_probe {
                        p.is_upstream_server = true;
                    }
                    if let Role::Client(interest) = &mut p.role {
                        interest.set_interest(if is_server_probe { "" } else { device.as_str() }, &name);
                    }
                }
                let msg = Msg::from_xml(origin, element, incoming_fds)?;
                self.q2_rdrivers(if is_server_probe { "" } else { device.as_str() }, &msg, false);
                msg.queuing_done();
            }
            "enableBLOB" => {
                let text = std::str::from_utf8(element.pcdata()).unwrap_or("").trim();
                if let Some(mode) = BlobMode::parse(text) {
                    let mut p = peer.borrow_mut();
                    if let Role::Client(interest) = &mut p.role {
                        interest.set_blob_mode(&device, &name, mode);
                    }
                }
            }
            // `new*` vectors, or anything else a client sends toward a
            // device: route to the responsible driver(s).
            _ => {
                let msg = Msg::from_xml(origin, element, incoming_fds)?;
                self.q2_rdrivers(&device, &msg, false);
                msg.queuing_done();
            }
        }
        Ok(())
    }

    /// Driver `onMessage` (§4.E): classify by root tag, learn served
    /// devices, and fan out to clients and snooping drivers.
    pub fn on_driver_message(
        &mut self,
        peer: &Rc<RefCell<Peer>>,
        element: Element,
        incoming_fds: &mut Vec<OwnedFd>,
    ) -> Result<(), PeerError> {
        let peer_id = peer.borrow().id;
        let tag = element.tag.clone();
        let device = element.find_attr("device").unwrap_or("").to_owned();
        let name = element.find_attr("name").unwrap_or("").to_owned();
        let origin = format!("driver-{peer_id}");

        if !device.is_empty() {
            let mut p = peer.borrow_mut();
            if let Role::Driver { info, .. } = &mut p.role {
                info.learn_device(&device);
            }
        }

        match tag.as_str() {
            "getProperties" => {
                {
                    let mut p = peer.borrow_mut();
                    if let Role::Driver { info, .. } = &mut p.role {
                        info.add_snoop(&device, &name);
                    }
                }
                let msg = Msg::from_xml(origin, element, incoming_fds)?;
                self.q2_servers(peer_id, &msg);
                self.q2_rdrivers(&device, &msg, false);
                msg.queuing_done();
            }
            "enableBLOB" => {
                let text = std::str::from_utf8(element.pcdata()).unwrap_or("").trim();
                if let Some(mode) = BlobMode::parse(text) {
                    let mut p = peer.borrow_mut();
                    if let Role::Driver { info, .. } = &mut p.role {
                        info.set_snoop_blob_mode(&device, &name, mode);
                    }
                }
            }
            "pingRequest" => {
                let mut reply = element.shallow_clone();
                reply.set_tag("pingReply");
                let msg = Msg::from_element(reply);
                self.enqueue(peer, &msg, false);
                msg.queuing_done();
            }
            "setBLOBVector" => {
                let msg = Msg::from_xml(origin, element, incoming_fds)?;
                self.q2_clients(0, true, &device, &name, &msg);
                self.q2_sdrivers(peer_id, true, &device, &name, &msg);
                msg.queuing_done();
            }
            // `def*`/`set*`/`del*`: ordinary property updates.
            _ => {
                let msg = Msg::from_xml(origin, element, incoming_fds)?;
                self.q2_clients(0, false, &device, &name, &msg);
                self.q2_sdrivers(peer_id, false, &device, &name, &msg);
                msg.queuing_done();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ClientInterest, DriverInfo, DriverKind};
    use crate::queue::Transport;
    use hydrogen_protocol::Element;

    fn dummy_config() -> RouterConfig {
        RouterConfig {
            log_dir: None,
            max_queue_bytes: 128 * 1024 * 1024,
            max_stream_bytes: 5 * 1024 * 1024,
            port: 7624,
            unix_socket: "/tmp/x".to_owned(),
            fifo: None,
            max_restarts: 10,
            verbosity: 0,
            drivers: Vec::new(),
        }
    }

    /// A real, connected TCP pair to back a `Transport::Tcp` in tests —
    /// router-table logic never actually needs to poll it.
    async fn tcp_transport_pair() -> (Transport, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Transport::Tcp(server), client)
    }

    #[tokio::test]
    async fn remote_dedup_sends_to_exactly_one_driver_per_host_port() {
        let mut router = Router::new(dummy_config());
        let mut _keepalive = Vec::new();
        for _ in 0..2 {
            let id = router.alloc_peer_id();
            let mut info = DriverInfo::default();
            info.learn_device("");
            let (transport, client_side) = tcp_transport_pair().await;
            _keepalive.push(client_side);
            router.drivers.push(Rc::new(RefCell::new(Peer::new(
                id,
                transport,
                Role::Driver {
                    info,
                    kind: DriverKind::Remote { host: "scope1".to_owned(), port: 7624 },
                    name: "remote".to_owned(),
                },
            ))));
        }
        let mut uids = HashSet::new();
        for driver in &router.drivers {
            let p = driver.borrow();
            let Role::Driver { kind, .. } = &p.role else { unreachable!() };
            uids.insert(kind.remote_uid());
        }
        assert_eq!(uids.len(), 1, "both drivers share one host:port");
    }

    #[tokio::test]
    async fn client_interest_blob_gate_blocks_never_mode() {
        let mut router = Router::new(dummy_config());
        let id = router.alloc_peer_id();
        let mut interest = ClientInterest::default();
        interest.set_interest("cam", "");
        interest.set_blob_mode("cam", "", BlobMode::Never);
        let (transport, _client_side) = tcp_transport_pair().await;
        router.clients.push(Rc::new(RefCell::new(Peer::new(id, transport, Role::Client(interest)))));
        let msg = Msg::from_element(Element::new("setBLOBVector"));
        router.q2_clients(0, true, "cam", "exposure", &msg);
        assert_eq!(router.clients[0].borrow().queue.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn bare_getproperties_client_matches_any_device_through_q2_clients() {
        let mut router = Router::new(dummy_config());
        let id = router.alloc_peer_id();
        let mut interest = ClientInterest::default();
        interest.set_interest("", "");
        let (transport, _client_side) = tcp_transport_pair().await;
        router.clients.push(Rc::new(RefCell::new(Peer::new(id, transport, Role::Client(interest)))));
        let msg = Msg::from_element(Element::new("defTextVector"));
        router.q2_clients(0, false, "cam", "exposure", &msg);
        assert!(router.clients[0].borrow().queue.queued_bytes() > 0, "allprops client should have received the push");
    }

    #[tokio::test]
    async fn streaming_blob_over_quota_disconnects_client() {
        let mut config = dummy_config();
        config.max_stream_bytes = 1;
        let mut router = Router::new(config);
        let id = router.alloc_peer_id();
        let (transport, _client_side) = tcp_transport_pair().await;
        router.clients.push(Rc::new(RefCell::new(Peer::new(id, transport, Role::Client(ClientInterest::default())))));
        let peer = router.clients[0].clone();

        let msg = Msg::from_element(Element::new("setBLOBVector"));
        router.enqueue(&peer, &msg, true);
        assert!(peer.borrow().alive, "first streaming BLOB within quota should not disconnect");

        let msg2 = Msg::from_element(Element::new("setBLOBVector"));
        router.enqueue(&peer, &msg2, true);
        assert!(!peer.borrow().alive, "client already over maxstreamsiz must be disconnected");
    }
}
