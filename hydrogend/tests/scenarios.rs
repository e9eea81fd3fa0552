//! Multi-component scenarios: a client's property subscription and a
//! driver's reply round-tripping over a real TCP pair, and BLOB fan-out
//! gated by per-client `enableBLOB` mode across both plain and
//! ancillary-capable transports.
//!
//! These compose the router and peer types the way `run_peer` does, minus
//! the task-spawning plumbing in the binary: `hydrogend` is built as a
//! library plus a thin binary, so integration tests only ever see the
//! library's public surface.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use hydrogen_protocol::xml::parse_stream;
use hydrogen_protocol::{shared_buffer, Element, ParseContext};

use hydrogend::ancillary::AncillaryFd;
use hydrogend::config::RouterConfig;
use hydrogend::peer::{BlobMode, ClientInterest, DriverInfo, DriverKind, Peer, Role};
use hydrogend::queue::Transport;
use hydrogend::router::Router;

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

async fn tcp_transport_pair() -> (Transport, tokio::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (Transport::Tcp(server), client)
}

fn raw_socketpair() -> (OwnedFd, OwnedFd) {
    let mut sv = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, sv.as_mut_ptr()) };
    assert_eq!(rc, 0, "socketpair() failed");
    unsafe { (OwnedFd::from_raw_fd(sv[0]), OwnedFd::from_raw_fd(sv[1])) }
}

/// Drains everything queued for `peer` onto `transport`, retrying while a
/// BLOB production worker thread finishes.
async fn drain_all(peer: &Rc<RefCell<Peer>>, transport: &Transport) {
    for _ in 0..500 {
        if !peer.borrow().queue.has_pending() {
            return;
        }
        let id = peer.borrow().id;
        let progressed = {
            let mut p = peer.borrow_mut();
            p.queue.drain_once(id, transport).await.unwrap()
        };
        if !progressed {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    panic!("queue never drained in time");
}

/// Reads whatever is available within `timeout`, assuming at most one
/// readiness round (true for the small single-write messages these tests
/// exercise).
async fn read_available(stream: &tokio::net::TcpStream, timeout: Duration) -> Vec<u8> {
    let mut buf = vec![0u8; 64 * 1024];
    match tokio::time::timeout(timeout, stream.readable()).await {
        Ok(Ok(())) => match stream.try_read(&mut buf) {
            Ok(n) => buf[..n].to_vec(),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Vec::new(),
            Err(e) => panic!("read error: {e}"),
        },
        Ok(Err(e)) => panic!("readable() error: {e}"),
        Err(_elapsed) => Vec::new(),
    }
}

fn parse_one(bytes: &[u8]) -> Element {
    let mut ctx = ParseContext::new();
    let mut elements = parse_stream(&mut ctx, bytes).unwrap();
    assert_eq!(elements.len(), 1, "expected exactly one element, got {}", elements.len());
    elements.remove(0)
}

/// S1: a client that only ever sent a bare `getProperties` (no `device`)
/// still receives a `defTextVector` the local driver pushes for some
/// specific device, verbatim.
#[tokio::test]
async fn s1_bare_getproperties_client_receives_devices_property_update() {
    let mut router = Router::new(dummy_config());

    let driver_id = router.alloc_peer_id();
    let (driver_transport, _driver_keepalive) = tcp_transport_pair().await;
    let mut driver_info = DriverInfo::default();
    driver_info.learn_device("cam");
    let driver = Rc::new(RefCell::new(Peer::new(
        driver_id,
        driver_transport,
        Role::Driver { info: driver_info, kind: DriverKind::Local { restarts: 0, restart_enabled: true }, name: "fake".to_owned() },
    )));
    router.drivers.push(driver.clone());

    let client_id = router.alloc_peer_id();
    let (client_transport, client_side) = tcp_transport_pair().await;
    let client = Rc::new(RefCell::new(Peer::new(client_id, client_transport, Role::Client(ClientInterest::default()))));
    router.clients.push(client.clone());

    // A bare `getProperties` (no `device`): sets `allprops`, not a specific
    // subscription. The driver's later `defTextVector device="cam"` must
    // still reach this client.
    let mut incoming_fds = Vec::new();
    router.on_client_message(&client, Element::new("getProperties"), &mut incoming_fds).unwrap();

    let mut def_text = Element::new("defText");
    def_text.set_attr("name", "seconds");
    def_text.pcdata = Bytes::from_static(b"1");
    let mut vector = Element::new("defTextVector");
    vector.set_attr("device", "cam");
    vector.set_attr("name", "exposure");
    vector.children.push(def_text);

    let mut incoming_fds = Vec::new();
    router.on_driver_message(&driver, vector, &mut incoming_fds).unwrap();

    let transport = client.borrow().transport.clone();
    drain_all(&client, &transport).await;

    let received = read_available(&client_side, Duration::from_millis(200)).await;
    assert!(!received.is_empty(), "client never received the property update");
    let element = parse_one(&received);
    assert_eq!(element.tag, "defTextVector");
    assert_eq!(element.find_attr("device"), Some("cam"));
    assert_eq!(element.find_attr("name"), Some("exposure"));
    assert_eq!(element.children.len(), 1);
    assert_eq!(element.children[0].tag, "defText");
    assert_eq!(element.children[0].find_attr("name"), Some("seconds"));
}

/// S2: two plain-TCP clients subscribed to `cam`, one `B_ALSO` and one
/// `B_NEVER`. An attached BLOB from the driver reaches only the `B_ALSO`
/// client, inlined as base64 since neither client's transport is
/// ancillary-capable.
#[tokio::test]
async fn s2_blob_fanout_honors_per_client_enable_blob_mode() {
    let mut router = Router::new(dummy_config());

    let driver_id = router.alloc_peer_id();
    let (driver_transport, _driver_keepalive) = tcp_transport_pair().await;
    let mut driver_info = DriverInfo::default();
    driver_info.learn_device("cam");
    let driver = Rc::new(RefCell::new(Peer::new(
        driver_id,
        driver_transport,
        Role::Driver { info: driver_info, kind: DriverKind::Local { restarts: 0, restart_enabled: true }, name: "fake".to_owned() },
    )));
    router.drivers.push(driver.clone());

    let (c1_transport, c1_side) = tcp_transport_pair().await;
    let mut c1_interest = ClientInterest::default();
    c1_interest.set_interest("cam", "");
    c1_interest.set_blob_mode("cam", "", BlobMode::Also);
    let c1_id = router.alloc_peer_id();
    let c1 = Rc::new(RefCell::new(Peer::new(c1_id, c1_transport, Role::Client(c1_interest))));
    router.clients.push(c1.clone());

    let (c2_transport, c2_side) = tcp_transport_pair().await;
    let mut c2_interest = ClientInterest::default();
    c2_interest.set_interest("cam", "");
    c2_interest.set_blob_mode("cam", "", BlobMode::Never);
    let c2_id = router.alloc_peer_id();
    let c2 = Rc::new(RefCell::new(Peer::new(c2_id, c2_transport, Role::Client(c2_interest))));
    router.clients.push(c2.clone());

    let payload = b"0123456789abcdef"; // 16 bytes
    let (blob_fd, mut mapped) = shared_buffer::alloc(payload.len()).unwrap();
    mapped.as_mut_slice().copy_from_slice(payload);
    let _sealed = mapped.seal();

    let mut one_blob = Element::new("oneBLOB");
    one_blob.set_attr("name", "img");
    one_blob.set_attr("size", payload.len().to_string());
    one_blob.set_attr("format", ".fits");
    one_blob.set_attr("attached", "true");
    let mut vector = Element::new("setBLOBVector");
    vector.set_attr("device", "cam");
    vector.set_attr("name", "blobprop");
    vector.children.push(one_blob);

    let mut incoming_fds = vec![blob_fd];
    router.on_driver_message(&driver, vector, &mut incoming_fds).unwrap();

    let c1_wire_transport = c1.borrow().transport.clone();
    drain_all(&c1, &c1_wire_transport).await;
    let c2_wire_transport = c2.borrow().transport.clone();
    drain_all(&c2, &c2_wire_transport).await;

    let c1_received = read_available(&c1_side, Duration::from_millis(200)).await;
    assert!(!c1_received.is_empty(), "B_ALSO client never received the BLOB");
    let element = parse_one(&c1_received);
    assert_eq!(element.tag, "setBLOBVector");
    assert_eq!(element.children.len(), 1);
    assert_eq!(element.children[0].find_attr("attached"), None);
    assert_eq!(&element.children[0].pcdata[..], b"MDEyMzQ1Njc4OWFiY2RlZg==".as_slice());

    let c2_received = read_available(&c2_side, Duration::from_millis(50)).await;
    assert!(c2_received.is_empty(), "B_NEVER client must not receive a BLOB message");
}

/// S3: an ancillary-capable client (a UNIX-domain-equivalent socketpair) in
/// `B_ONLY` mode receives an inline BLOB re-encoded as an attached
/// `oneBLOB`, carried as a `SCM_RIGHTS` fd whose mapped contents match the
/// decoded bytes.
#[tokio::test]
async fn s3_blob_only_client_receives_attached_fd_with_decoded_bytes() {
    let mut router = Router::new(dummy_config());

    let driver_id = router.alloc_peer_id();
    let (driver_transport, _driver_keepalive) = tcp_transport_pair().await;
    let mut driver_info = DriverInfo::default();
    driver_info.learn_device("cam");
    let driver = Rc::new(RefCell::new(Peer::new(
        driver_id,
        driver_transport,
        Role::Driver { info: driver_info, kind: DriverKind::Local { restarts: 0, restart_enabled: true }, name: "fake".to_owned() },
    )));
    router.drivers.push(driver.clone());

    let (client_end, harness_end) = raw_socketpair();
    let client_ancillary = AncillaryFd::new(client_end).unwrap();
    let harness_ancillary = AncillaryFd::new(harness_end).unwrap();

    let mut interest = ClientInterest::default();
    interest.set_interest("cam", "");
    interest.set_blob_mode("cam", "", BlobMode::Only);
    let client_id = router.alloc_peer_id();
    let client = Rc::new(RefCell::new(Peer::new(
        client_id,
        Transport::Socketpair(client_ancillary),
        Role::Client(interest),
    )));
    router.clients.push(client.clone());

    let mut one_blob = Element::new("oneBLOB");
    one_blob.set_attr("name", "img");
    one_blob.set_attr("size", "3");
    one_blob.set_attr("format", ".fits");
    one_blob.pcdata = Bytes::from_static(b"YWJj"); // base64 of "abc"
    let mut vector = Element::new("setBLOBVector");
    vector.set_attr("device", "cam");
    vector.set_attr("name", "blobprop");
    vector.children.push(one_blob);

    let mut incoming_fds = Vec::new();
    router.on_driver_message(&driver, vector, &mut incoming_fds).unwrap();

    let client_wire_transport = client.borrow().transport.clone();
    drain_all(&client, &client_wire_transport).await;

    let mut buf = [0u8; 4096];
    let (n, fds) = tokio::time::timeout(Duration::from_millis(200), harness_ancillary.recv(&mut buf))
        .await
        .expect("timed out waiting for attached BLOB")
        .unwrap();
    assert!(n > 0);
    assert_eq!(fds.len(), 1, "expected exactly one SCM_RIGHTS fd carrying the BLOB");

    let element = parse_one(&buf[..n]);
    assert_eq!(element.tag, "setBLOBVector");
    assert_eq!(element.children[0].find_attr("attached"), Some("true"));

    let mapped = shared_buffer::attach(fds[0].as_raw_fd()).unwrap();
    assert_eq!(mapped.as_slice(), b"abc");
}
