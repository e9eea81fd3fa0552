//! Entry point: parse argv, bring up listeners/drivers/the control FIFO, and
//! drive everything from a single OS thread via a `LocalSet` — the `Router`
//! and its `Peer` records are `Rc`-based per §5's single-thread invariant,
//! so nothing here may run on a worker thread.

use std::cell::RefCell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use clap::Parser;
use hydrogen_protocol::{xml, Element, Msg, ParseContext};
use tokio::io::unix::AsyncFd;
use tracing::{error, info, warn};

use hydrogend::cli::Cli;
use hydrogend::config::RouterConfig;
use hydrogend::driver_local::{self, LocalDriverConfig};
use hydrogend::driver_remote;
use hydrogend::fifo::{self, FifoBuffer, FifoCommand};
use hydrogend::listener;
use hydrogend::logging;
use hydrogend::peer::{ClientInterest, DriverInfo, DriverKind, Peer, Role};
use hydrogend::queue::Transport;
use hydrogend::router::Router;

/// Shared handle to the optional per-day message log (§6 "Persisted
/// state"); `None` when `-l` wasn't given.
type DayLog = Rc<RefCell<Option<logging::DayLogWriter>>>;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = RouterConfig::from(cli);
    logging::init(config.verbosity);

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(config))
}

async fn run(config: RouterConfig) -> anyhow::Result<()> {
    let fifo_path = config.fifo.clone();
    let router = Rc::new(RefCell::new(Router::new(config.clone())));
    let day_log: DayLog = Rc::new(RefCell::new(config.log_dir.as_ref().map(logging::DayLogWriter::new)));

    let tcp_listener = listener::bind_tcp(config.port, false).await?;
    let unix_listener = listener::bind_unix(&config.unix_socket)?;

    for spec in &config.drivers {
        if spec.is_remote() {
            match driver_remote::parse(&spec.name) {
                Some(rspec) => {
                    tokio::task::spawn_local(run_remote_driver(router.clone(), day_log.clone(), rspec));
                }
                None => warn!(name = %spec.name, "malformed remote driver spec, ignoring"),
            }
        } else {
            let cfg = LocalDriverConfig {
                path: spec.name.clone(),
                device: spec.device.clone(),
                config_path: None,
                skel_path: None,
                prefix: None,
                use_socketpair: true,
            };
            tokio::task::spawn_local(run_local_driver(router.clone(), day_log.clone(), cfg, 0));
        }
    }

    tokio::task::spawn_local(accept_tcp_loop(router.clone(), day_log.clone(), tcp_listener));
    tokio::task::spawn_local(accept_unix_loop(router.clone(), day_log.clone(), unix_listener));

    if let Some(path) = fifo_path {
        tokio::task::spawn_local(fifo_loop(router.clone(), day_log.clone(), path));
    } else {
        maybe_exit(&router);
    }

    std::future::pending::<()>().await;
    Ok(())
}

/// §7: once every driver record is gone and there's no control FIFO to ever
/// bring up another one, there is nothing left for the daemon to do.
fn maybe_exit(router: &Rc<RefCell<Router>>) {
    let r = router.borrow();
    if r.drivers.is_empty() && r.config().fifo.is_none() {
        info!("no drivers remain and no control FIFO configured, exiting");
        std::process::exit(0);
    }
}

async fn accept_tcp_loop(router: Rc<RefCell<Router>>, day_log: DayLog, listener: tokio::net::TcpListener) {
    loop {
        match listener::accept_tcp(&listener).await {
            Ok((stream, addr)) => {
                info!(%addr, "accepted TCP client");
                tokio::task::spawn_local(run_client(router.clone(), day_log.clone(), Transport::Tcp(stream)));
            }
            Err(e) => error!(error = %e, "TCP accept failed"),
        }
    }
}

async fn accept_unix_loop(router: Rc<RefCell<Router>>, day_log: DayLog, listener: tokio::net::UnixListener) {
    loop {
        match listener::accept_unix(&listener).await {
            Ok(stream) => {
                match listener::peer_credentials(&stream) {
                    Some((uid, gid, pid)) => info!(uid, gid, pid, "accepted UNIX client"),
                    None => info!("accepted UNIX client"),
                }
                tokio::task::spawn_local(run_client(router.clone(), day_log.clone(), Transport::Unix(stream)));
            }
            Err(e) => error!(error = %e, "UNIX accept failed"),
        }
    }
}

async fn run_client(router: Rc<RefCell<Router>>, day_log: DayLog, transport: Transport) {
    let peer_id = router.borrow_mut().alloc_peer_id();
    let peer = Rc::new(RefCell::new(Peer::new(peer_id, transport, Role::Client(ClientInterest::default()))));
    router.borrow_mut().clients.push(peer.clone());

    run_peer(router.clone(), day_log, peer).await;
    router.borrow_mut().remove_dead();
}

async fn run_remote_driver(router: Rc<RefCell<Router>>, day_log: DayLog, spec: driver_remote::RemoteSpec) {
    let transport = match driver_remote::dial(&spec).await {
        Ok(t) => t,
        Err(e) => {
            error!(host = %spec.host, port = spec.port, error = %e, "failed to dial remote driver");
            maybe_exit(&router);
            return;
        }
    };

    let peer_id = router.borrow_mut().alloc_peer_id();
    let mut info = DriverInfo::default();
    let device_attr = match &spec.device {
        Some(d) => {
            info.learn_device(d);
            d.clone()
        }
        None => "*".to_owned(),
    };
    let peer = Rc::new(RefCell::new(Peer::new(
        peer_id,
        transport,
        Role::Driver { info, kind: DriverKind::Remote { host: spec.host.clone(), port: spec.port }, name: format!("{}:{}", spec.host, spec.port) },
    )));

    {
        let mut r = router.borrow_mut();
        r.drivers.push(peer.clone());
        let mut e = Element::new("getProperties");
        e.set_attr("device", device_attr);
        let msg = Msg::from_element(e);
        r.enqueue(&peer, &msg, false);
        msg.queuing_done();
    }

    run_peer(router.clone(), day_log.clone(), peer.clone()).await;

    let devices = served_devices(&peer);
    {
        let r = router.borrow();
        r.broadcast_del_property(&devices);
    }
    router.borrow_mut().remove_dead();
    warn!(host = %spec.host, port = spec.port, "remote driver connection closed");
    maybe_exit(&router);
}

/// §4.G: spawn, run, reap, and — budget permitting — restart a local
/// driver. Recurses on restart; `Box::pin` breaks the otherwise
/// infinite-sized future.
fn run_local_driver(
    router: Rc<RefCell<Router>>,
    day_log: DayLog,
    cfg: LocalDriverConfig,
    restarts: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()>>> {
    Box::pin(async move {
        let max_restarts = router.borrow().config().max_restarts;

        let spawned = match driver_local::spawn(&cfg) {
            Ok(s) => s,
            Err(e) => {
                error!(path = %cfg.path, error = %e, "failed to spawn local driver");
                maybe_exit(&router);
                return;
            }
        };
        let pid = spawned.pid;

        let peer_id = router.borrow_mut().alloc_peer_id();
        let mut info = DriverInfo::default();
        if let Some(d) = &cfg.device {
            info.learn_device(d);
        }
        let peer = Rc::new(RefCell::new(Peer::new(
            peer_id,
            spawned.transport,
            Role::Driver {
                info,
                kind: DriverKind::Local { restarts, restart_enabled: true },
                name: cfg.path.clone(),
            },
        )));

        {
            let mut r = router.borrow_mut();
            r.drivers.push(peer.clone());
            let mut e = Element::new("getProperties");
            if let Some(d) = &cfg.device {
                e.set_attr("device", d.clone());
            }
            let msg = Msg::from_element(e);
            r.enqueue(&peer, &msg, false);
            msg.queuing_done();
        }

        let device_label = cfg.device.clone().unwrap_or_else(|| cfg.path.clone());
        let stderr_task =
            tokio::task::spawn_local(run_stderr(day_log.clone(), spawned.stderr, device_label));

        run_peer(router.clone(), day_log.clone(), peer.clone()).await;
        stderr_task.abort();

        let exit_reason = reap_with_retries(pid).await;
        match exit_reason {
            Some(driver_local::ExitReason::Exited(code)) => warn!(pid, code, path = %cfg.path, "local driver exited"),
            Some(driver_local::ExitReason::Signaled(sig)) => warn!(pid, sig, path = %cfg.path, "local driver killed by signal"),
            None => {
                unsafe { libc::kill(pid, libc::SIGKILL) };
                warn!(pid, path = %cfg.path, "local driver did not reap in time, sent SIGKILL");
            }
        }

        let restart_enabled = {
            let p = peer.borrow();
            match &p.role {
                Role::Driver { kind: DriverKind::Local { restart_enabled, .. }, .. } => *restart_enabled,
                _ => false,
            }
        };

        let devices = served_devices(&peer);
        {
            let r = router.borrow();
            r.broadcast_del_property(&devices);
        }
        router.borrow_mut().remove_dead();

        if !should_restart(restart_enabled, restarts, max_restarts) {
            info!(path = %cfg.path, restarts, "not restarting local driver");
            maybe_exit(&router);
            return;
        }
        info!(path = %cfg.path, restarts = restarts + 1, "restarting local driver");
        run_local_driver(router, day_log, cfg, restarts + 1).await;
    })
}

/// §8 property 7: a driver is restarted exactly `min(K, maxrestarts)` times
/// across K crashes.
fn should_restart(restart_enabled: bool, restarts: u32, max_restarts: u32) -> bool {
    restart_enabled && restarts < max_restarts
}

async fn reap_with_retries(pid: libc::pid_t) -> Option<driver_local::ExitReason> {
    for _ in 0..50 {
        if let Some(reason) = driver_local::try_reap(pid) {
            return Some(reason);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

fn served_devices(peer: &Rc<RefCell<Peer>>) -> Vec<String> {
    let p = peer.borrow();
    match &p.role {
        Role::Driver { info, .. } => info.devices.iter().cloned().collect(),
        Role::Client(_) => Vec::new(),
    }
}

async fn run_stderr(day_log: DayLog, stderr: AsyncFd<OwnedFd>, device: String) {
    let mut line_buf = driver_local::StderrLineBuffer::new();
    let mut buf = [0u8; 4096];
    loop {
        let mut guard = match stderr.readable().await {
            Ok(g) => g,
            Err(_) => return,
        };
        let result = guard.try_io(|inner| {
            let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        });
        let n = match result {
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return,
            Err(_would_block) => continue,
        };
        for line in line_buf.feed(&buf[..n], &device) {
            info!(device = %device, "{line}");
            if let Some(writer) = day_log.borrow_mut().as_mut() {
                let _ = writer.log(&device, &line);
            }
        }
    }
}

/// Reads and dispatches one peer's full lifetime: parses inbound elements
/// off the transport and drains the outgoing queue, both driven from a
/// single `select!` so neither direction starves the other.
async fn run_peer(router: Rc<RefCell<Router>>, day_log: DayLog, peer: Rc<RefCell<Peer>>) {
    let peer_id = peer.borrow().id;
    let transport = peer.borrow().transport.clone();
    let is_driver = peer.borrow().is_driver();

    let mut parse_ctx = ParseContext::new();
    let mut read_buf = vec![0u8; hydrogend::queue::READ_BUF_SIZE];
    let mut incoming_fds: Vec<OwnedFd> = Vec::new();

    loop {
        if !peer.borrow().alive {
            break;
        }
        let want_write = {
            let p = peer.borrow();
            p.queue.has_pending() && !p.queue.is_write_closed()
        };

        let write_branch = async {
            let mut p = peer.borrow_mut();
            p.queue.drain_once(peer_id, &transport).await
        };

        tokio::select! {
            biased;
            result = transport.read(&mut read_buf) => {
                match result {
                    Ok((0, _)) => {
                        peer.borrow_mut().alive = false;
                    }
                    Ok((n, fds)) => {
                        incoming_fds.extend(fds);
                        match xml::parse_stream(&mut parse_ctx, &read_buf[..n]) {
                            Ok(elements) => {
                                for element in elements {
                                    if !peer.borrow().alive {
                                        break;
                                    }
                                    if element.tag == "message" {
                                        let device = element.find_attr("device").unwrap_or("").to_owned();
                                        let text = element.find_attr("message").unwrap_or("").to_owned();
                                        if let Some(writer) = day_log.borrow_mut().as_mut() {
                                            let _ = writer.log(&device, &text);
                                        }
                                    }
                                    let dispatch = {
                                        let mut r = router.borrow_mut();
                                        if is_driver {
                                            r.on_driver_message(&peer, element, &mut incoming_fds)
                                        } else {
                                            r.on_client_message(&peer, element, &mut incoming_fds)
                                        }
                                    };
                                    if let Err(e) = dispatch {
                                        warn!(peer_id, error = %e, "message dispatch failed, closing peer");
                                        peer.borrow_mut().alive = false;
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!(peer_id, error = %e, "parse error, closing peer");
                                peer.borrow_mut().alive = false;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "read failed, closing peer");
                        peer.borrow_mut().alive = false;
                    }
                }
            }
            result = write_branch, if want_write => {
                if let Err(e) = result {
                    warn!(peer_id, error = %e, "write failed");
                }
            }
        }
    }

    peer.borrow_mut().queue.drain_and_release(peer_id);
}

/// Opens the control FIFO read-only, non-blocking, CLOEXEC, reopening on
/// EOF or error (§4.J).
async fn fifo_loop(router: Rc<RefCell<Router>>, day_log: DayLog, path: PathBuf) {
    loop {
        match open_fifo(&path) {
            Ok(fd) => {
                if let Err(e) = drain_fifo(&router, &day_log, &fd).await {
                    warn!(error = %e, path = %path.display(), "control fifo error, reopening");
                }
            }
            Err(e) => {
                error!(error = %e, path = %path.display(), "failed to open control fifo");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn open_fifo(path: &Path) -> std::io::Result<AsyncFd<OwnedFd>> {
    let cpath = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let raw = unsafe { libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if raw < 0 {
        return Err(std::io::Error::last_os_error());
    }
    AsyncFd::new(unsafe { OwnedFd::from_raw_fd(raw) })
}

async fn drain_fifo(router: &Rc<RefCell<Router>>, day_log: &DayLog, fd: &AsyncFd<OwnedFd>) -> std::io::Result<()> {
    let mut fifo_buf = FifoBuffer::new();
    let mut buf = [0u8; 1024];
    loop {
        let mut guard = fd.readable().await?;
        let n = match guard.try_io(|inner| {
            let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                Err(std::io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        }) {
            Ok(result) => result?,
            Err(_would_block) => continue,
        };
        if n == 0 {
            return Ok(());
        }
        let lines = fifo_buf
            .feed(&buf[..n])
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        for line in lines {
            match fifo::parse_line(&line) {
                Ok(cmd) => handle_fifo_command(router, day_log, cmd),
                Err(e) => warn!(error = %e, line, "malformed control line"),
            }
        }
    }
}

fn handle_fifo_command(router: &Rc<RefCell<Router>>, day_log: &DayLog, cmd: FifoCommand) {
    match cmd {
        FifoCommand::Start { name, label, config, skel, prefix } => {
            if name.contains('@') {
                match driver_remote::parse(&name) {
                    Some(spec) => {
                        tokio::task::spawn_local(run_remote_driver(router.clone(), day_log.clone(), spec));
                    }
                    None => warn!(name, "malformed remote driver spec on control fifo"),
                }
            } else {
                let cfg = LocalDriverConfig {
                    path: name,
                    device: label,
                    config_path: config,
                    skel_path: skel,
                    prefix,
                    use_socketpair: true,
                };
                tokio::task::spawn_local(run_local_driver(router.clone(), day_log.clone(), cfg, 0));
            }
        }
        FifoCommand::Stop { name, .. } => {
            let r = router.borrow();
            for driver in &r.drivers {
                let mut p = driver.borrow_mut();
                let matches = matches!(&p.role, Role::Driver { name: n, .. } if *n == name);
                if !matches {
                    continue;
                }
                if let Role::Driver { kind: DriverKind::Local { restart_enabled, .. }, .. } = &mut p.role {
                    *restart_enabled = false;
                }
                p.alive = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrogend::config::RouterConfig;

    fn dummy_config() -> RouterConfig {
        RouterConfig {
            log_dir: None,
            max_queue_bytes: 128 * 1024 * 1024,
            max_stream_bytes: 5 * 1024 * 1024,
            port: 7624,
            unix_socket: "/tmp/x".to_owned(),
            fifo: None,
            max_restarts: 2,
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

    #[test]
    fn should_restart_respects_max_restarts() {
        assert!(should_restart(true, 0, 2));
        assert!(should_restart(true, 1, 2));
        assert!(!should_restart(true, 2, 2));
        assert!(!should_restart(false, 0, 2));
    }

    /// §8 property 7: a driver that keeps crashing is restarted exactly
    /// `min(K, maxrestarts)` times.
    #[test]
    fn restart_count_caps_at_max_restarts_across_a_crash_loop() {
        let max_restarts = 2;
        let crashes = 5;
        let mut restarts = 0;
        let mut actual_restarts = 0;
        for _ in 0..crashes {
            if !should_restart(true, restarts, max_restarts) {
                break;
            }
            restarts += 1;
            actual_restarts += 1;
        }
        assert_eq!(actual_restarts, max_restarts.min(crashes));
    }

    #[tokio::test]
    async fn fifo_start_with_label_propagates_device_into_config() {
        let cmd = fifo::parse_line(r#"start foo -n "cam" -c "/etc/foo.cfg""#).unwrap();
        match cmd {
            FifoCommand::Start { name, label, config, .. } => {
                assert_eq!(name, "foo");
                assert_eq!(label.as_deref(), Some("cam"));
                assert_eq!(config.as_deref(), Some("/etc/foo.cfg"));
            }
            _ => panic!("expected start"),
        }
    }

    #[tokio::test]
    async fn fifo_stop_disables_restart_and_marks_dead() {
        let router = Rc::new(RefCell::new(Router::new(dummy_config())));
        let day_log: DayLog = Rc::new(RefCell::new(None));
        let (transport, _client_side) = tcp_transport_pair().await;
        let id = router.borrow_mut().alloc_peer_id();
        let peer = Rc::new(RefCell::new(Peer::new(
            id,
            transport,
            Role::Driver {
                info: DriverInfo::default(),
                kind: DriverKind::Local { restarts: 0, restart_enabled: true },
                name: "bar".to_owned(),
            },
        )));
        router.borrow_mut().drivers.push(peer.clone());

        handle_fifo_command(&router, &day_log, FifoCommand::Stop { name: "bar".to_owned(), label: None });

        let p = peer.borrow();
        assert!(!p.alive);
        match &p.role {
            Role::Driver { kind: DriverKind::Local { restart_enabled, .. }, .. } => assert!(!restart_enabled),
            _ => panic!("expected local driver"),
        }
    }
}
