//! Client and driver records (§4.E) and the router's peer table entry that
//! wraps each one with its `MsgQueue` and transport.

use std::collections::HashSet;
use std::rc::Rc;

use crate::queue::{MsgQueue, Transport};

pub type PeerId = u64;

/// `crackBLOB`: parses an `enableBLOB` CDATA payload. Unknown values are
/// ignored by the caller (the existing mode is left unchanged), matching
/// the original's case-sensitive exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobMode {
    #[default]
    Never,
    Also,
    Only,
}

impl BlobMode {
    pub fn parse(cdata: &str) -> Option<BlobMode> {
        match cdata {
            "Also" => Some(BlobMode::Also),
            "Only" => Some(BlobMode::Only),
            "Never" => Some(BlobMode::Never),
            _ => None,
        }
    }

    /// Routing gate (§8 property 5): `true` means this peer must *not*
    /// receive a message with BLOB-ness `is_blob`.
    pub fn blocks(self, is_blob: bool) -> bool {
        match self {
            BlobMode::Never => is_blob,
            BlobMode::Only => !is_blob,
            BlobMode::Also => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Subscription {
    pub device: String,
    pub name: String,
    pub blob_mode: BlobMode,
}

/// A client's interest table: either "all properties" or a set of
/// `(device, name)` subscriptions.
#[derive(Debug, Clone, Default)]
pub struct ClientInterest {
    pub allprops: bool,
    pub subscriptions: Vec<Subscription>,
    /// Synthetic `B_NEVER` subscription handed back by `find` for a client
    /// that saw a bare `getProperties` (no `device`): it must match *any*
    /// device, not just a device-less push, the way indiserver's
    /// `cp->allprops` gate does.
    allprops_sub: Subscription,
}

impl ClientInterest {
    /// `findDevice`.
    pub fn find(&self, device: &str, name: &str) -> Option<&Subscription> {
        if let Some(s) = self.subscriptions.iter().find(|s| {
            (s.device == device && s.name == name) || (s.device == device && s.name.is_empty())
        }) {
            return Some(s);
        }
        if self.allprops {
            return Some(&self.allprops_sub);
        }
        None
    }

    pub fn set_interest(&mut self, device: &str, name: &str) {
        if device.is_empty() {
            self.allprops = true;
            return;
        }
        if !self.subscriptions.iter().any(|s| s.device == device && s.name == name) {
            self.subscriptions.push(Subscription {
                device: device.to_owned(),
                name: name.to_owned(),
                blob_mode: BlobMode::Never,
            });
        }
    }

    pub fn set_blob_mode(&mut self, device: &str, name: &str, mode: BlobMode) {
        for s in &mut self.subscriptions {
            if s.device == device && (s.name == name || s.name.is_empty() || name.is_empty()) {
                s.blob_mode = mode;
            }
        }
    }
}

/// Where a driver's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverKind {
    Local { restarts: u32, restart_enabled: bool },
    Remote { host: String, port: u16 },
}

impl DriverKind {
    /// `remoteServerUid()`.
    pub fn remote_uid(&self) -> Option<String> {
        match self {
            DriverKind::Remote { host, port } => Some(format!("{host}:{port}")),
            DriverKind::Local { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriverInfo {
    pub devices: HashSet<String>,
    pub snoops: Vec<Subscription>,
}

impl DriverInfo {
    pub fn learn_device(&mut self, device: &str) -> bool {
        if device.is_empty() {
            return false;
        }
        self.devices.insert(device.to_owned())
    }

    pub fn serves(&self, device: &str) -> bool {
        device.is_empty() || device == "*" || self.devices.contains(device)
    }

    pub fn snoop_for(&self, device: &str, name: &str) -> Option<&Subscription> {
        self.snoops
            .iter()
            .find(|s| s.device == device && (s.name == name || s.name.is_empty()))
    }

    pub fn add_snoop(&mut self, device: &str, name: &str) {
        if !self.snoops.iter().any(|s| s.device == device && s.name == name) {
            self.snoops.push(Subscription {
                device: device.to_owned(),
                name: name.to_owned(),
                blob_mode: BlobMode::Never,
            });
        }
    }

    pub fn set_snoop_blob_mode(&mut self, device: &str, name: &str, mode: BlobMode) {
        for s in &mut self.snoops {
            if s.device == device && (s.name == name || s.name.is_empty() || name.is_empty()) {
                s.blob_mode = mode;
            }
        }
    }
}

/// What role a peer plays; everything else (queue, transport, id) is
/// shared, per the design notes' "single concrete peer type with a tagged
/// role" recommendation.
pub enum Role {
    Client(ClientInterest),
    Driver { info: DriverInfo, kind: DriverKind, name: String },
}

pub struct Peer {
    pub id: PeerId,
    /// Shared, not `RefCell`-guarded: every `Transport` method takes `&self`,
    /// so a peer's read and write tasks each hold their own clone of this
    /// handle and drive I/O without ever contending on the `Peer`'s own
    /// `RefCell` for the duration of a read/write syscall.
    pub transport: Rc<Transport>,
    pub queue: MsgQueue,
    pub role: Role,
    pub alive: bool,
    /// Set when a client's first message was `getProperties device="*"`:
    /// this connection chains to an upstream server rather than being an
    /// ordinary client.
    pub is_upstream_server: bool,
}

impl Peer {
    pub fn new(id: PeerId, transport: Transport, role: Role) -> Self {
        Peer {
            id,
            transport: Rc::new(transport),
            queue: MsgQueue::new(),
            role,
            alive: true,
            is_upstream_server: false,
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client(_))
    }

    pub fn is_driver(&self) -> bool {
        matches!(self.role, Role::Driver { .. })
    }
}
