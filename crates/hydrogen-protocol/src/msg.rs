//! `Msg`: an inbound or outbound protocol message and the fds it carries.
//!
//! A `Msg` owns an [`Element`] tree and any attached-BLOB file descriptors
//! until every serialization built from it has let them go (`prune`). It is
//! single-thread-owned — cloning a `Msg` clones the handle, not the data —
//! matching the rest of the router's state.

use std::cell::RefCell;
use std::collections::HashSet;
use std::os::fd::{OwnedFd, RawFd};
use std::rc::Rc;

use crate::serialize::{SerializationKind, SerializationRequirement, SerializedMsg};
use crate::xml::Element;

#[derive(Debug, thiserror::Error)]
pub enum MsgError {
    #[error("oneBLOB element missing or unparsable size attribute")]
    BadBlobSize,
    #[error("oneBLOB marked attached=\"true\" but no fd was received for it")]
    MissingAttachedFd,
}

struct MsgInner {
    origin: String,
    element: Option<Element>,
    fds: Vec<OwnedFd>,
    has_inline_blobs: bool,
    has_shared_buffer_blobs: bool,
    queue_size: usize,
    to_inline: Option<SerializedMsg>,
    to_attached: Option<SerializedMsg>,
}

/// Reference-counted handle to a message. Cheap to clone; all clones share
/// the same underlying element tree and fd list.
#[derive(Clone)]
pub struct Msg(Rc<RefCell<MsgInner>>);

impl Msg {
    /// `Msg::fromXml`. `incoming_fds` is drained front-to-back as attached
    /// BLOBs are matched, matching arrival order on the ancillary channel.
    pub fn from_xml(
        origin: impl Into<String>,
        element: Element,
        incoming_fds: &mut Vec<OwnedFd>,
    ) -> Result<Msg, MsgError> {
        let mut fds = Vec::new();
        let mut has_inline_blobs = false;
        let mut has_shared_buffer_blobs = false;
        let mut attached_bytes = 0usize;

        for blob in element.find_blob_elements() {
            let size: usize = blob
                .find_attr("size")
                .and_then(|s| s.parse().ok())
                .ok_or(MsgError::BadBlobSize)?;
            if blob.find_attr("attached") == Some("true") {
                if incoming_fds.is_empty() {
                    return Err(MsgError::MissingAttachedFd);
                }
                fds.push(incoming_fds.remove(0));
                attached_bytes += size;
                has_shared_buffer_blobs = true;
            } else {
                has_inline_blobs = true;
            }
        }

        let queue_size = element.print_len() + attached_bytes;

        Ok(Msg(Rc::new(RefCell::new(MsgInner {
            origin: origin.into(),
            element: Some(element),
            fds,
            has_inline_blobs,
            has_shared_buffer_blobs,
            queue_size,
            to_inline: None,
            to_attached: None,
        }))))
    }

    /// A message constructed internally by the router (no wire origin, no
    /// attached fds) — used for synthesized replies such as `delProperty`.
    pub fn from_element(element: Element) -> Msg {
        let queue_size = element.print_len();
        Msg(Rc::new(RefCell::new(MsgInner {
            origin: "internal".to_owned(),
            element: Some(element),
            fds: Vec::new(),
            has_inline_blobs: false,
            has_shared_buffer_blobs: false,
            queue_size,
            to_inline: None,
            to_attached: None,
        })))
    }

    pub fn origin(&self) -> String {
        self.0.borrow().origin.clone()
    }

    pub fn queue_size(&self) -> usize {
        self.0.borrow().queue_size
    }

    pub fn has_blobs(&self) -> bool {
        let inner = self.0.borrow();
        inner.has_inline_blobs || inner.has_shared_buffer_blobs
    }

    /// `serialize(destination)`.
    pub fn serialize(&self, destination_accepts_shared_buffers: bool) -> SerializedMsg {
        let mut inner = self.0.borrow_mut();
        if !inner.has_inline_blobs && !inner.has_shared_buffer_blobs {
            if let Some(existing) = &inner.to_inline {
                return existing.clone();
            }
            let element = inner.element.clone().unwrap_or_default();
            let built = SerializedMsg::build(SerializationKind::ToInline, &element, &[]);
            inner.to_inline = Some(built.clone());
            return built;
        }
        if destination_accepts_shared_buffers {
            if let Some(existing) = &inner.to_attached {
                return existing.clone();
            }
            let element = inner.element.clone().unwrap_or_default();
            let fds: Vec<RawFd> = inner.fds.iter().map(|f| std::os::fd::AsRawFd::as_raw_fd(f)).collect();
            let built = SerializedMsg::build(SerializationKind::ToAttached, &element, &fds);
            inner.to_attached = Some(built.clone());
            built
        } else {
            if let Some(existing) = &inner.to_inline {
                return existing.clone();
            }
            let element = inner.element.clone().unwrap_or_default();
            let fds: Vec<RawFd> = inner.fds.iter().map(|f| std::os::fd::AsRawFd::as_raw_fd(f)).collect();
            let built = SerializedMsg::build(SerializationKind::ToInline, &element, &fds);
            inner.to_inline = Some(built.clone());
            built
        }
    }

    /// `releaseSerialization`: drop our reference to a now-unused
    /// serialization and prune.
    pub fn release_serialization(&self, kind: SerializationKind) {
        {
            let mut inner = self.0.borrow_mut();
            match kind {
                SerializationKind::ToInline => inner.to_inline = None,
                SerializationKind::ToAttached => inner.to_attached = None,
            }
        }
        self.prune();
    }

    /// `queuingDone`: the message has left every peer's outgoing queue head
    /// position it will ever occupy as "about to be (re)serialized"; prune
    /// can now reclaim anything no live serialization still needs.
    pub fn queuing_done(&self) {
        self.prune();
    }

    /// Free the element tree if no live serialization needs it, and close
    /// any fd no live serialization's requirement set still names.
    pub fn prune(&self) {
        let mut inner = self.0.borrow_mut();

        let mut requirements: Vec<SerializationRequirement> = Vec::new();
        if let Some(s) = &inner.to_inline {
            requirements.push(s.requirement());
        }
        if let Some(s) = &inner.to_attached {
            requirements.push(s.requirement());
        }

        let xml_needed = requirements.iter().any(|r| r.xml);
        if !xml_needed {
            inner.element = None;
        }

        let mut needed: HashSet<RawFd> = HashSet::new();
        for r in &requirements {
            needed.extend(r.shared_buffers.iter().copied());
        }
        inner.fds.retain(|fd| needed.contains(&std::os::fd::AsRawFd::as_raw_fd(fd)));

        // If every serialization is gone, nothing left to do: the `Msg` is
        // reclaimed by `Rc` refcounting once the last queue entry drops it.
    }
}
