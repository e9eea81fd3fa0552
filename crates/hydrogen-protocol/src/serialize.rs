//! `SerializedMsg`: a lazily-produced, chunked rendering of a [`Msg`] ready
//! to write to one or more peers.
//!
//! This is the one type in the crate that legitimately crosses threads: a
//! production run (base64-encoding an attached BLOB, or decoding one into a
//! fresh shared buffer) happens on a detached worker thread, which appends
//! chunks under `Mutex` and wakes waiters through [`tokio::sync::Notify`].
//! Everything else in this crate — `Msg`, `Element` — is `Rc`-owned and
//! stays on the single event-loop thread.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::warn;

use crate::shared_buffer;
use crate::xml::Element;

/// Which direction a serialization converts BLOBs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationKind {
    /// Attached BLOBs become base64 CDATA; already-inline BLOBs pass
    /// through zero-copy.
    ToInline,
    /// Inline BLOBs are decoded into freshly allocated shared buffers and
    /// marked `attached="true"`.
    ToAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Running,
    Terminated,
    #[allow(dead_code)]
    Canceling,
}

/// One piece of a serialization's output. `fds` is non-empty only for the
/// chunk that must carry ancillary data (offset 0 of a `ToAttached`
/// rendering); every other chunk carries an empty list.
#[derive(Clone)]
pub struct MsgChunk {
    pub data: Bytes,
    pub fds: Vec<RawFd>,
}

/// A write cursor into a [`SerializedMsg`]'s chunk list.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cursor {
    chunk: usize,
    offset: usize,
}

/// What a live serialization still needs from its originating [`Msg`] in
/// order to keep producing or to remain readable by peers.
///
/// This port takes its working clone of the element tree eagerly inside
/// [`SerializedMsg::build`], so by the time any caller can observe a
/// requirement the originating tree is never the one being read; `xml` is
/// kept here (rather than dropped) so `Msg::prune` still has a place to
/// plug in conditional retention should a future producer stop cloning
/// eagerly.
pub struct SerializationRequirement {
    pub xml: bool,
    pub shared_buffers: HashSet<RawFd>,
}

struct Inner {
    status: Status,
    chunks: Vec<MsgChunk>,
    awaiters: HashSet<u64>,
    /// fds this serialization allocated itself (ToAttached, decoded
    /// inline BLOBs) and must close when no longer referenced.
    owned_fds: Vec<OwnedFd>,
    /// fds borrowed from the originating `Msg` that this serialization's
    /// chunks still reference.
    borrowed_fds: HashSet<RawFd>,
}

struct Shared {
    kind: SerializationKind,
    notify: Notify,
    inner: Mutex<Inner>,
}

/// Cheap-to-clone handle to a serialization. All clones share the same
/// underlying chunk list and production thread.
#[derive(Clone)]
pub struct SerializedMsg(Arc<Shared>);

impl SerializedMsg {
    /// `serialize`'s ToInline/ToAttached dispatch. `element` and `fds` are
    /// a snapshot of the originating `Msg` at the moment of the call.
    pub fn build(kind: SerializationKind, element: &Element, fds: &[RawFd]) -> SerializedMsg {
        let blobs: Vec<&Element> = element.find_blob_elements().collect();
        let needs_async = match kind {
            SerializationKind::ToInline => !blobs.is_empty(),
            SerializationKind::ToAttached => blobs
                .iter()
                .any(|b| b.find_attr("attached") != Some("true")),
        };

        // A production run may still be reading these fds on its worker
        // thread well after the caller drops the originating `Msg` (the
        // router dispatches and returns synchronously); duplicate them now,
        // on the calling thread, so production's fds outlive the original.
        let mut duped_owned: Vec<OwnedFd> = Vec::new();
        let mut duped_raw: Vec<RawFd> = Vec::new();
        for &fd in fds {
            match dup_cloexec(fd) {
                Ok(owned) => {
                    duped_raw.push(owned.as_raw_fd());
                    duped_owned.push(owned);
                }
                Err(e) => warn!(error = %e, "failed to duplicate fd for serialization, BLOB will be dropped"),
            }
        }

        let shared = Arc::new(Shared {
            kind,
            notify: Notify::new(),
            inner: Mutex::new(Inner {
                status: if needs_async { Status::Pending } else { Status::Running },
                chunks: Vec::new(),
                awaiters: HashSet::new(),
                owned_fds: duped_owned,
                borrowed_fds: fds.iter().copied().collect(),
            }),
        });

        if needs_async {
            let element = element.clone();
            let worker = Arc::clone(&shared);
            std::thread::spawn(move || run_production(&worker, element, &duped_raw));
        } else {
            run_production(&shared, element.clone(), &duped_raw);
        }

        SerializedMsg(shared)
    }

    pub fn requirement(&self) -> SerializationRequirement {
        let inner = self.0.inner.lock().unwrap();
        SerializationRequirement {
            xml: false,
            shared_buffers: inner.borrowed_fds.clone(),
        }
    }

    pub fn add_awaiter(&self, peer_id: u64) {
        self.0.inner.lock().unwrap().awaiters.insert(peer_id);
    }

    /// Returns `true` if this was the last awaiter and the serialization is
    /// no longer running; the caller should then tell the originating
    /// `Msg` to release its handle.
    pub fn release(&self, peer_id: u64) -> bool {
        let mut inner = self.0.inner.lock().unwrap();
        inner.awaiters.remove(&peer_id);
        inner.awaiters.is_empty() && inner.status != Status::Running
    }

    pub async fn notified(&self) {
        self.0.notify.notified().await;
    }

    /// `requestContent`: true iff the chunk at `cursor.chunk` already
    /// exists, or the serialization has terminated (so no chunk will ever
    /// arrive there). Production was already started in `build`.
    pub fn request_content(&self, cursor: Cursor) -> bool {
        let inner = self.0.inner.lock().unwrap();
        cursor.chunk < inner.chunks.len() || inner.status == Status::Terminated
    }

    /// `getContent`: the bytes remaining in the cursor's current chunk, and
    /// that chunk's fd list if the cursor sits at its start.
    pub fn get_content(&self, cursor: Cursor) -> ContentState {
        let inner = self.0.inner.lock().unwrap();
        let Some(chunk) = inner.chunks.get(cursor.chunk) else {
            return if inner.status == Status::Terminated {
                ContentState::End
            } else {
                ContentState::NotReady
            };
        };
        let data = chunk.data.slice(cursor.offset..);
        let fds = if cursor.offset == 0 { chunk.fds.clone() } else { Vec::new() };
        ContentState::Ready { data, fds }
    }

    /// `advance`: move the cursor forward by `written` bytes, rolling over
    /// to the next chunk (or signalling end-of-stream) as needed.
    pub fn advance(&self, mut cursor: Cursor, written: usize) -> Cursor {
        let inner = self.0.inner.lock().unwrap();
        let Some(chunk) = inner.chunks.get(cursor.chunk) else {
            return cursor;
        };
        cursor.offset += written;
        if cursor.offset >= chunk.data.len() {
            cursor.chunk += 1;
            cursor.offset = 0;
        }
        cursor
    }

    pub fn end_reached(&self, cursor: Cursor) -> bool {
        let inner = self.0.inner.lock().unwrap();
        inner.status == Status::Terminated && cursor.chunk >= inner.chunks.len()
    }
}

fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

pub enum ContentState {
    NotReady,
    End,
    Ready { data: Bytes, fds: Vec<RawFd> },
}

struct Replacement {
    placeholder_index: usize,
    source: BlobSource,
}

enum BlobSource {
    Attached,
    Inline(Bytes),
}

fn run_production(shared: &Arc<Shared>, element: Element, fds: &[RawFd]) {
    {
        let mut inner = shared.inner.lock().unwrap();
        inner.status = Status::Running;
    }

    let chunks = match shared.kind {
        SerializationKind::ToInline => produce_to_inline(&element, fds),
        SerializationKind::ToAttached => produce_to_attached(shared, &element, fds),
    };

    let mut inner = shared.inner.lock().unwrap();
    inner.chunks.extend(chunks);
    inner.status = Status::Terminated;
    drop(inner);
    shared.notify.notify_waiters();
}

/// ToInline production (§4.C). Attached-BLOB children consume `fds`
/// positionally, in document order.
fn produce_to_inline(element: &Element, fds: &[RawFd]) -> Vec<MsgChunk> {
    let mut map: HashMap<usize, Element> = HashMap::new();
    let mut replacements = Vec::new();

    for (index, child) in element.children.iter().enumerate() {
        if child.tag != "oneBLOB" {
            continue;
        }
        let mut placeholder = child.shallow_clone();
        placeholder.remove_attr("attached");
        placeholder.remove_attr("enclen");
        placeholder.pcdata = Bytes::from_static(b"\0");
        let source = if child.find_attr("attached") == Some("true") {
            BlobSource::Attached
        } else {
            BlobSource::Inline(child.pcdata.clone())
        };
        map.insert(child as *const Element as usize, placeholder);
        replacements.push(Replacement { placeholder_index: index, source });
    }

    // `clone_with_replacement` preserves child order and count, so a
    // placeholder lands at the same index it was recorded at above.
    let substituted = element.clone_with_replacement(&map);
    render_inline_chunks(&substituted, &replacements, fds)
}

fn render_inline_chunks(
    substituted: &Element,
    replacements: &[Replacement],
    fds: &[RawFd],
) -> Vec<MsgChunk> {
    let mut attached_fd_iter = fds.iter().copied();

    let mut offsets: Vec<(usize, &Replacement)> = replacements
        .iter()
        .filter_map(|r| {
            let placeholder = &substituted.children[r.placeholder_index];
            substituted
                .render_cdata_offset(placeholder)
                .map(|off| (off, r))
        })
        .collect();
    offsets.sort_by_key(|(off, _)| *off);

    let mut buf = Vec::new();
    substituted.render(&mut buf);
    let full = Bytes::from(buf);

    let mut chunks = Vec::new();
    let mut cursor = 0usize;
    for (offset, replacement) in &offsets {
        chunks.push(MsgChunk { data: full.slice(cursor..*offset), fds: Vec::new() });

        match &replacement.source {
            BlobSource::Inline(bytes) => {
                chunks.push(MsgChunk { data: bytes.clone(), fds: Vec::new() });
            }
            BlobSource::Attached => {
                let Some(fd) = attached_fd_iter.next() else {
                    warn!("ToInline production ran out of attached fds for a marked BLOB");
                    cursor = offset + 1;
                    continue;
                };
                match shared_buffer::attach(fd) {
                    Ok(mapped) => {
                        for slice in base64_chunks(mapped.as_slice()) {
                            chunks.push(MsgChunk { data: slice, fds: Vec::new() });
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to map attached shared buffer for ToInline production"),
                }
            }
        }
        cursor = offset + 1; // skip the one-byte placeholder sentinel
    }
    chunks.push(MsgChunk { data: full.slice(cursor..), fds: Vec::new() });
    chunks
}

/// Base64-encode `data` in slices whose *decoded* length is a multiple of 3
/// bytes and at most 48 KiB, so each slice stands alone as valid base64.
fn base64_chunks(data: &[u8]) -> Vec<Bytes> {
    const MAX_DECODED: usize = 48 * 1024;
    const STEP: usize = (MAX_DECODED / 3) * 3;
    let mut out = Vec::new();
    if data.is_empty() {
        return out;
    }
    let mut start = 0;
    while start < data.len() {
        let end = (start + STEP).min(data.len());
        out.push(Bytes::from(BASE64.encode(&data[start..end]).into_bytes()));
        start = end;
    }
    out
}

/// ToAttached production (§4.C): inline BLOBs are decoded into shared
/// buffers; already-attached ones pass through as-is.
fn produce_to_attached(shared: &Arc<Shared>, element: &Element, fds: &[RawFd]) -> Vec<MsgChunk> {
    let mut map: HashMap<usize, Element> = HashMap::new();
    let mut ordered_fds: Vec<RawFd> = Vec::new();
    let mut attached_cursor = fds.iter().copied();
    let mut newly_owned = Vec::new();

    for child in &element.children {
        if child.tag != "oneBLOB" {
            continue;
        }
        if child.find_attr("attached") == Some("true") {
            if let Some(fd) = attached_cursor.next() {
                ordered_fds.push(fd);
            }
            continue;
        }

        let size: usize = child.find_attr("size").and_then(|s| s.parse().ok()).unwrap_or(0);
        let decoded = BASE64.decode(child.pcdata()).unwrap_or_default();
        match shared_buffer::alloc(size) {
            Ok((fd, mut mapped)) => {
                let n = decoded.len().min(size);
                mapped.as_mut_slice()[..n].copy_from_slice(&decoded[..n]);
                let _sealed = mapped.seal();
                let raw = fd.as_raw_fd();
                ordered_fds.push(raw);
                newly_owned.push(fd);

                let mut placeholder = child.shallow_clone();
                placeholder.set_attr("attached", "true");
                map.insert(child as *const Element as usize, placeholder);
            }
            Err(e) => {
                warn!(error = %e, "failed to allocate shared buffer for ToAttached production");
            }
        }
    }

    {
        let mut inner = shared.inner.lock().unwrap();
        inner.owned_fds.extend(newly_owned);
    }

    let substituted = element.clone_with_replacement(&map);
    let mut buf = Vec::new();
    substituted.render(&mut buf);
    vec![MsgChunk { data: Bytes::from(buf), fds: ordered_fds }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_inline_with_no_blobs_is_a_single_chunk() {
        let mut root = Element::new("getProperties");
        root.set_attr("version", "1.7");
        let serialized = SerializedMsg::build(SerializationKind::ToInline, &root, &[]);
        assert!(serialized.end_reached(Cursor::default()) || {
            let c = Cursor::default();
            serialized.request_content(c) && {
                matches!(serialized.get_content(c), ContentState::Ready { .. })
            }
        });
    }

    #[test]
    fn to_inline_passes_through_already_inline_blob_zero_copy() {
        let mut root = Element::new("setBLOBVector");
        let mut blob = Element::new("oneBLOB");
        blob.set_attr("size", "3");
        blob.pcdata = Bytes::from_static(b"YWJj");
        root.children.push(blob);

        let serialized = SerializedMsg::build(SerializationKind::ToInline, &root, &[]);
        let mut cursor = Cursor::default();
        let mut collected = Vec::new();
        loop {
            if !serialized.request_content(cursor) {
                break;
            }
            match serialized.get_content(cursor) {
                ContentState::Ready { data, .. } => {
                    if data.is_empty() && serialized.end_reached(cursor) {
                        break;
                    }
                    collected.extend_from_slice(&data);
                    cursor = serialized.advance(cursor, data.len());
                }
                ContentState::End => break,
                ContentState::NotReady => break,
            }
        }
        let rendered = String::from_utf8(collected).unwrap();
        assert!(rendered.contains("YWJj"));
    }

    #[test]
    fn requirement_reports_borrowed_fds() {
        let root = Element::new("getProperties");
        let serialized = SerializedMsg::build(SerializationKind::ToInline, &root, &[7, 9]);
        // Production for a no-BLOB message ignores the fd list entirely,
        // but `build` still records whatever was passed in as borrowed.
        let req = serialized.requirement();
        assert!(req.shared_buffers.contains(&7));
        assert!(req.shared_buffers.contains(&9));
    }
}
