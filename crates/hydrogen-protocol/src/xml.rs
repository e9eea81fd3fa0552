//! Element trees for the wire protocol, and the streaming parser that turns
//! incoming bytes into them.
//!
//! `quick-xml` is the underlying tokenizer; everything above the event
//! stream (tree building, attribute helpers, clone-with-substitution) lives
//! here so the rest of the crate never touches a `quick_xml::Event`
//! directly.

use std::collections::HashMap;

use bytes::Bytes;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;

/// One XML element: a tag, its attributes (order preserved, as seen on the
/// wire), child elements, and any pcdata (text) content.
///
/// A BLOB-carrying `oneBLOB` leaf has `pcdata` set to its base64 payload (or
/// empty, if `attached="true"`) and no children. A `defTextVector` has
/// children and empty `pcdata`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub pcdata: Bytes,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: Vec::new(),
            children: Vec::new(),
            pcdata: Bytes::new(),
        }
    }

    /// `findAttr`.
    pub fn find_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `setAttr`: replaces an existing attribute or appends a new one.
    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            entry.1 = value;
        } else {
            self.attrs.push((name.to_owned(), value));
        }
    }

    /// `removeAttr`.
    pub fn remove_attr(&mut self, name: &str) {
        self.attrs.retain(|(k, _)| k != name);
    }

    /// `pcdata`.
    pub fn pcdata(&self) -> &[u8] {
        &self.pcdata
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.tag = tag.into();
    }

    /// `shallowClone`: tag and attributes only, no children or pcdata.
    pub fn shallow_clone(&self) -> Element {
        Element {
            tag: self.tag.clone(),
            attrs: self.attrs.clone(),
            children: Vec::new(),
            pcdata: Bytes::new(),
        }
    }

    /// Enumerate all direct children tagged `oneBLOB` (`findBlobElements`).
    pub fn find_blob_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter(|c| c.tag == "oneBLOB")
    }

    /// Render this element (and its subtree) to `buf`, returning the number
    /// of bytes written. No XML prolog is ever emitted.
    pub fn render(&self, buf: &mut Vec<u8>) -> usize {
        let start = buf.len();
        render_into(self, buf);
        buf.len() - start
    }

    /// `print`: rendered length without keeping the buffer.
    pub fn print_len(&self) -> usize {
        let mut buf = Vec::new();
        self.render(&mut buf)
    }

    /// Deep-clone this subtree, substituting any node present (by identity)
    /// in `map` for its precomputed replacement. `map` is keyed by the
    /// address of the original `Element` as observed during this call; it
    /// is only valid while `self`'s tree is not mutated.
    pub fn clone_with_replacement(&self, map: &HashMap<usize, Element>) -> Element {
        let key = self as *const Element as usize;
        if let Some(replacement) = map.get(&key) {
            return replacement.clone();
        }
        Element {
            tag: self.tag.clone(),
            attrs: self.attrs.clone(),
            pcdata: self.pcdata.clone(),
            children: self
                .children
                .iter()
                .map(|c| c.clone_with_replacement(map))
                .collect(),
        }
    }

    /// Compute the byte offset at which `child`'s rendered pcdata begins
    /// within a render of `self`. `child` must be a direct or transitive
    /// child of `self` (identity comparison via pointer address).
    pub fn render_cdata_offset(&self, child: &Element) -> Option<usize> {
        let mut buf = Vec::new();
        let mut found = None;
        render_with_probe(self, child as *const Element as usize, &mut buf, &mut found);
        found
    }
}

fn render_into(elem: &Element, buf: &mut Vec<u8>) {
    buf.push(b'<');
    buf.extend_from_slice(elem.tag.as_bytes());
    for (k, v) in &elem.attrs {
        buf.push(b' ');
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b"=\"");
        buf.extend_from_slice(escape_attr(v).as_bytes());
        buf.push(b'"');
    }
    if elem.children.is_empty() && elem.pcdata.is_empty() {
        buf.extend_from_slice(b"/>");
        return;
    }
    buf.push(b'>');
    if !elem.pcdata.is_empty() {
        buf.extend_from_slice(&elem.pcdata);
    }
    for child in &elem.children {
        render_into(child, buf);
    }
    buf.extend_from_slice(b"</");
    buf.extend_from_slice(elem.tag.as_bytes());
    buf.push(b'>');
}

/// Same traversal as `render_into`, but records the byte offset at which the
/// node whose address equals `target` starts emitting its pcdata.
fn render_with_probe(
    elem: &Element,
    target: usize,
    buf: &mut Vec<u8>,
    found: &mut Option<usize>,
) {
    buf.push(b'<');
    buf.extend_from_slice(elem.tag.as_bytes());
    for (k, v) in &elem.attrs {
        buf.push(b' ');
        buf.extend_from_slice(k.as_bytes());
        buf.extend_from_slice(b"=\"");
        buf.extend_from_slice(escape_attr(v).as_bytes());
        buf.push(b'"');
    }
    if elem.children.is_empty() && elem.pcdata.is_empty() {
        buf.extend_from_slice(b"/>");
        return;
    }
    buf.push(b'>');
    if elem as *const Element as usize == target {
        *found = Some(buf.len());
    }
    if !elem.pcdata.is_empty() {
        buf.extend_from_slice(&elem.pcdata);
    }
    for child in &elem.children {
        render_with_probe(child, target, buf, found);
    }
    buf.extend_from_slice(b"</");
    buf.extend_from_slice(elem.tag.as_bytes());
    buf.push(b'>');
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("unexpected end tag </{found}>, expected </{expected}>")]
    Mismatch { expected: String, found: String },
    #[error("unexpected end of element stack")]
    EmptyStack,
}

/// Incremental parse state across calls to [`parse_stream`]. Bytes that do
/// not yet complete a top-level element are retained here.
#[derive(Default)]
pub struct ParseContext {
    pending: Vec<u8>,
}

impl ParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Feed `bytes` into the streaming parser and return every complete
/// top-level element produced. Partial trailing content is retained in
/// `ctx` for the next call.
pub fn parse_stream(ctx: &mut ParseContext, bytes: &[u8]) -> Result<Vec<Element>, ParseError> {
    ctx.pending.extend_from_slice(bytes);

    let mut reader = Reader::from_reader(ctx.pending.as_slice());
    reader.config_mut().trim_text(false);

    let mut completed = Vec::new();
    // Each stack frame pairs the element under construction with a mutable
    // pcdata accumulator; `Bytes` itself is immutable, so text/CDATA events
    // collect here and are frozen onto the element only once it closes.
    let mut stack: Vec<(Element, Vec<u8>)> = Vec::new();
    let mut scratch = Vec::new();
    let mut last_consumed = 0usize;

    loop {
        scratch.clear();
        let event = match reader.read_event_into(&mut scratch) {
            Ok(Event::Eof) => break,
            Ok(ev) => ev,
            Err(quick_xml::Error::Io(_)) => break,
            Err(e) => return Err(e.into()),
        };
        match event {
            Event::Start(start) => {
                stack.push((element_from_start(&start)?, Vec::new()));
            }
            Event::Empty(start) => {
                let elem = element_from_start(&start)?;
                push_child_or_complete(&mut stack, &mut completed, elem, &mut last_consumed, &reader);
            }
            Event::End(end) => {
                let name = tag_name(end.name().as_ref());
                let (mut finished, pcdata) = stack.pop().ok_or(ParseError::EmptyStack)?;
                if finished.tag != name {
                    return Err(ParseError::Mismatch {
                        expected: finished.tag,
                        found: name,
                    });
                }
                if !pcdata.is_empty() {
                    finished.pcdata = Bytes::from(pcdata);
                }
                push_child_or_complete(&mut stack, &mut completed, finished, &mut last_consumed, &reader);
            }
            Event::Text(text) => {
                if let Some((_, buf)) = stack.last_mut() {
                    buf.extend_from_slice(&decode_text(&text));
                }
            }
            Event::CData(cdata) => {
                if let Some((_, buf)) = stack.last_mut() {
                    buf.extend_from_slice(cdata.as_ref());
                }
            }
            Event::Comment(_) | Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }

    // Keep only the bytes after the last fully-consumed top-level element.
    ctx.pending.drain(..last_consumed);
    Ok(completed)
}

fn push_child_or_complete(
    stack: &mut Vec<(Element, Vec<u8>)>,
    completed: &mut Vec<Element>,
    elem: Element,
    last_consumed: &mut usize,
    reader: &Reader<&[u8]>,
) {
    if let Some((parent, _)) = stack.last_mut() {
        parent.children.push(elem);
    } else {
        completed.push(elem);
        *last_consumed = reader.buffer_position() as usize;
    }
}

fn element_from_start(start: &BytesStart) -> Result<Element, ParseError> {
    let mut elem = Element::new(tag_name(start.name().as_ref()));
    for attr in start.attributes().flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .decode_and_unescape_value(&quick_xml::encoding::Decoder::utf8())
            .map(|v| v.into_owned())
            .unwrap_or_default();
        elem.attrs.push((key, value));
    }
    Ok(elem)
}

fn tag_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn decode_text(text: &BytesText) -> Vec<u8> {
    text.decode()
        .map(|s| s.into_owned().into_bytes())
        .unwrap_or_else(|_| text.as_ref().to_vec())
}
