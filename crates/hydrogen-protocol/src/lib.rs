//! Wire-format types shared by every part of the router: the XML element
//! tree, the shared-buffer store BLOBs travel through, and the message
//! lifecycle that turns one into chunks ready to write.

pub mod msg;
pub mod serialize;
pub mod shared_buffer;
pub mod xml;

pub use msg::{Msg, MsgError};
pub use serialize::{ContentState, Cursor, MsgChunk, SerializationKind, SerializedMsg};
pub use xml::{Element, ParseContext, ParseError};
