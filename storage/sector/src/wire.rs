//! Binary layout of a published sector.
//!
//! A sector on the wire is the 2-byte magic `"v1"` followed by one
//! length-delimited protobuf record. The field numbers below are the wire
//! contract; builders and miners on different machines must agree on them:
//!
//! ```text
//! Record  { TagList tags = 1; bytes segments = 2; bytes root = 3;
//!           uint32 padding = 4; Forest forest = 5; string pp = 6; }
//! TagList { repeated string tags = 1; }
//! Forest  { repeated Entry trees = 1; }
//! Entry   { string cid = 1; Kind typ = 2; uint32 offset = 3;
//!           uint32 len = 4; repeated Link children = 5; }
//! Link    { Entry entry = 1; }
//! enum Kind { DIR = 0; FILE = 1; }
//! ```

use quick_protobuf::{
    sizeofs::{sizeof_len, sizeof_varint},
    BytesReader, MessageRead, MessageWrite, Result, Writer, WriterBackend,
};

use crate::forest::{Entry, EntryKind, Forest};

impl From<i32> for EntryKind {
    fn from(value: i32) -> Self {
        match value {
            1 => EntryKind::File,
            _ => EntryKind::Dir,
        }
    }
}

impl From<EntryKind> for i32 {
    fn from(value: EntryKind) -> Self {
        match value {
            EntryKind::Dir => 0,
            EntryKind::File => 1,
        }
    }
}

/// Wrapper giving each child entry its `Link` envelope on the wire.
struct LinkRef<'a>(&'a Entry);

impl MessageWrite for LinkRef<'_> {
    fn get_size(&self) -> usize {
        1 + sizeof_len(self.0.get_size())
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(10, |w| w.write_message(self.0))
    }
}

#[derive(Debug, Default)]
struct Link {
    entry: Option<Entry>,
}

impl<'a> MessageRead<'a> for Link {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.entry = Some(r.read_message::<Entry>(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Entry {
    fn get_size(&self) -> usize {
        let mut size = 0;
        if !self.cid.is_empty() {
            size += 1 + sizeof_len(self.cid.len());
        }
        if self.kind != EntryKind::Dir {
            size += 1 + sizeof_varint(i32::from(self.kind) as u64);
        }
        if self.offset != 0 {
            size += 1 + sizeof_varint(self.offset as u64);
        }
        if self.len != 0 {
            size += 1 + sizeof_varint(self.len as u64);
        }
        for child in &self.children {
            size += 1 + sizeof_len(LinkRef(child).get_size());
        }
        size
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        if !self.cid.is_empty() {
            w.write_with_tag(10, |w| w.write_string(&self.cid))?;
        }
        if self.kind != EntryKind::Dir {
            w.write_with_tag(16, |w| w.write_enum(i32::from(self.kind)))?;
        }
        if self.offset != 0 {
            w.write_with_tag(24, |w| w.write_uint32(self.offset))?;
        }
        if self.len != 0 {
            w.write_with_tag(32, |w| w.write_uint32(self.len))?;
        }
        for child in &self.children {
            w.write_with_tag(42, |w| w.write_message(&LinkRef(child)))?;
        }
        Ok(())
    }
}

impl<'a> MessageRead<'a> for Entry {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.cid = r.read_string(bytes)?.to_owned(),
                Ok(16) => msg.kind = r.read_enum(bytes)?,
                Ok(24) => msg.offset = r.read_uint32(bytes)?,
                Ok(32) => msg.len = r.read_uint32(bytes)?,
                Ok(42) => {
                    let link = r.read_message::<Link>(bytes)?;
                    msg.children.push(link.entry.unwrap_or_default());
                }
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

impl MessageWrite for Forest {
    fn get_size(&self) -> usize {
        self.trees
            .iter()
            .map(|root| 1 + sizeof_len(root.get_size()))
            .sum()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        for root in &self.trees {
            w.write_with_tag(10, |w| w.write_message(root))?;
        }
        Ok(())
    }
}

impl<'a> MessageRead<'a> for Forest {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.trees.push(r.read_message::<Entry>(bytes)?),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

struct TagListRef<'a>(&'a [String]);

impl MessageWrite for TagListRef<'_> {
    fn get_size(&self) -> usize {
        self.0.iter().map(|tag| 1 + sizeof_len(tag.len())).sum()
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        for tag in self.0 {
            w.write_with_tag(10, |w| w.write_string(tag))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct TagList {
    tags: Vec<String>,
}

impl<'a> MessageRead<'a> for TagList {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.tags.push(r.read_string(bytes)?.to_owned()),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}

/// Borrowing write-side record; avoids copying the segment buffer when
/// serializing.
pub(crate) struct RecordRef<'a> {
    pub tags: &'a [String],
    pub segments: &'a [u8],
    pub root: &'a [u8],
    pub padding: u32,
    pub forest: &'a Forest,
    pub pp: &'a str,
}

impl MessageWrite for RecordRef<'_> {
    fn get_size(&self) -> usize {
        let mut size = 0;
        size += 1 + sizeof_len(TagListRef(self.tags).get_size());
        if !self.segments.is_empty() {
            size += 1 + sizeof_len(self.segments.len());
        }
        if !self.root.is_empty() {
            size += 1 + sizeof_len(self.root.len());
        }
        if self.padding != 0 {
            size += 1 + sizeof_varint(self.padding as u64);
        }
        size += 1 + sizeof_len(self.forest.get_size());
        if !self.pp.is_empty() {
            size += 1 + sizeof_len(self.pp.len());
        }
        size
    }

    fn write_message<W: WriterBackend>(&self, w: &mut Writer<W>) -> Result<()> {
        w.write_with_tag(10, |w| w.write_message(&TagListRef(self.tags)))?;
        if !self.segments.is_empty() {
            w.write_with_tag(18, |w| w.write_bytes(self.segments))?;
        }
        if !self.root.is_empty() {
            w.write_with_tag(26, |w| w.write_bytes(self.root))?;
        }
        if self.padding != 0 {
            w.write_with_tag(32, |w| w.write_uint32(self.padding))?;
        }
        w.write_with_tag(42, |w| w.write_message(self.forest))?;
        if !self.pp.is_empty() {
            w.write_with_tag(50, |w| w.write_string(self.pp))?;
        }
        Ok(())
    }
}

/// Owning read-side record.
#[derive(Debug, Default)]
pub(crate) struct Record {
    pub tags: Vec<String>,
    pub segments: Vec<u8>,
    pub root: Vec<u8>,
    pub padding: u32,
    pub forest: Forest,
    pub pp: String,
}

impl<'a> MessageRead<'a> for Record {
    fn from_reader(r: &mut BytesReader, bytes: &'a [u8]) -> Result<Self> {
        let mut msg = Self::default();
        while !r.is_eof() {
            match r.next_tag(bytes) {
                Ok(10) => msg.tags = r.read_message::<TagList>(bytes)?.tags,
                Ok(18) => msg.segments = r.read_bytes(bytes)?.to_owned(),
                Ok(26) => msg.root = r.read_bytes(bytes)?.to_owned(),
                Ok(32) => msg.padding = r.read_uint32(bytes)?,
                Ok(42) => msg.forest = r.read_message::<Forest>(bytes)?,
                Ok(50) => msg.pp = r.read_string(bytes)?.to_owned(),
                Ok(t) => {
                    r.read_unknown(bytes, t)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(msg)
    }
}
