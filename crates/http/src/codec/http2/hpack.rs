//! HPACK header compression (RFC 7541)
//!
//! The [`Encoder`] and [`Decoder`] each keep one dynamic table, sized by the SETTINGS of
//! the side that decodes. Strings are Huffman coded whenever that is shorter. Fields
//! marked sensitive are sent as never-indexed literals.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use super::error::Http2Error;
use super::huffman;
use crate::ensure;

/// One decoded or to-be-encoded field. Names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    /// Never enters a dynamic table on any hop.
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into(), sensitive: false }
    }

    #[must_use]
    pub fn sensitive(mut self, sensitive: bool) -> Self {
        self.sensitive = sensitive;
        self
    }

    /// The accounted size of the field (RFC 7541 section 4.1).
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

static STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Where a field was found: `Full` matches name and value, `Name` only the name.
enum Match {
    Full(usize),
    Name(usize),
}

/// Entries newest first; HPACK index 62 is the front.
#[derive(Debug)]
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    max_size: usize,
}

impl DynamicTable {
    fn new(max_size: usize) -> Self {
        Self { entries: VecDeque::new(), size: 0, max_size }
    }

    fn get(&self, index: usize) -> Option<&HeaderField> {
        self.entries.get(index)
    }

    fn insert(&mut self, field: HeaderField) {
        let size = field.size();
        if size > self.max_size {
            // an entry larger than the table empties it
            self.entries.clear();
            self.size = 0;
            return;
        }
        self.evict_to(self.max_size - size);
        self.size += size;
        self.entries.push_front(field);
    }

    fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict_to(max_size);
    }

    fn evict_to(&mut self, limit: usize) {
        while self.size > limit {
            let Some(evicted) = self.entries.pop_back() else { break };
            self.size -= evicted.size();
        }
    }

    fn find(&self, field: &HeaderField) -> Option<Match> {
        let mut by_name = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == field.name {
                if entry.value == field.value {
                    return Some(Match::Full(i + STATIC_TABLE.len() + 1));
                }
                by_name.get_or_insert(i + STATIC_TABLE.len() + 1);
            }
        }
        by_name.map(Match::Name)
    }
}

fn find_static(field: &HeaderField) -> Option<Match> {
    let mut by_name = None;
    for (i, (name, value)) in STATIC_TABLE.iter().enumerate() {
        if name.as_bytes() == field.name {
            if value.as_bytes() == field.value {
                return Some(Match::Full(i + 1));
            }
            by_name.get_or_insert(i + 1);
        }
    }
    by_name.map(Match::Name)
}

pub(crate) fn encode_integer(value: usize, prefix_bits: u8, pattern: u8, dst: &mut BytesMut) {
    let max = (1usize << prefix_bits) - 1;
    if value < max {
        dst.put_u8(pattern | value as u8);
        return;
    }
    dst.put_u8(pattern | max as u8);
    let mut rest = value - max;
    while rest >= 0x80 {
        dst.put_u8(0x80 | (rest & 0x7f) as u8);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

/// Returns the value and the bytes consumed.
pub(crate) fn decode_integer(src: &[u8], prefix_bits: u8) -> Result<(usize, usize), Http2Error> {
    let Some(&first) = src.first() else {
        return Err(Http2Error::compression("truncated integer"));
    };
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok((value, 1));
    }

    let mut shift = 0u32;
    for (i, &byte) in src[1..].iter().enumerate() {
        ensure!(shift <= 28, Http2Error::compression("integer overflow"));
        value += usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 2));
        }
        shift += 7;
    }
    Err(Http2Error::compression("truncated integer"))
}

fn encode_string(src: &[u8], dst: &mut BytesMut) {
    let huffman_len = huffman::encoded_len(src);
    if huffman_len < src.len() {
        encode_integer(huffman_len, 7, 0x80, dst);
        huffman::encode(src, dst);
    } else {
        encode_integer(src.len(), 7, 0, dst);
        dst.put_slice(src);
    }
}

fn decode_string(src: &[u8]) -> Result<(Bytes, usize), Http2Error> {
    let huffman_coded = src.first().is_some_and(|b| b & 0x80 != 0);
    let (len, consumed) = decode_integer(src, 7)?;
    let end = consumed.checked_add(len).filter(|end| *end <= src.len());
    let Some(end) = end else {
        return Err(Http2Error::compression("truncated string literal"));
    };

    let raw = &src[consumed..end];
    let value = if huffman_coded { huffman::decode(raw)?.freeze() } else { Bytes::copy_from_slice(raw) };
    Ok((value, end))
}

#[derive(Debug)]
pub struct Encoder {
    table: DynamicTable,
    /// The smallest size set since the last block, signalled before the final one.
    pending_min_size: Option<usize>,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Encoder {
    pub fn new(max_table_size: usize) -> Self {
        Self { table: DynamicTable::new(max_table_size), pending_min_size: None }
    }

    /// Applies a new SETTINGS_HEADER_TABLE_SIZE from the peer; the change is signalled
    /// at the start of the next header block.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size == self.table.max_size && self.pending_min_size.is_none() {
            return;
        }
        self.pending_min_size = Some(self.pending_min_size.map_or(size, |min| min.min(size)));
        self.table.set_max_size(size);
    }

    pub fn encode<'a>(&mut self, fields: impl IntoIterator<Item = &'a HeaderField>, dst: &mut BytesMut) {
        if let Some(min) = self.pending_min_size.take() {
            if min < self.table.max_size {
                encode_integer(min, 5, 0x20, dst);
            }
            encode_integer(self.table.max_size, 5, 0x20, dst);
        }
        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let found = match find_static(field) {
            Some(Match::Full(index)) => Some(Match::Full(index)),
            by_name => match self.table.find(field) {
                Some(Match::Full(index)) => Some(Match::Full(index)),
                dynamic => by_name.or(dynamic),
            },
        };

        if field.sensitive {
            let name_index = match found {
                Some(Match::Full(index) | Match::Name(index)) => index,
                None => 0,
            };
            encode_integer(name_index, 4, 0x10, dst);
            if name_index == 0 {
                encode_string(&field.name, dst);
            }
            encode_string(&field.value, dst);
            return;
        }

        match found {
            Some(Match::Full(index)) => encode_integer(index, 7, 0x80, dst),
            Some(Match::Name(index)) => {
                encode_integer(index, 6, 0x40, dst);
                encode_string(&field.value, dst);
                self.table.insert(field.clone());
            }
            None => {
                dst.put_u8(0x40);
                encode_string(&field.name, dst);
                encode_string(&field.value, dst);
                self.table.insert(field.clone());
            }
        }
    }
}

#[derive(Debug)]
pub struct Decoder {
    table: DynamicTable,
    /// The bound we advertised; size updates above it are errors.
    max_table_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl Decoder {
    pub fn new(max_table_size: usize) -> Self {
        Self { table: DynamicTable::new(max_table_size), max_table_size }
    }

    /// Decodes a complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, Http2Error> {
        let mut fields = Vec::new();
        let mut pos = 0;

        while pos < block.len() {
            let first = block[pos];
            let src = &block[pos..];

            if first & 0x80 != 0 {
                let (index, consumed) = decode_integer(src, 7)?;
                fields.push(self.field_at(index)?);
                pos += consumed;
            } else if first & 0x40 != 0 {
                let (field, consumed) = self.decode_literal(src, 6)?;
                self.table.insert(field.clone());
                fields.push(field);
                pos += consumed;
            } else if first & 0x20 != 0 {
                ensure!(fields.is_empty(), Http2Error::compression("table size update after a field"));
                let (size, consumed) = decode_integer(src, 5)?;
                ensure!(size <= self.max_table_size, Http2Error::compression("table size update above the limit"));
                self.table.set_max_size(size);
                pos += consumed;
            } else {
                let never_indexed = first & 0x10 != 0;
                let (field, consumed) = self.decode_literal(src, 4)?;
                fields.push(field.sensitive(never_indexed));
                pos += consumed;
            }
        }
        Ok(fields)
    }

    fn decode_literal(&self, src: &[u8], prefix_bits: u8) -> Result<(HeaderField, usize), Http2Error> {
        let (name_index, mut pos) = decode_integer(src, prefix_bits)?;
        let name = if name_index == 0 {
            let (name, consumed) = decode_string(&src[pos..])?;
            pos += consumed;
            name
        } else {
            self.field_at(name_index)?.name
        };
        let (value, consumed) = decode_string(&src[pos..])?;
        Ok((HeaderField::new(name, value), pos + consumed))
    }

    fn field_at(&self, index: usize) -> Result<HeaderField, Http2Error> {
        match index {
            0 => Err(Http2Error::compression("index 0")),
            1..=61 => {
                let (name, value) = STATIC_TABLE[index - 1];
                Ok(HeaderField::new(Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes())))
            }
            _ => self
                .table
                .get(index - STATIC_TABLE.len() - 1)
                .cloned()
                .ok_or_else(|| Http2Error::compression("index beyond the dynamic table")),
        }
    }
}
