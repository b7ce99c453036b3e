//! HPACK header compression (RFC 7541).
//!
//! One encoder and one decoder exist per connection, shared by every
//! stream; the dynamic tables are stateful and mutate only while a header
//! block is being processed, which the dispatcher serializes.

use std::collections::VecDeque;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::HpackError;
use crate::huffman;

/// A single header name/value pair. Names are kept lowercase on the wire
/// per RFC 7540 Section 8.1.2; this type does not normalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Entry size for table and header-list accounting (RFC 7541
    /// Section 4.1): octet lengths plus a 32-octet overhead estimate.
    pub(crate) fn hpack_size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

// -- Static table (RFC 7541 Appendix A), 1-indexed on the wire --

const STATIC_TABLE: [(&[u8], &[u8]); 61] = [
    (b":authority", b""),
    (b":method", b"GET"),
    (b":method", b"POST"),
    (b":path", b"/"),
    (b":path", b"/index.html"),
    (b":scheme", b"http"),
    (b":scheme", b"https"),
    (b":status", b"200"),
    (b":status", b"204"),
    (b":status", b"206"),
    (b":status", b"304"),
    (b":status", b"400"),
    (b":status", b"404"),
    (b":status", b"500"),
    (b"accept-charset", b""),
    (b"accept-encoding", b"gzip, deflate"),
    (b"accept-language", b""),
    (b"accept-ranges", b""),
    (b"accept", b""),
    (b"access-control-allow-origin", b""),
    (b"age", b""),
    (b"allow", b""),
    (b"authorization", b""),
    (b"cache-control", b""),
    (b"content-disposition", b""),
    (b"content-encoding", b""),
    (b"content-language", b""),
    (b"content-length", b""),
    (b"content-location", b""),
    (b"content-range", b""),
    (b"content-type", b""),
    (b"cookie", b""),
    (b"date", b""),
    (b"etag", b""),
    (b"expect", b""),
    (b"expires", b""),
    (b"from", b""),
    (b"host", b""),
    (b"if-match", b""),
    (b"if-modified-since", b""),
    (b"if-none-match", b""),
    (b"if-range", b""),
    (b"if-unmodified-since", b""),
    (b"last-modified", b""),
    (b"link", b""),
    (b"location", b""),
    (b"max-forwards", b""),
    (b"proxy-authenticate", b""),
    (b"proxy-authorization", b""),
    (b"range", b""),
    (b"referer", b""),
    (b"refresh", b""),
    (b"retry-after", b""),
    (b"server", b""),
    (b"set-cookie", b""),
    (b"strict-transport-security", b""),
    (b"transfer-encoding", b""),
    (b"user-agent", b""),
    (b"vary", b""),
    (b"via", b""),
    (b"www-authenticate", b""),
];

// -- Prefix integers (RFC 7541 Section 5.1) --

fn put_prefix_int(dst: &mut BytesMut, pattern: u8, prefix_bits: u8, value: usize) {
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

fn read_prefix_int(block: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let first = *block.get(*pos).ok_or(HpackError::Truncated)?;
    *pos += 1;
    let max = (1usize << prefix_bits) - 1;
    let mut value = usize::from(first) & max;
    if value < max {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *block.get(*pos).ok_or(HpackError::Truncated)?;
        *pos += 1;
        value = value
            .checked_add((usize::from(byte) & 0x7f) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 56 {
            return Err(HpackError::IntegerOverflow);
        }
    }
}

// -- String literals (RFC 7541 Section 5.2) --

fn put_string(dst: &mut BytesMut, data: &[u8]) {
    let coded = huffman::encoded_len(data);
    if coded < data.len() {
        put_prefix_int(dst, 0x80, 7, coded);
        huffman::encode(data, dst);
    } else {
        put_prefix_int(dst, 0x00, 7, data.len());
        dst.extend_from_slice(data);
    }
}

fn read_string(block: &[u8], pos: &mut usize) -> Result<Bytes, HpackError> {
    let coded = block.get(*pos).ok_or(HpackError::Truncated)? & 0x80 != 0;
    let len = read_prefix_int(block, pos, 7)?;
    let end = pos.checked_add(len).ok_or(HpackError::IntegerOverflow)?;
    if end > block.len() {
        return Err(HpackError::Truncated);
    }
    let raw = &block[*pos..end];
    *pos = end;
    if coded {
        Ok(Bytes::from(huffman::decode(raw)?))
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

// -- Dynamic table (RFC 7541 Section 2.3.2) --

/// Newest-first entry list. Position 0 maps to wire index 62.
struct DynamicTable {
    entries: VecDeque<HeaderField>,
    size: usize,
    capacity: usize,
}

impl DynamicTable {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    fn insert(&mut self, field: HeaderField) {
        let entry_size = field.hpack_size();
        while self.size + entry_size > self.capacity {
            match self.entries.pop_back() {
                Some(evicted) => self.size -= evicted.hpack_size(),
                // An entry wider than the whole table empties it and is
                // itself not inserted (RFC 7541 Section 4.4).
                None => return,
            }
        }
        self.size += entry_size;
        self.entries.push_front(field);
    }

    fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.size > self.capacity {
            let evicted = self.entries.pop_back().expect("size tracked with entries");
            self.size -= evicted.hpack_size();
        }
    }

    fn get(&self, position: usize) -> Option<&HeaderField> {
        self.entries.get(position)
    }

    fn find(&self, name: &[u8], value: &[u8]) -> Option<(usize, bool)> {
        let mut name_only = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Some((i, true));
                }
                name_only.get_or_insert(i);
            }
        }
        name_only.map(|i| (i, false))
    }
}

/// Resolve a wire index against the static then dynamic table.
fn lookup(table: &DynamicTable, index: usize) -> Result<HeaderField, HpackError> {
    if index == 0 {
        return Err(HpackError::BadIndex(0));
    }
    if index <= STATIC_TABLE.len() {
        let (name, value) = STATIC_TABLE[index - 1];
        return Ok(HeaderField::new(
            Bytes::from_static(name),
            Bytes::from_static(value),
        ));
    }
    table
        .get(index - STATIC_TABLE.len() - 1)
        .cloned()
        .ok_or(HpackError::BadIndex(index))
}

// -- Encoder --

/// Stateful HPACK encoder for one direction of one connection.
pub struct Encoder {
    table: DynamicTable,
    /// Capacity change requested via the peer's SETTINGS_HEADER_TABLE_SIZE,
    /// signaled as a dynamic table size update at the start of the next
    /// block (RFC 7541 Section 4.2).
    pending_capacity: Option<usize>,
}

impl Encoder {
    pub fn new(capacity: usize) -> Self {
        Self {
            table: DynamicTable::new(capacity),
            pending_capacity: None,
        }
    }

    /// Adopt a new table capacity from the peer's SETTINGS.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.pending_capacity = Some(capacity);
    }

    /// Encode a header list as one block fragment.
    pub fn encode(&mut self, fields: &[HeaderField], dst: &mut BytesMut) {
        if let Some(capacity) = self.pending_capacity.take() {
            self.table.resize(capacity);
            put_prefix_int(dst, 0x20, 5, capacity);
        }
        for field in fields {
            self.encode_field(field, dst);
        }
    }

    fn encode_field(&mut self, field: &HeaderField, dst: &mut BytesMut) {
        let static_hit = STATIC_TABLE
            .iter()
            .position(|&(n, v)| field.name == n && field.value == v);
        if let Some(i) = static_hit {
            put_prefix_int(dst, 0x80, 7, i + 1);
            return;
        }
        if let Some((position, exact)) = self.table.find(&field.name, &field.value) {
            let index = STATIC_TABLE.len() + 1 + position;
            if exact {
                put_prefix_int(dst, 0x80, 7, index);
                return;
            }
            // Name in the dynamic table: literal with incremental indexing.
            put_prefix_int(dst, 0x40, 6, index);
            put_string(dst, &field.value);
            self.table.insert(field.clone());
            return;
        }
        let static_name = STATIC_TABLE.iter().position(|&(n, _)| field.name == n);
        match static_name {
            Some(i) => put_prefix_int(dst, 0x40, 6, i + 1),
            None => {
                put_prefix_int(dst, 0x40, 6, 0);
                put_string(dst, &field.name);
            }
        }
        put_string(dst, &field.value);
        self.table.insert(field.clone());
    }
}

// -- Decoder --

/// Stateful HPACK decoder for the other direction.
pub struct Decoder {
    table: DynamicTable,
    /// Ceiling for in-block table size updates: our
    /// SETTINGS_HEADER_TABLE_SIZE.
    max_capacity: usize,
    /// Our SETTINGS_MAX_HEADER_LIST_SIZE, enforced against the decoded
    /// list's accounting size.
    max_list_size: Option<usize>,
}

impl Decoder {
    pub fn new(max_capacity: usize) -> Self {
        Self {
            table: DynamicTable::new(max_capacity),
            max_capacity,
            max_list_size: None,
        }
    }

    pub fn set_max_list_size(&mut self, limit: Option<usize>) {
        self.max_list_size = limit;
    }

    /// Decode one complete header block.
    pub fn decode(&mut self, block: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut fields = Vec::new();
        let mut list_size = 0usize;
        let mut pos = 0usize;
        while pos < block.len() {
            let first = block[pos];
            let field = if first & 0x80 != 0 {
                // Indexed field.
                let index = read_prefix_int(block, &mut pos, 7)?;
                lookup(&self.table, index)?
            } else if first & 0xc0 == 0x40 {
                // Literal with incremental indexing.
                let field = self.read_literal(block, &mut pos, 6)?;
                self.table.insert(field.clone());
                field
            } else if first & 0xe0 == 0x20 {
                // Dynamic table size update.
                let capacity = read_prefix_int(block, &mut pos, 5)?;
                if capacity > self.max_capacity {
                    return Err(HpackError::TableSizeUpdate);
                }
                self.table.resize(capacity);
                continue;
            } else {
                // Literal without indexing (0000) or never indexed (0001);
                // both decode the same way.
                self.read_literal(block, &mut pos, 4)?
            };
            list_size += field.hpack_size();
            if let Some(limit) = self.max_list_size
                && list_size > limit
            {
                return Err(HpackError::ListTooLarge);
            }
            fields.push(field);
        }
        Ok(fields)
    }

    fn read_literal(
        &self,
        block: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<HeaderField, HpackError> {
        let name_index = read_prefix_int(block, pos, prefix_bits)?;
        let name = if name_index == 0 {
            read_string(block, pos)?
        } else {
            lookup(&self.table, name_index)?.name
        };
        let value = read_string(block, pos)?;
        Ok(HeaderField { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        HeaderField::new(name.as_bytes(), value.as_bytes())
    }

    fn encode_block(enc: &mut Encoder, fields: &[HeaderField]) -> BytesMut {
        let mut buf = BytesMut::new();
        enc.encode(fields, &mut buf);
        buf
    }

    #[test]
    fn prefix_int_round_trip() {
        for value in [0usize, 9, 31, 32, 127, 128, 1337, 1 << 20] {
            let mut buf = BytesMut::new();
            put_prefix_int(&mut buf, 0, 5, value);
            let mut pos = 0;
            assert_eq!(read_prefix_int(&buf, &mut pos, 5).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test]
    fn rfc_c_1_examples() {
        // C.1.1: 10 with a 5-bit prefix.
        let mut buf = BytesMut::new();
        put_prefix_int(&mut buf, 0, 5, 10);
        assert_eq!(&buf[..], [0x0a]);
        // C.1.2: 1337 with a 5-bit prefix.
        let mut buf = BytesMut::new();
        put_prefix_int(&mut buf, 0, 5, 1337);
        assert_eq!(&buf[..], [0x1f, 0x9a, 0x0a]);
    }

    #[test]
    fn static_table_round_trip() {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        let fields = vec![
            field(":method", "GET"),
            field(":path", "/"),
            field(":scheme", "https"),
        ];
        let block = encode_block(&mut enc, &fields);
        // Fully indexed: one octet each.
        assert_eq!(block.len(), 3);
        assert_eq!(dec.decode(&block).unwrap(), fields);
    }

    #[test]
    fn dynamic_table_reused_across_blocks() {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        let fields = vec![field("x-trace-id", "abc123def")];
        let first = encode_block(&mut enc, &fields);
        let second = encode_block(&mut enc, &fields);
        // The second block hits the dynamic table and shrinks to an index.
        assert!(second.len() < first.len());
        assert_eq!(dec.decode(&first).unwrap(), fields);
        assert_eq!(dec.decode(&second).unwrap(), fields);
    }

    #[test]
    fn name_match_emits_literal_value() {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        let a = vec![field("content-length", "42")];
        let b = vec![field("content-length", "43")];
        assert_eq!(dec.decode(&encode_block(&mut enc, &a)).unwrap(), a);
        assert_eq!(dec.decode(&encode_block(&mut enc, &b)).unwrap(), b);
    }

    #[test]
    fn table_size_update_is_emitted_and_honored() {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        enc.set_capacity(0);
        let fields = vec![field("x-a", "1")];
        let block = encode_block(&mut enc, &fields);
        // Starts with a table size update to 0.
        assert_eq!(block[0] & 0xe0, 0x20);
        assert_eq!(dec.decode(&block).unwrap(), fields);
        // With a zero-capacity table nothing can be indexed; a repeat block
        // is the same size.
        let again = encode_block(&mut enc, &fields);
        assert_eq!(dec.decode(&again).unwrap(), fields);
    }

    #[test]
    fn oversized_table_update_rejected() {
        let mut dec = Decoder::new(4096);
        let mut block = BytesMut::new();
        put_prefix_int(&mut block, 0x20, 5, 8192);
        assert_eq!(dec.decode(&block), Err(HpackError::TableSizeUpdate));
    }

    #[test]
    fn zero_index_rejected() {
        let mut dec = Decoder::new(4096);
        assert_eq!(dec.decode(&[0x80]), Err(HpackError::BadIndex(0)));
    }

    #[test]
    fn out_of_range_index_rejected() {
        let mut dec = Decoder::new(4096);
        let mut block = BytesMut::new();
        put_prefix_int(&mut block, 0x80, 7, 99);
        assert!(matches!(dec.decode(&block), Err(HpackError::BadIndex(99))));
    }

    #[test]
    fn truncated_literal_rejected() {
        let mut enc = Encoder::new(4096);
        let block = encode_block(&mut enc, &[field("x-long-header", "with a value")]);
        let mut dec = Decoder::new(4096);
        assert_eq!(
            dec.decode(&block[..block.len() - 3]),
            Err(HpackError::Truncated)
        );
    }

    #[test]
    fn header_list_limit_enforced() {
        let mut enc = Encoder::new(4096);
        let mut dec = Decoder::new(4096);
        dec.set_max_list_size(Some(40));
        // name(7) + value(5) + 32 = 44 > 40.
        let block = encode_block(&mut enc, &[field("x-large", "abcde")]);
        assert_eq!(dec.decode(&block), Err(HpackError::ListTooLarge));
    }

    #[test]
    fn eviction_keeps_size_consistent() {
        // Capacity fits roughly one entry; inserting three keeps evicting.
        let mut table = DynamicTable::new(64);
        table.insert(field("x-one", "aaaaaaaaaa"));
        table.insert(field("x-two", "bbbbbbbbbb"));
        table.insert(field("x-three", "cccccccccc"));
        assert!(table.size <= 64);
        assert_eq!(table.entries.len(), 1);
        assert_eq!(&table.get(0).unwrap().name[..], b"x-three");
    }
}
