//! Primitive wire values of the native protocol
//!
//! All integers are big-endian. Every length prefix is computed from the
//! value at encode time; decoded lengths are checked against the bytes that
//! actually remain before anything is sliced.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DriverError, DriverResult};

/// Largest byte length representable by a `[short]` length prefix.
pub const MAX_SHORT_LEN: usize = u16::MAX as usize;

/// Largest byte length representable by an `[int]` length prefix.
pub const MAX_INT_LEN: usize = i32::MAX as usize;

fn check_len(len: usize, max: usize) -> DriverResult<()> {
    if len > max {
        return Err(DriverError::ValueTooLarge { len, max });
    }
    Ok(())
}

// ==================== Encoding ====================

pub fn put_short(buf: &mut BytesMut, value: u16) {
    buf.put_u16(value);
}

pub fn put_int(buf: &mut BytesMut, value: i32) {
    buf.put_i32(value);
}

/// `[string]`: u16 byte length followed by UTF-8 bytes.
pub fn put_string(buf: &mut BytesMut, value: &str) -> DriverResult<()> {
    check_len(value.len(), MAX_SHORT_LEN)?;
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// `[long string]`: i32 byte length followed by UTF-8 bytes.
pub fn put_long_string(buf: &mut BytesMut, value: &str) -> DriverResult<()> {
    check_len(value.len(), MAX_INT_LEN)?;
    buf.put_i32(value.len() as i32);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// `[bytes]`: i32 length then raw bytes; `None` encodes as length -1.
pub fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) -> DriverResult<()> {
    match value {
        Some(data) => {
            check_len(data.len(), MAX_INT_LEN)?;
            buf.put_i32(data.len() as i32);
            buf.put_slice(data);
        }
        None => buf.put_i32(-1),
    }
    Ok(())
}

pub fn put_string_list(buf: &mut BytesMut, values: &[String]) -> DriverResult<()> {
    check_len(values.len(), MAX_SHORT_LEN)?;
    buf.put_u16(values.len() as u16);
    for value in values {
        put_string(buf, value)?;
    }
    Ok(())
}

/// Encode a single `[string]` into a fresh buffer.
pub fn encode_string(value: &str) -> DriverResult<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(2 + value.len());
    put_string(&mut buf, value)?;
    Ok(buf.to_vec())
}

/// Decode a single `[string]`, returning it with the unread tail.
pub fn decode_string(data: &[u8]) -> DriverResult<(String, &[u8])> {
    let mut reader = WireReader::new(data);
    let value = reader.read_string()?;
    Ok((value, reader.remaining()))
}

// ==================== String pairs and maps ====================

/// An ordered key/value pair of `[string]`s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringPair {
    pub key: String,
    pub value: String,
}

impl StringPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> DriverResult<()> {
        put_string(buf, &self.key)?;
        put_string(buf, &self.value)
    }

    pub fn encode(&self) -> DriverResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> DriverResult<(Self, &[u8])> {
        let mut reader = WireReader::new(data);
        let pair = reader.read_string_pair()?;
        Ok((pair, reader.remaining()))
    }
}

/// Insertion-ordered `[string map]`, the body of STARTUP and CREDENTIALS.
///
/// The `[short]` count is derived from `pairs` when encoding, so it always
/// matches the number of pairs written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringMultimap {
    pairs: Vec<StringPair>,
}

impl StringMultimap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pair(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push(StringPair::new(key, value));
    }

    pub fn count(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[StringPair] {
        &self.pairs
    }

    /// First value stored under `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|pair| pair.key == key)
            .map(|pair| pair.value.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) -> DriverResult<()> {
        check_len(self.pairs.len(), MAX_SHORT_LEN)?;
        buf.put_u16(self.pairs.len() as u16);
        for pair in &self.pairs {
            pair.encode_into(buf)?;
        }
        Ok(())
    }

    pub fn encode(&self) -> DriverResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> DriverResult<(Self, &[u8])> {
        let mut reader = WireReader::new(data);
        let map = reader.read_string_multimap()?;
        Ok((map, reader.remaining()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StringMultimap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = StringMultimap::new();
        for (key, value) in iter {
            map.add_pair(key, value);
        }
        map
    }
}

/// `[string multimap]` of string lists, as carried by SUPPORTED.
pub type StringListMap = Vec<(String, Vec<String>)>;

// ==================== Decoding ====================

/// Bounds-checked reader over a response body.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    data: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, needed: usize) -> DriverResult<&'a [u8]> {
        if self.data.len() < needed {
            return Err(DriverError::TruncatedData {
                needed,
                available: self.data.len(),
            });
        }
        let (head, tail) = self.data.split_at(needed);
        self.data = tail;
        Ok(head)
    }

    fn take_array<const N: usize>(&mut self) -> DriverResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> DriverResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_short(&mut self) -> DriverResult<u16> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub fn read_int(&mut self) -> DriverResult<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    fn utf8(raw: &[u8]) -> DriverResult<String> {
        String::from_utf8(raw.to_vec())
            .map_err(|e| DriverError::Protocol(format!("Invalid UTF-8 in string: {}", e)))
    }

    pub fn read_string(&mut self) -> DriverResult<String> {
        let len = self.read_short()? as usize;
        Self::utf8(self.take(len)?)
    }

    pub fn read_long_string(&mut self) -> DriverResult<String> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(DriverError::Protocol(format!(
                "Negative long string length {}",
                len
            )));
        }
        Self::utf8(self.take(len as usize)?)
    }

    /// `[bytes]`; a negative length is a null value.
    pub fn read_bytes(&mut self) -> DriverResult<Option<Bytes>> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(Bytes::copy_from_slice(self.take(len as usize)?)))
    }

    pub fn read_short_bytes(&mut self) -> DriverResult<Bytes> {
        let len = self.read_short()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    pub fn read_string_list(&mut self) -> DriverResult<Vec<String>> {
        let count = self.read_short()? as usize;
        let mut values = Vec::with_capacity(count.min(self.data.len()));
        for _ in 0..count {
            values.push(self.read_string()?);
        }
        Ok(values)
    }

    pub fn read_string_pair(&mut self) -> DriverResult<StringPair> {
        let key = self.read_string()?;
        let value = self.read_string()?;
        Ok(StringPair { key, value })
    }

    pub fn read_string_multimap(&mut self) -> DriverResult<StringMultimap> {
        let count = self.read_short()? as usize;
        let mut map = StringMultimap::new();
        for _ in 0..count {
            let pair = self.read_string_pair()?;
            map.pairs.push(pair);
        }
        Ok(map)
    }

    pub fn read_string_list_map(&mut self) -> DriverResult<StringListMap> {
        let count = self.read_short()? as usize;
        let mut entries = Vec::with_capacity(count.min(self.data.len()));
        for _ in 0..count {
            let key = self.read_string()?;
            let values = self.read_string_list()?;
            entries.push((key, values));
        }
        Ok(entries)
    }

    /// Consume whatever is left.
    pub fn read_rest(&mut self) -> Bytes {
        let rest = Bytes::copy_from_slice(self.data);
        self.data = &[];
        rest
    }
}
