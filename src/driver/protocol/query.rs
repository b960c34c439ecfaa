//! QUERY request bodies and RESULT response bodies.
//!
//! Result cells are not interpreted: each row is a list of opaque `[bytes]`
//! values, with the column specs alongside so callers can decode them.

use bytes::{BufMut, Bytes, BytesMut};

use super::codec::{put_int, put_long_string, put_short, WireReader};
use super::error as server_error;
use super::frame::Frame;
use super::types::{Consistency, Opcode};
use crate::error::{DriverError, DriverResult};

const QUERY_FLAG_PAGE_SIZE: u8 = 0x04;

const RESULT_VOID: i32 = 0x0001;
const RESULT_ROWS: i32 = 0x0002;
const RESULT_SET_KEYSPACE: i32 = 0x0003;
const RESULT_PREPARED: i32 = 0x0004;
const RESULT_SCHEMA_CHANGE: i32 = 0x0005;

const METADATA_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const METADATA_HAS_MORE_PAGES: i32 = 0x0002;
const METADATA_NO_METADATA: i32 = 0x0004;

/// Nesting limit for collection/UDT/tuple type options.
const MAX_TYPE_DEPTH: usize = 32;

/// Encode a QUERY body for the given protocol version.
pub fn encode_query(
    version: u8,
    query: &str,
    consistency: Consistency,
    page_size: Option<i32>,
) -> DriverResult<Bytes> {
    let mut buf = BytesMut::with_capacity(query.len() + 16);
    put_long_string(&mut buf, query)?;
    put_short(&mut buf, consistency.as_u16());
    if version >= 2 {
        match page_size {
            Some(size) => {
                buf.put_u8(QUERY_FLAG_PAGE_SIZE);
                put_int(&mut buf, size);
            }
            None => buf.put_u8(0),
        }
    }
    Ok(buf.freeze())
}

/// Column type as announced by result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Native(u16),
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub column_type: ColumnType,
}

/// One result row: a cell per column, `None` for null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    cells: Vec<Option<Bytes>>,
}

impl Row {
    pub fn cells(&self) -> &[Option<Bytes>] {
        &self.cells
    }

    pub fn get(&self, index: usize) -> Option<&Bytes> {
        self.cells.get(index).and_then(|cell| cell.as_ref())
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// What kind of RESULT the server sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultKind {
    Void,
    Rows,
    SetKeyspace(String),
    Prepared,
    SchemaChange,
    Other(i32),
}

/// Decoded RESULT body. An empty row list is a valid result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResults {
    kind: ResultKind,
    columns: Vec<ColumnSpec>,
    rows: Vec<Row>,
    paging_state: Option<Bytes>,
    payload: Bytes,
}

impl QueryResults {
    pub fn empty(kind: ResultKind) -> Self {
        Self {
            kind,
            columns: Vec::new(),
            rows: Vec::new(),
            paging_state: None,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> &ResultKind {
        &self.kind
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn paging_state(&self) -> Option<&Bytes> {
        self.paging_state.as_ref()
    }

    /// Undecoded remainder for result kinds carried opaquely.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_rows(self) -> Vec<Row> {
        self.rows
    }
}

impl IntoIterator for QueryResults {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

/// Decode a RESULT body.
pub fn decode_result(body: &[u8]) -> DriverResult<QueryResults> {
    let mut reader = WireReader::new(body);
    let kind = reader.read_int()?;
    match kind {
        RESULT_VOID => Ok(QueryResults::empty(ResultKind::Void)),
        RESULT_ROWS => decode_rows(&mut reader),
        RESULT_SET_KEYSPACE => {
            let keyspace = reader.read_string()?;
            Ok(QueryResults::empty(ResultKind::SetKeyspace(keyspace)))
        }
        RESULT_PREPARED => Ok(opaque(ResultKind::Prepared, &mut reader)),
        RESULT_SCHEMA_CHANGE => Ok(opaque(ResultKind::SchemaChange, &mut reader)),
        other => Ok(opaque(ResultKind::Other(other), &mut reader)),
    }
}

/// Interpret the reply to a QUERY: RESULT decodes, ERROR is classified,
/// anything else is a protocol violation.
pub fn decode_reply(reply: &Frame) -> DriverResult<QueryResults> {
    match reply.opcode() {
        Opcode::Result => decode_result(reply.body()),
        Opcode::Error => Err(server_error::classify(reply.body())),
        other => Err(DriverError::Protocol(format!(
            "Unexpected {:?} in reply to QUERY",
            other
        ))),
    }
}

/// `USE "keyspace"` with embedded quotes doubled.
pub fn use_keyspace_statement(keyspace: &str) -> String {
    format!("USE \"{}\"", keyspace.replace('"', "\"\""))
}

fn opaque(kind: ResultKind, reader: &mut WireReader<'_>) -> QueryResults {
    let mut results = QueryResults::empty(kind);
    results.payload = reader.read_rest();
    results
}

fn decode_rows(reader: &mut WireReader<'_>) -> DriverResult<QueryResults> {
    let flags = reader.read_int()?;
    let column_count = read_count(reader, "column count")?;

    let paging_state = if flags & METADATA_HAS_MORE_PAGES != 0 {
        reader.read_bytes()?
    } else {
        None
    };

    let mut columns = Vec::new();
    if flags & METADATA_NO_METADATA == 0 {
        let global = if flags & METADATA_GLOBAL_TABLES_SPEC != 0 {
            Some((reader.read_string()?, reader.read_string()?))
        } else {
            None
        };
        columns.reserve(column_count.min(reader.remaining().len()));
        for _ in 0..column_count {
            let (keyspace, table) = match &global {
                Some((keyspace, table)) => (keyspace.clone(), table.clone()),
                None => (reader.read_string()?, reader.read_string()?),
            };
            let name = reader.read_string()?;
            let column_type = read_type(reader, 0)?;
            columns.push(ColumnSpec {
                keyspace,
                table,
                name,
                column_type,
            });
        }
    }

    let row_count = read_count(reader, "row count")?;
    let mut rows = Vec::with_capacity(row_count.min(reader.remaining().len()));
    for _ in 0..row_count {
        let mut cells = Vec::with_capacity(column_count.min(reader.remaining().len()));
        for _ in 0..column_count {
            cells.push(reader.read_bytes()?);
        }
        rows.push(Row { cells });
    }

    Ok(QueryResults {
        kind: ResultKind::Rows,
        columns,
        rows,
        paging_state,
        payload: Bytes::new(),
    })
}

fn read_count(reader: &mut WireReader<'_>, what: &str) -> DriverResult<usize> {
    let count = reader.read_int()?;
    if count < 0 {
        return Err(DriverError::Protocol(format!("Negative {}: {}", what, count)));
    }
    Ok(count as usize)
}

fn read_type(reader: &mut WireReader<'_>, depth: usize) -> DriverResult<ColumnType> {
    if depth > MAX_TYPE_DEPTH {
        return Err(DriverError::Protocol("Column type nested too deeply".to_string()));
    }
    let id = reader.read_short()?;
    let column_type = match id {
        0x0000 => ColumnType::Custom(reader.read_string()?),
        0x0020 => ColumnType::List(Box::new(read_type(reader, depth + 1)?)),
        0x0021 => {
            let key = read_type(reader, depth + 1)?;
            let value = read_type(reader, depth + 1)?;
            ColumnType::Map(Box::new(key), Box::new(value))
        }
        0x0022 => ColumnType::Set(Box::new(read_type(reader, depth + 1)?)),
        0x0030 => {
            let keyspace = reader.read_string()?;
            let name = reader.read_string()?;
            let count = reader.read_short()? as usize;
            let mut fields = Vec::with_capacity(count.min(reader.remaining().len()));
            for _ in 0..count {
                let field = reader.read_string()?;
                fields.push((field, read_type(reader, depth + 1)?));
            }
            ColumnType::Udt {
                keyspace,
                name,
                fields,
            }
        }
        0x0031 => {
            let count = reader.read_short()? as usize;
            let mut elements = Vec::with_capacity(count.min(reader.remaining().len()));
            for _ in 0..count {
                elements.push(read_type(reader, depth + 1)?);
            }
            ColumnType::Tuple(elements)
        }
        native => ColumnType::Native(native),
    };
    Ok(column_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::protocol::codec::{put_bytes, put_string, WireReader};

    #[test]
    fn test_encode_query_v1_has_no_flags() {
        let body = encode_query(1, "SELECT 1", Consistency::One, None).unwrap();
        let mut reader = WireReader::new(&body);
        assert_eq!(reader.read_long_string().unwrap(), "SELECT 1");
        assert_eq!(reader.read_short().unwrap(), 1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_encode_query_v4_with_page_size() {
        let body = encode_query(4, "SELECT 1", Consistency::Quorum, Some(100)).unwrap();
        let mut reader = WireReader::new(&body);
        reader.read_long_string().unwrap();
        assert_eq!(reader.read_short().unwrap(), 4);
        assert_eq!(reader.read_u8().unwrap(), QUERY_FLAG_PAGE_SIZE);
        assert_eq!(reader.read_int().unwrap(), 100);
    }

    #[test]
    fn test_void_result_is_empty() {
        let results = decode_result(&[0, 0, 0, 1]).unwrap();
        assert!(results.is_empty());
        assert_eq!(results.kind(), &ResultKind::Void);
    }

    #[test]
    fn test_rows_result_with_global_spec() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, RESULT_ROWS);
        put_int(&mut buf, METADATA_GLOBAL_TABLES_SPEC);
        put_int(&mut buf, 2);
        put_string(&mut buf, "ks").unwrap();
        put_string(&mut buf, "cf0").unwrap();
        put_string(&mut buf, "a").unwrap();
        put_short(&mut buf, 0x000D);
        put_string(&mut buf, "b").unwrap();
        put_short(&mut buf, 0x0020);
        put_short(&mut buf, 0x0009);
        put_int(&mut buf, 2);
        put_bytes(&mut buf, Some(b"x")).unwrap();
        put_bytes(&mut buf, None).unwrap();
        put_bytes(&mut buf, Some(b"y")).unwrap();
        put_bytes(&mut buf, Some(b"")).unwrap();

        let results = decode_result(&buf).unwrap();
        assert_eq!(results.columns().len(), 2);
        assert_eq!(results.columns()[0].table, "cf0");
        assert_eq!(
            results.columns()[1].column_type,
            ColumnType::List(Box::new(ColumnType::Native(0x0009)))
        );
        assert_eq!(results.len(), 2);
        assert_eq!(results.rows()[0].get(0).map(|b| &b[..]), Some(&b"x"[..]));
        assert_eq!(results.rows()[0].get(1), None);
        assert_eq!(results.rows()[1].get(1).map(|b| b.len()), Some(0));
    }

    #[test]
    fn test_set_keyspace_result() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, RESULT_SET_KEYSPACE);
        put_string(&mut buf, "clustertests").unwrap();
        let results = decode_result(&buf).unwrap();
        assert_eq!(
            results.kind(),
            &ResultKind::SetKeyspace("clustertests".to_string())
        );
    }

    #[test]
    fn test_truncated_rows_fail() {
        let mut buf = BytesMut::new();
        put_int(&mut buf, RESULT_ROWS);
        put_int(&mut buf, METADATA_NO_METADATA);
        put_int(&mut buf, 1);
        put_int(&mut buf, 3);
        assert!(matches!(
            decode_result(&buf),
            Err(DriverError::TruncatedData { .. })
        ));
    }

    #[test]
    fn test_decode_reply_classifies_errors() {
        let mut body = BytesMut::new();
        put_int(&mut body, 0x2000);
        put_string(&mut body, "line 1:0 no viable alternative").unwrap();
        let reply = Frame::with_flags(0x84, 0, 3, Opcode::Error, body.freeze()).unwrap();
        assert!(matches!(
            decode_reply(&reply),
            Err(DriverError::Server { code: 0x2000, .. })
        ));

        let ready = Frame::with_flags(0x84, 0, 3, Opcode::Ready, Bytes::new()).unwrap();
        assert!(matches!(decode_reply(&ready), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_use_keyspace_quoting() {
        assert_eq!(use_keyspace_statement("ks"), "USE \"ks\"");
        assert_eq!(use_keyspace_statement("a\"b"), "USE \"a\"\"b\"");
    }
}
