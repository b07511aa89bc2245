//! Metadata dump format.
//!
//! The database is serialized table by table in a fixed order chosen so
//! that foreign-key targets precede their referrers on restore. Each table
//! record carries the table name, the column order, and a delta-encoded
//! row stream: integer columns are encoded as zigzag varints of the
//! difference against the previous row (rows are emitted in primary-key
//! order, so deltas stay small), blob columns are length-prefixed, time
//! columns are integer nanoseconds and encode like any other integer.

use sqlx::{Row, SqliteConnection};

use super::{DatabaseError, DbResult};

/// Column encoding kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColKind {
    /// NOT NULL integer (including time-as-nanoseconds columns).
    Int,
    /// Nullable integer.
    OptInt,
    /// NOT NULL blob.
    Blob,
    /// Nullable blob.
    OptBlob,
}

struct TableSpec {
    table: &'static str,
    /// ORDER BY clause establishing primary-key order.
    order: &'static str,
    columns: &'static [(&'static str, ColKind)],
}

/// Tables in dump order: foreign-key targets before their referrers.
const DUMP_SPEC: &[TableSpec] = &[
    TableSpec {
        table: "objects",
        order: "id",
        columns: &[
            ("id", ColKind::Int),
            ("refcount", ColKind::Int),
            ("hash", ColKind::OptBlob),
            ("size", ColKind::Int),
            ("compr_size", ColKind::OptInt),
        ],
    },
    TableSpec {
        table: "blocks",
        order: "id",
        columns: &[
            ("id", ColKind::Int),
            ("hash", ColKind::Blob),
            ("refcount", ColKind::Int),
            ("size", ColKind::Int),
            ("obj_id", ColKind::Int),
        ],
    },
    TableSpec {
        table: "inodes",
        order: "id",
        columns: &[
            ("id", ColKind::Int),
            ("mode", ColKind::Int),
            ("uid", ColKind::Int),
            ("gid", ColKind::Int),
            ("mtime_ns", ColKind::Int),
            ("atime_ns", ColKind::Int),
            ("ctime_ns", ColKind::Int),
            ("refcount", ColKind::Int),
            ("size", ColKind::Int),
            ("rdev", ColKind::Int),
            ("locked", ColKind::Int),
        ],
    },
    TableSpec {
        table: "inode_blocks",
        order: "inode, blockno",
        columns: &[
            ("inode", ColKind::Int),
            ("blockno", ColKind::Int),
            ("block_id", ColKind::Int),
        ],
    },
    TableSpec {
        table: "symlink_targets",
        order: "inode",
        columns: &[("inode", ColKind::Int), ("target", ColKind::Blob)],
    },
    TableSpec {
        table: "names",
        order: "id",
        columns: &[
            ("id", ColKind::Int),
            ("name", ColKind::Blob),
            ("refcount", ColKind::Int),
        ],
    },
    TableSpec {
        table: "contents",
        order: "id",
        columns: &[
            ("id", ColKind::Int),
            ("name_id", ColKind::Int),
            ("inode", ColKind::Int),
            ("parent_inode", ColKind::Int),
        ],
    },
    TableSpec {
        table: "ext_attributes",
        order: "inode, name_id",
        columns: &[
            ("inode", ColKind::Int),
            ("name_id", ColKind::Int),
            ("value", ColKind::Blob),
        ],
    },
];

fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn write_varint(out: &mut Vec<u8>, value: i64) {
    write_uvarint(out, ((value << 1) ^ (value >> 63)) as u64);
}

struct DumpCursor<'a> {
    data: &'a [u8],
}

impl<'a> DumpCursor<'a> {
    fn uvarint(&mut self) -> DbResult<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let Some((&byte, rest)) = self.data.split_first() else {
                return Err(DatabaseError::Dump("truncated varint".into()));
            };
            self.data = rest;
            if shift >= 64 {
                return Err(DatabaseError::Dump("varint overflow".into()));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn varint(&mut self) -> DbResult<i64> {
        let raw = self.uvarint()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    fn bytes(&mut self, len: usize) -> DbResult<&'a [u8]> {
        if self.data.len() < len {
            return Err(DatabaseError::Dump("truncated blob".into()));
        }
        let (head, tail) = self.data.split_at(len);
        self.data = tail;
        Ok(head)
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Serialize all metadata tables into one byte stream.
pub async fn dump_metadata(conn: &mut SqliteConnection) -> DbResult<Vec<u8>> {
    let mut out = Vec::new();
    for spec in DUMP_SPEC {
        dump_table(conn, spec, &mut out).await?;
    }
    Ok(out)
}

async fn dump_table(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    out: &mut Vec<u8>,
) -> DbResult<()> {
    let col_list: Vec<&str> = spec.columns.iter().map(|(name, _)| *name).collect();
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        col_list.join(", "),
        spec.table,
        spec.order
    );
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

    write_uvarint(out, spec.table.len() as u64);
    out.extend_from_slice(spec.table.as_bytes());
    write_uvarint(out, spec.columns.len() as u64);
    for (name, _) in spec.columns {
        write_uvarint(out, name.len() as u64);
        out.extend_from_slice(name.as_bytes());
    }
    write_uvarint(out, rows.len() as u64);

    let mut prev = vec![0i64; spec.columns.len()];
    for row in &rows {
        for (idx, (_, kind)) in spec.columns.iter().enumerate() {
            match kind {
                ColKind::Int => {
                    let value: i64 = row.get(idx);
                    write_varint(out, value - prev[idx]);
                    prev[idx] = value;
                }
                ColKind::OptInt => {
                    let value: Option<i64> = row.get(idx);
                    match value {
                        Some(value) => {
                            out.push(1);
                            write_varint(out, value - prev[idx]);
                            prev[idx] = value;
                        }
                        None => out.push(0),
                    }
                }
                ColKind::Blob => {
                    let value: Vec<u8> = row.get(idx);
                    write_uvarint(out, value.len() as u64);
                    out.extend_from_slice(&value);
                }
                ColKind::OptBlob => {
                    let value: Option<Vec<u8>> = row.get(idx);
                    match value {
                        Some(value) => {
                            out.push(1);
                            write_uvarint(out, value.len() as u64);
                            out.extend_from_slice(&value);
                        }
                        None => out.push(0),
                    }
                }
            }
        }
    }
    Ok(())
}

/// Restore all metadata tables from a dump. The schema must already exist
/// and the tables must be empty.
pub async fn restore_metadata(conn: &mut SqliteConnection, data: &[u8]) -> DbResult<()> {
    let mut cur = DumpCursor { data };
    for spec in DUMP_SPEC {
        restore_table(conn, spec, &mut cur).await?;
    }
    if !cur.is_empty() {
        return Err(DatabaseError::Dump("trailing bytes after last table".into()));
    }
    Ok(())
}

async fn restore_table(
    conn: &mut SqliteConnection,
    spec: &TableSpec,
    cur: &mut DumpCursor<'_>,
) -> DbResult<()> {
    let name_len = cur.uvarint()? as usize;
    let name = cur.bytes(name_len)?;
    if name != spec.table.as_bytes() {
        return Err(DatabaseError::Dump(format!(
            "expected table {:?}, found {:?}",
            spec.table,
            String::from_utf8_lossy(name)
        )));
    }
    let col_count = cur.uvarint()? as usize;
    if col_count != spec.columns.len() {
        return Err(DatabaseError::Dump(format!(
            "table {:?} has {} columns, expected {}",
            spec.table,
            col_count,
            spec.columns.len()
        )));
    }
    for (expected, _) in spec.columns {
        let len = cur.uvarint()? as usize;
        let got = cur.bytes(len)?;
        if got != expected.as_bytes() {
            return Err(DatabaseError::Dump(format!(
                "table {:?}: unexpected column {:?}",
                spec.table,
                String::from_utf8_lossy(got)
            )));
        }
    }

    let col_list: Vec<&str> = spec.columns.iter().map(|(name, _)| *name).collect();
    let placeholders = vec!["?"; spec.columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        spec.table,
        col_list.join(", "),
        placeholders
    );

    let row_count = cur.uvarint()?;
    let mut prev = vec![0i64; spec.columns.len()];
    for _ in 0..row_count {
        let mut query = sqlx::query(&sql);
        for (idx, (_, kind)) in spec.columns.iter().enumerate() {
            query = match kind {
                ColKind::Int => {
                    let value = prev[idx] + cur.varint()?;
                    prev[idx] = value;
                    query.bind(value)
                }
                ColKind::OptInt => {
                    let present = cur.bytes(1)?[0] != 0;
                    if present {
                        let value = prev[idx] + cur.varint()?;
                        prev[idx] = value;
                        query.bind(Some(value))
                    } else {
                        query.bind(None::<i64>)
                    }
                }
                ColKind::Blob => {
                    let len = cur.uvarint()? as usize;
                    query.bind(cur.bytes(len)?.to_vec())
                }
                ColKind::OptBlob => {
                    let present = cur.bytes(1)?[0] != 0;
                    if present {
                        let len = cur.uvarint()? as usize;
                        query.bind(Some(cur.bytes(len)?.to_vec()))
                    } else {
                        query.bind(None::<Vec<u8>>)
                    }
                }
            };
        }
        query.execute(&mut *conn).await?;
    }
    Ok(())
}
