//! Read family over any readable datastore version.
//!
//! Reads never take the coordinator's single-flight flag; they only need a read-only pooled
//! connection, so they run alongside an in-flight configuration request.

use topo_common::error::{TopoError, TopoResult};
use topo_common::ids::SessionId;
use topo_core::key::TopoKey;
use topo_core::value::{Row, RowStatus};
use topo_core::version::DatastoreVersion;
use topo_storage::pool::{ConnectionPurpose, DbConnection};
use tracing::trace;

use crate::context::TxContext;

/// Read operation variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadKind {
    /// Exactly the requested key.
    Read,
    /// The first row after the requested key, in key order.
    ReadNext,
    /// Rows after the requested key across every key type.
    ReadBulk,
    /// Siblings of the requested key, starting at the first one.
    ReadSiblingBegin,
    /// Siblings after the requested key.
    ReadSibling,
    /// Number of siblings, the requested key included.
    ReadSiblingCount,
}

/// Rows returned by one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResponse {
    /// Returned rows in key order.
    pub rows: Vec<Row>,
    /// Row count; for sibling counts this is the only payload.
    pub count: usize,
}

impl ReadResponse {
    fn rows(rows: Vec<Row>) -> Self {
        let count = rows.len();
        Self { rows, count }
    }
}

/// Executes read operations.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    ctx: TxContext,
}

impl ReadRequest {
    /// Creates the read handler.
    #[must_use]
    pub fn new(ctx: TxContext) -> Self {
        Self { ctx }
    }

    /// Runs one read of `kind` anchored at `key`.
    ///
    /// `max_repeat_count` bounds the number of returned rows; zero means one row. Rows marked
    /// `DELETED` in CANDIDATE are invisible.
    ///
    /// # Errors
    ///
    /// Returns `TopoError::InvalidRequest` when the key type cannot be read from `version`,
    /// `TopoError::DbQuery` when `READ` or `READ_NEXT` find nothing, and datastore errors.
    pub fn read(
        &self,
        session: SessionId,
        kind: ReadKind,
        version: DatastoreVersion,
        key: &TopoKey,
        max_repeat_count: u32,
    ) -> TopoResult<ReadResponse> {
        self.ctx.registry.check_read_target(key.key_type(), version)?;
        let limit = usize::try_from(max_repeat_count.max(1)).unwrap_or(usize::MAX);
        let connection = self.ctx.checkout(ConnectionPurpose::ReadOnly, session)?;
        trace!(?kind, %version, key = %key, limit, "read");
        let response = match kind {
            ReadKind::Read => match visible(connection.get(version, key)?) {
                Some(row) => ReadResponse::rows(vec![row]),
                None => return Err(TopoError::DbQuery(format!("{key} not found in {version}"))),
            },
            ReadKind::ReadNext => match next_visible(&connection, version, key)? {
                Some(row) => ReadResponse::rows(vec![row]),
                None => return Err(TopoError::DbQuery(format!("no row after {key} in {version}"))),
            },
            ReadKind::ReadBulk => {
                let mut rows = Vec::new();
                let mut cursor = key.clone();
                while rows.len() < limit {
                    let Some(row) = next_visible(&connection, version, &cursor)? else {
                        break;
                    };
                    cursor = row.key.clone();
                    rows.push(row);
                }
                ReadResponse::rows(rows)
            }
            ReadKind::ReadSiblingBegin => {
                let mut rows = siblings(&connection, version, key)?;
                rows.truncate(limit);
                ReadResponse::rows(rows)
            }
            ReadKind::ReadSibling => {
                let mut rows = siblings(&connection, version, key)?
                    .into_iter()
                    .filter(|row| &row.key > key)
                    .collect::<Vec<_>>();
                rows.truncate(limit);
                ReadResponse::rows(rows)
            }
            ReadKind::ReadSiblingCount => ReadResponse {
                rows: Vec::new(),
                count: siblings(&connection, version, key)?.len(),
            },
        };
        Ok(response)
    }
}

fn visible(row: Option<Row>) -> Option<Row> {
    row.filter(|row| row.status != RowStatus::Deleted)
}

fn next_visible(
    connection: &DbConnection,
    version: DatastoreVersion,
    key: &TopoKey,
) -> TopoResult<Option<Row>> {
    let mut cursor = key.clone();
    while let Some(row) = connection.next_after(version, &cursor)? {
        if row.status != RowStatus::Deleted {
            return Ok(Some(row));
        }
        cursor = row.key;
    }
    Ok(None)
}

/// Rows sharing the key type and parent of `key`, in key order.
fn siblings(
    connection: &DbConnection,
    version: DatastoreVersion,
    key: &TopoKey,
) -> TopoResult<Vec<Row>> {
    let key_type = key.key_type();
    let parent = key.parent();
    connection.scan(version, |row| {
        row.status != RowStatus::Deleted
            && row.key.key_type() == key_type
            && row.key.parent() == parent
    })
}
