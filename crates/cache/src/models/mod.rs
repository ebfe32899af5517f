//! Row types and the conversions between them and the public models.
//!
//! SQLite has no unsigned 64-bit integer, so checksums are stored as the
//! `i64` with the same bit pattern.

use crate::{DexFileEntry, DexFileIndex};

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct DexFileRow {
    pub idx: i64,
    pub checksum: i64,
    pub name: String,
}

impl From<DexFileRow> for DexFileEntry {
    fn from(row: DexFileRow) -> Self {
        Self {
            index: DexFileIndex(row.idx),
            checksum: from_sql(row.checksum),
            name: row.name,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ClassRow {
    pub name: String,
    pub checksum: i64,
}

pub(crate) fn to_sql(checksum: u64) -> i64 {
    i64::from_ne_bytes(checksum.to_ne_bytes())
}

pub(crate) fn from_sql(checksum: i64) -> u64 {
    u64::from_ne_bytes(checksum.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(u64::MAX)]
    #[case(1 << 63)]
    #[case(0x0123_4567_89AB_CDEF)]
    fn checksums_survive_signed_storage(#[case] checksum: u64) {
        assert_eq!(from_sql(to_sql(checksum)), checksum);
    }

    #[test]
    fn row_to_entry() {
        let entry = DexFileEntry::from(DexFileRow { idx: 3, checksum: -1, name: "classes.dex".into() });
        assert_eq!(entry.index, DexFileIndex(3));
        assert_eq!(entry.checksum, u64::MAX);
        assert_eq!(entry.name, "classes.dex");
    }
}
