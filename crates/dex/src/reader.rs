//! Just enough of the dex format to fingerprint every class definition.
//!
//! Offsets and sizes come from the dex header; every read is bounds checked,
//! and anything out of range is reported as [`ErrorKind::Malformed`].

use apkswap_cache::ClassChecksums;
use tracing::instrument;

use crate::error::{ErrorKind, Result};

pub const DEX_MAGIC_PREFIX: &[u8; 4] = b"dex\n";
pub const ENDIAN_CONSTANT: u32 = 0x1234_5678;
pub const NO_INDEX: u32 = 0xffff_ffff;
pub const HEADER_SIZE: usize = 0x70;
const CLASS_DEF_SIZE: usize = 32;

/// Computes the checksum of every class defined in `bytes`.
///
/// A class checksum covers its access flags, superclass, interfaces, fields
/// (name, type and flags) and methods (name, prototype, flags and bytecode),
/// so any source change that reaches the class definition changes it.
#[instrument(level = "debug", skip(bytes), fields(size = bytes.len()))]
pub fn class_checksums(bytes: &[u8]) -> Result<ClassChecksums> {
    let dex = Dex::parse(bytes)?;
    let mut classes = ClassChecksums::new();
    for index in 0..dex.class_defs.1 {
        let (name, checksum) = dex.class(index)?;
        classes.insert(name, checksum);
    }
    tracing::debug!(classes = classes.len(), "Computed class checksums");
    Ok(classes)
}

/// Converts a type descriptor (`Lcom/example/Foo;`) to a class name (`com.example.Foo`).
pub fn class_name(descriptor: &str) -> String {
    descriptor
        .strip_prefix('L')
        .and_then(|name| name.strip_suffix(';'))
        .unwrap_or(descriptor)
        .replace('/', ".")
}

fn malformed(what: impl Into<String>) -> exn::Exn<ErrorKind> {
    exn::Exn::new(ErrorKind::Malformed(what.into()))
}

/// Cursor over the dex bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], at: usize) -> Self {
        Self { bytes, at }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let slice = self
            .at
            .checked_add(len)
            .and_then(|end| self.bytes.get(self.at..end))
            .ok_or_else(|| malformed(format!("unexpected end of file reading {len} bytes at {:#x}", self.at)))?;
        self.at += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn uleb128(&mut self) -> Result<u32> {
        let mut value: u32 = 0;
        for shift in [0, 7, 14, 21, 28] {
            let byte = self.take(1)?[0];
            value |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(malformed(format!("uleb128 longer than five bytes at {:#x}", self.at)))
    }
}

/// A table in the id section: (offset, count).
type Table = (usize, usize);

struct Dex<'a> {
    bytes: &'a [u8],
    string_ids: Table,
    type_ids: Table,
    proto_ids: Table,
    field_ids: Table,
    method_ids: Table,
    class_defs: Table,
}

impl<'a> Dex<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || !bytes.starts_with(DEX_MAGIC_PREFIX) {
            return Err(malformed("missing dex header"));
        }
        let mut header = Cursor::new(bytes, 0x28);
        if header.u32()? != ENDIAN_CONSTANT {
            return Err(malformed("unsupported endianness"));
        }
        let mut header = Cursor::new(bytes, 0x38);
        // Every table must lie within the file before any count is trusted.
        let mut table = |entry_size: usize, what: &str| -> Result<Table> {
            let count = usize::try_from(header.u32()?).map_err(|_| malformed(format!("{what} table size")))?;
            let offset = usize::try_from(header.u32()?).map_err(|_| malformed(format!("{what} table offset")))?;
            let end = count.checked_mul(entry_size).and_then(|len| len.checked_add(offset));
            match end {
                Some(end) if end <= bytes.len() => Ok((offset, count)),
                _ => Err(malformed(format!("{what} table ({count} entries at {offset:#x}) exceeds the file"))),
            }
        };
        Ok(Self {
            bytes,
            string_ids: table(4, "string")?,
            type_ids: table(4, "type")?,
            proto_ids: table(12, "proto")?,
            field_ids: table(8, "field")?,
            method_ids: table(8, "method")?,
            class_defs: table(CLASS_DEF_SIZE, "class")?,
        })
    }

    fn item(&self, table: Table, index: usize, size: usize, what: &str) -> Result<Cursor<'a>> {
        if index >= table.1 {
            return Err(malformed(format!("{what} index {index} out of range ({})", table.1)));
        }
        Ok(Cursor::new(self.bytes, table.0 + index * size))
    }

    fn string(&self, index: u32) -> Result<String> {
        let mut id = self.item(self.string_ids, index as usize, 4, "string")?;
        let offset = id.u32()? as usize;
        let mut data = Cursor::new(self.bytes, offset);
        // The prefix counts UTF-16 code units, not bytes; the data is NUL terminated.
        data.uleb128()?;
        let rest = self.bytes.get(data.at..).ok_or_else(|| malformed("string data"))?;
        let end = rest.iter().position(|b| *b == 0).ok_or_else(|| malformed("unterminated string"))?;
        Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
    }

    fn type_descriptor(&self, index: u32) -> Result<String> {
        if index == NO_INDEX {
            return Ok(String::new());
        }
        let mut id = self.item(self.type_ids, index as usize, 4, "type")?;
        self.string(id.u32()?)
    }

    /// Shorty and return type of a prototype.
    fn proto(&self, index: u16) -> Result<(String, String)> {
        let mut id = self.item(self.proto_ids, usize::from(index), 12, "proto")?;
        let shorty = self.string(id.u32()?)?;
        let return_type = self.type_descriptor(id.u32()?)?;
        Ok((shorty, return_type))
    }

    fn type_list(&self, offset: u32) -> Result<Vec<String>> {
        if offset == 0 {
            return Ok(Vec::new());
        }
        let mut list = Cursor::new(self.bytes, offset as usize);
        let size = list.u32()?;
        (0..size).map(|_| self.type_descriptor(u32::from(list.u16()?))).collect()
    }

    fn class(&self, index: usize) -> Result<(String, u64)> {
        let mut def = self.item(self.class_defs, index, CLASS_DEF_SIZE, "class")?;
        let class_idx = def.u32()?;
        let access_flags = def.u32()?;
        let superclass_idx = def.u32()?;
        let interfaces_off = def.u32()?;
        let _source_file_idx = def.u32()?;
        let _annotations_off = def.u32()?;
        let class_data_off = def.u32()?;

        let name = class_name(&self.type_descriptor(class_idx)?);
        let mut hasher = blake3::Hasher::new();
        hasher.update(&access_flags.to_le_bytes());
        update_str(&mut hasher, &self.type_descriptor(superclass_idx)?);
        for interface in self.type_list(interfaces_off)? {
            update_str(&mut hasher, &interface);
        }
        if class_data_off != 0 {
            self.hash_class_data(&mut hasher, class_data_off as usize)?;
        }
        Ok((name, truncate(hasher.finalize())))
    }

    fn hash_class_data(&self, hasher: &mut blake3::Hasher, offset: usize) -> Result<()> {
        let mut data = Cursor::new(self.bytes, offset);
        let static_fields = data.uleb128()?;
        let instance_fields = data.uleb128()?;
        let direct_methods = data.uleb128()?;
        let virtual_methods = data.uleb128()?;

        for (tag, count) in [(b'S', static_fields), (b'I', instance_fields)] {
            hasher.update(&[tag]);
            let mut field_idx = 0u32;
            for _ in 0..count {
                field_idx = field_idx.wrapping_add(data.uleb128()?);
                let access_flags = data.uleb128()?;
                let mut id = self.item(self.field_ids, field_idx as usize, 8, "field")?;
                let _class_idx = id.u16()?;
                let type_idx = id.u16()?;
                update_str(hasher, &self.string(id.u32()?)?);
                update_str(hasher, &self.type_descriptor(u32::from(type_idx))?);
                hasher.update(&access_flags.to_le_bytes());
            }
        }
        for (tag, count) in [(b'D', direct_methods), (b'V', virtual_methods)] {
            hasher.update(&[tag]);
            let mut method_idx = 0u32;
            for _ in 0..count {
                method_idx = method_idx.wrapping_add(data.uleb128()?);
                let access_flags = data.uleb128()?;
                let code_off = data.uleb128()?;
                let mut id = self.item(self.method_ids, method_idx as usize, 8, "method")?;
                let _class_idx = id.u16()?;
                let (shorty, return_type) = self.proto(id.u16()?)?;
                update_str(hasher, &self.string(id.u32()?)?);
                update_str(hasher, &shorty);
                update_str(hasher, &return_type);
                hasher.update(&access_flags.to_le_bytes());
                if code_off != 0 {
                    self.hash_code(hasher, code_off as usize)?;
                }
            }
        }
        Ok(())
    }

    fn hash_code(&self, hasher: &mut blake3::Hasher, offset: usize) -> Result<()> {
        let mut code = Cursor::new(self.bytes, offset);
        // registers, ins, outs, tries
        hasher.update(code.take(8)?);
        let _debug_info_off = code.u32()?;
        let insns_size = code.u32()? as usize;
        let insns = code.take(insns_size.checked_mul(2).ok_or_else(|| malformed("insns size"))?)?;
        hasher.update(insns);
        Ok(())
    }
}

fn update_str(hasher: &mut blake3::Hasher, value: &str) {
    hasher.update(value.as_bytes());
    hasher.update(&[0]);
}

/// First eight bytes of a blake3 hash, little-endian.
pub(crate) fn truncate(hash: blake3::Hash) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DexBuilder;
    use rstest::rstest;

    #[test]
    fn every_class_is_fingerprinted() {
        let dex = DexBuilder::new()
            .class("com.example.Main", &[("onCreate", &[0x0e00])])
            .class("com.example.Helper", &[("help", &[0x1200, 0x0f00]), ("<init>", &[0x0e00])])
            .class("com.example.Empty", &[])
            .build();
        let classes = class_checksums(&dex).unwrap();
        assert_eq!(classes.len(), 3);
        assert!(classes.contains_key("com.example.Main"));
        assert!(classes.contains_key("com.example.Helper"));
        assert!(classes.contains_key("com.example.Empty"));
    }

    #[test]
    fn only_the_edited_class_changes() {
        let before = DexBuilder::new()
            .class("a.Kept", &[("run", &[0x0e00])])
            .class("a.Edited", &[("run", &[0x0e00])])
            .build();
        let after = DexBuilder::new()
            .class("a.Kept", &[("run", &[0x0e00])])
            .class("a.Edited", &[("run", &[0x1201, 0x0e00])])
            .build();
        let before = class_checksums(&before).unwrap();
        let after = class_checksums(&after).unwrap();
        assert_eq!(before["a.Kept"], after["a.Kept"]);
        assert_ne!(before["a.Edited"], after["a.Edited"]);
    }

    #[test]
    fn renaming_a_method_changes_the_class() {
        let before = DexBuilder::new().class("a.A", &[("run", &[0x0e00])]).build();
        let after = DexBuilder::new().class("a.A", &[("walk", &[0x0e00])]).build();
        assert_ne!(class_checksums(&before).unwrap()["a.A"], class_checksums(&after).unwrap()["a.A"]);
    }

    #[rstest]
    #[case::empty(&[])]
    #[case::not_dex(b"PK\x03\x04 this is a zip, not a dex file at all.........................................................................")]
    fn rejects_non_dex_input(#[case] bytes: &[u8]) {
        let err = class_checksums(bytes).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[test]
    fn truncated_file_is_malformed() {
        let dex = DexBuilder::new().class("a.A", &[("run", &[0x0e00])]).build();
        let err = class_checksums(&dex[..dex.len() - 4]).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[rstest]
    #[case::string_count(0x38, 0xffff_fff0)]
    #[case::type_offset(0x44, 0xffff_fff0)]
    #[case::method_count(0x58, 0x1000)]
    #[case::class_count(0x60, 0xffff_fff0)]
    #[case::class_offset(0x64, 0xffff_ff00)]
    fn table_beyond_the_file_is_malformed(#[case] at: usize, #[case] value: u32) {
        let mut dex = DexBuilder::new().class("a.A", &[("run", &[0x0e00])]).build();
        dex[at..at + 4].copy_from_slice(&value.to_le_bytes());
        let err = class_checksums(&dex).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Malformed(_)));
    }

    #[rstest]
    #[case("Lcom/example/Foo;", "com.example.Foo")]
    #[case("Lcom/example/Outer$Inner;", "com.example.Outer$Inner")]
    #[case("I", "I")]
    fn converts_descriptors(#[case] descriptor: &str, #[case] expected: &str) {
        assert_eq!(class_name(descriptor), expected);
    }
}
