//! Builders for small but structurally valid dex files and APKs.

use std::collections::{BTreeSet, HashMap};
use std::io::{Cursor, Write};
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::reader::{DEX_MAGIC_PREFIX, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX};

const OBJECT: &str = "Ljava/lang/Object;";
const ACC_PUBLIC: u32 = 0x1;
const ACC_CONSTRUCTOR: u32 = 0x1_0000;

/// Builds a dex file whose classes extend `java.lang.Object` and only hold
/// `void` methods without parameters. Enough for the class checksums to
/// react to renamed methods and edited bytecode.
#[derive(Debug, Default, Clone)]
pub struct DexBuilder {
    classes: Vec<(String, Vec<(String, Vec<u16>)>)>,
}

impl DexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a class with the given methods, each as (name, instructions).
    pub fn class(mut self, name: &str, methods: &[(&str, &[u16])]) -> Self {
        let methods = methods.iter().map(|(method, insns)| (method.to_string(), insns.to_vec())).collect();
        self.classes.push((name.to_string(), methods));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let descriptors: Vec<String> = self.classes.iter().map(|(name, _)| descriptor(name)).collect();

        let mut strings = BTreeSet::from(["V".to_string(), OBJECT.to_string()]);
        strings.extend(descriptors.iter().cloned());
        for (_, methods) in &self.classes {
            strings.extend(methods.iter().map(|(name, _)| name.clone()));
        }
        let strings: Vec<String> = strings.into_iter().collect();
        let string_idx: HashMap<&str, u32> = strings.iter().enumerate().map(|(i, s)| (s.as_str(), i as u32)).collect();

        let mut types = BTreeSet::from(["V", OBJECT]);
        types.extend(descriptors.iter().map(String::as_str));
        let types: Vec<&str> = types.into_iter().collect();
        let type_idx: HashMap<&str, u32> = types.iter().enumerate().map(|(i, s)| (*s, i as u32)).collect();

        // (class type, method name) in class order, so indices within a class ascend.
        let methods: Vec<(u32, u32)> = self
            .classes
            .iter()
            .zip(&descriptors)
            .flat_map(|((_, methods), descriptor)| {
                methods.iter().map(|(name, _)| (type_idx[descriptor.as_str()], string_idx[name.as_str()]))
            })
            .collect();

        let string_ids_off = HEADER_SIZE;
        let type_ids_off = string_ids_off + 4 * strings.len();
        let proto_ids_off = type_ids_off + 4 * types.len();
        let method_ids_off = proto_ids_off + 12;
        let class_defs_off = method_ids_off + 8 * methods.len();
        let data_off = align4(class_defs_off + 32 * self.classes.len());

        let mut data = Vec::new();
        let string_offsets: Vec<u32> = strings
            .iter()
            .map(|s| {
                let offset = (data_off + data.len()) as u32;
                write_uleb128(&mut data, s.encode_utf16().count() as u32);
                data.extend_from_slice(s.as_bytes());
                data.push(0);
                offset
            })
            .collect();

        let mut code_offsets = Vec::with_capacity(methods.len());
        for (_, class_methods) in &self.classes {
            for (_, insns) in class_methods {
                data.resize(align4(data_off + data.len()) - data_off, 0);
                code_offsets.push((data_off + data.len()) as u32);
                for field in [1u16, 0, 0, 0] {
                    data.extend_from_slice(&field.to_le_bytes());
                }
                data.extend_from_slice(&0u32.to_le_bytes());
                data.extend_from_slice(&(insns.len() as u32).to_le_bytes());
                for insn in insns {
                    data.extend_from_slice(&insn.to_le_bytes());
                }
            }
        }

        let mut class_data_offsets = Vec::with_capacity(self.classes.len());
        let mut method_idx = 0u32;
        for (_, class_methods) in &self.classes {
            if class_methods.is_empty() {
                class_data_offsets.push(0);
                continue;
            }
            class_data_offsets.push((data_off + data.len()) as u32);
            for count in [0, 0, class_methods.len() as u32, 0] {
                write_uleb128(&mut data, count);
            }
            for (position, (name, _)) in class_methods.iter().enumerate() {
                write_uleb128(&mut data, if position == 0 { method_idx } else { 1 });
                let flags = if name == "<init>" { ACC_PUBLIC | ACC_CONSTRUCTOR } else { ACC_PUBLIC };
                write_uleb128(&mut data, flags);
                write_uleb128(&mut data, code_offsets[(method_idx as usize) + position]);
            }
            method_idx += class_methods.len() as u32;
        }

        let file_size = data_off + data.len();
        let mut out = Vec::with_capacity(file_size);
        out.extend_from_slice(DEX_MAGIC_PREFIX);
        out.extend_from_slice(b"035\0");
        // Adler-32 checksum and SHA-1 signature are not verified by the reader.
        out.resize(0x20, 0);
        for value in [file_size, HEADER_SIZE] {
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        out.extend_from_slice(&ENDIAN_CONSTANT.to_le_bytes());
        // link_size, link_off, map_off
        out.resize(0x38, 0);
        for (count, offset) in [
            (strings.len(), string_ids_off),
            (types.len(), type_ids_off),
            (1, proto_ids_off),
            (0, 0),
            (methods.len(), method_ids_off),
            (self.classes.len(), class_defs_off),
            (data.len(), data_off),
        ] {
            out.extend_from_slice(&(count as u32).to_le_bytes());
            out.extend_from_slice(&(offset as u32).to_le_bytes());
        }

        for offset in &string_offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        for descriptor in &types {
            out.extend_from_slice(&string_idx[descriptor].to_le_bytes());
        }
        // The single prototype: `()V`.
        out.extend_from_slice(&string_idx["V"].to_le_bytes());
        out.extend_from_slice(&type_idx["V"].to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        for (class_idx, name_idx) in &methods {
            out.extend_from_slice(&(*class_idx as u16).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&name_idx.to_le_bytes());
        }
        for (descriptor, class_data_off) in descriptors.iter().zip(&class_data_offsets) {
            for value in [
                type_idx[descriptor.as_str()],
                ACC_PUBLIC,
                type_idx[OBJECT],
                0,
                NO_INDEX,
                0,
                *class_data_off,
                0,
            ] {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        out.resize(data_off, 0);
        out.extend_from_slice(&data);
        out
    }
}

/// Packs `entries` into an in-memory zip archive, in the given order.
pub fn zip(entries: &[(&str, &[u8])]) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in entries {
        writer.start_file(*name, SimpleFileOptions::default())?;
        writer.write_all(contents)?;
    }
    Ok(writer.finish()?.into_inner())
}

fn descriptor(class: &str) -> String {
    format!("L{};", class.replace('.', "/"))
}

fn align4(offset: usize) -> usize {
    (offset + 3) & !3
}

fn write_uleb128(out: &mut Vec<u8>, mut value: u32) {
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
