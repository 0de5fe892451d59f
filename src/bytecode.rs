//! JVM class-file decoding.
//!
//! The decoder extracts structure only: names, supertypes, members, class-level
//! annotations and the member symbols statically referenced by each method body.
//! Instructions are walked to find field and method references; nothing is
//! verified or interpreted.

use std::collections::HashSet;

use crate::error::ParseError;
use crate::model::{AccessFlags, FieldRecord, MemberKind, MemberRef, MethodRecord, ParsedClass};

/// Parser adapter: decodes the raw bytes of one artifact entry.
pub trait ClassParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedClass, ParseError>;
}

/// Default parser for `.class` entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytecodeParser;

impl ClassParser for BytecodeParser {
    fn parse(&self, bytes: &[u8]) -> Result<ParsedClass, ParseError> {
        parse_class(bytes)
    }
}

pub fn parse_class(bytes: &[u8]) -> Result<ParsedClass, ParseError> {
    let mut reader = ClassReader::new(bytes);
    reader.expect_magic()?;
    let _minor_version = reader.read_u2()?;
    let _major_version = reader.read_u2()?;
    let pool = ConstantPool::parse(&mut reader)?;

    let access = AccessFlags(reader.read_u2()?);
    let this_class = reader.read_u2()?;
    let super_index = reader.read_u2()?;

    let name = pool.class_name(this_class)?;
    let super_class = if super_index == 0 {
        None
    } else {
        Some(pool.class_name(super_index)?)
    };

    let interfaces_count = reader.read_u2()?;
    let mut interfaces = Vec::with_capacity(interfaces_count as usize);
    for _ in 0..interfaces_count {
        interfaces.push(pool.class_name(reader.read_u2()?)?);
    }

    let fields_count = reader.read_u2()?;
    let mut fields = Vec::with_capacity(fields_count as usize);
    for _ in 0..fields_count {
        let access = AccessFlags(reader.read_u2()?);
        let name = pool.utf8(reader.read_u2()?)?.to_string();
        let descriptor = pool.utf8(reader.read_u2()?)?.to_string();
        let attributes_count = reader.read_u2()?;
        skip_attributes(&mut reader, attributes_count)?;
        fields.push(FieldRecord {
            name,
            descriptor,
            access,
        });
    }

    let methods_count = reader.read_u2()?;
    let mut methods = Vec::with_capacity(methods_count as usize);
    for _ in 0..methods_count {
        let access = AccessFlags(reader.read_u2()?);
        let name = pool.utf8(reader.read_u2()?)?.to_string();
        let descriptor = pool.utf8(reader.read_u2()?)?.to_string();
        let attributes_count = reader.read_u2()?;

        let mut references = Vec::new();
        for _ in 0..attributes_count {
            let attribute_name = pool.utf8(reader.read_u2()?)?;
            let length = reader.read_u4()? as usize;
            let body = reader.read_slice(length)?;
            if attribute_name == "Code" {
                references = code_references(body, &pool)?;
            }
        }

        methods.push(MethodRecord {
            name,
            descriptor,
            access,
            references,
        });
    }

    let mut annotations = Vec::new();
    let attributes_count = reader.read_u2()?;
    for _ in 0..attributes_count {
        let attribute_name = pool.utf8(reader.read_u2()?)?;
        let length = reader.read_u4()? as usize;
        let body = reader.read_slice(length)?;
        if attribute_name == "RuntimeVisibleAnnotations"
            || attribute_name == "RuntimeInvisibleAnnotations"
        {
            read_annotation_types(body, &pool, &mut annotations)?;
        }
    }

    Ok(ParsedClass {
        name,
        super_class,
        interfaces,
        access,
        fields,
        methods,
        annotations,
    })
}

/// Converts an internal name (`a/b/C`) to a dotted FQN.
pub fn internal_to_fqn(internal: &str) -> String {
    internal.replace('/', ".")
}

fn descriptor_to_fqn(descriptor: &str) -> String {
    let trimmed = descriptor
        .strip_prefix('L')
        .and_then(|d| d.strip_suffix(';'))
        .unwrap_or(descriptor);
    internal_to_fqn(trimmed)
}

#[derive(Debug, Clone)]
enum Constant {
    Utf8(String),
    Class { name_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    Member {
        kind: MemberKind,
        class_index: u16,
        name_and_type_index: u16,
    },
    Other,
    Unusable,
}

struct ConstantPool {
    entries: Vec<Constant>,
}

impl ConstantPool {
    fn parse(reader: &mut ClassReader<'_>) -> Result<Self, ParseError> {
        let count = reader.read_u2()? as usize;
        let mut entries = Vec::with_capacity(count);
        entries.push(Constant::Unusable);

        let mut index = 1;
        while index < count {
            let tag = reader.read_u1()?;
            let entry = match tag {
                1 => {
                    let length = reader.read_u2()? as usize;
                    let bytes = reader.read_slice(length)?;
                    Constant::Utf8(String::from_utf8_lossy(bytes).into_owned())
                }
                3 | 4 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                // Long and Double occupy two slots.
                5 | 6 => {
                    reader.skip(8)?;
                    entries.push(Constant::Other);
                    index += 1;
                    Constant::Unusable
                }
                7 => Constant::Class {
                    name_index: reader.read_u2()?,
                },
                8 | 16 | 19 | 20 => {
                    reader.skip(2)?;
                    Constant::Other
                }
                9 | 10 | 11 => {
                    let kind = match tag {
                        9 => MemberKind::Field,
                        10 => MemberKind::Method,
                        _ => MemberKind::InterfaceMethod,
                    };
                    Constant::Member {
                        kind,
                        class_index: reader.read_u2()?,
                        name_and_type_index: reader.read_u2()?,
                    }
                }
                12 => Constant::NameAndType {
                    name_index: reader.read_u2()?,
                    descriptor_index: reader.read_u2()?,
                },
                15 => {
                    reader.skip(3)?;
                    Constant::Other
                }
                17 | 18 => {
                    reader.skip(4)?;
                    Constant::Other
                }
                other => return Err(ParseError::UnsupportedConstant { tag: other }),
            };

            entries.push(entry);
            index += 1;
        }

        Ok(Self { entries })
    }

    fn get(&self, index: u16) -> Result<&Constant, ParseError> {
        self.entries
            .get(index as usize)
            .ok_or(ParseError::InvalidConstantIndex { index })
    }

    fn utf8(&self, index: u16) -> Result<&str, ParseError> {
        match self.get(index)? {
            Constant::Utf8(value) => Ok(value.as_str()),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    fn class_name(&self, index: u16) -> Result<String, ParseError> {
        match self.get(index)? {
            Constant::Class { name_index } => Ok(internal_to_fqn(self.utf8(*name_index)?)),
            _ => Err(ParseError::InvalidConstantIndex { index }),
        }
    }

    fn member_ref(&self, index: u16) -> Result<MemberRef, ParseError> {
        let Constant::Member {
            kind,
            class_index,
            name_and_type_index,
        } = self.get(index)?
        else {
            return Err(ParseError::InvalidConstantIndex { index });
        };
        let owner = self.class_name(*class_index)?;
        let Constant::NameAndType {
            name_index,
            descriptor_index,
        } = self.get(*name_and_type_index)?
        else {
            return Err(ParseError::InvalidConstantIndex {
                index: *name_and_type_index,
            });
        };
        Ok(MemberRef {
            owner,
            name: self.utf8(*name_index)?.to_string(),
            descriptor: self.utf8(*descriptor_index)?.to_string(),
            kind: *kind,
        })
    }
}

struct ClassReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ClassReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn expect_magic(&mut self) -> Result<(), ParseError> {
        const MAGIC: u32 = 0xCAFEBABE;
        if self.read_u4()? != MAGIC {
            return Err(ParseError::InvalidMagic);
        }
        Ok(())
    }

    fn read_u1(&mut self) -> Result<u8, ParseError> {
        let value = *self.data.get(self.pos).ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(value)
    }

    fn read_u2(&mut self) -> Result<u16, ParseError> {
        let bytes = self.read_slice(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ParseError> {
        let bytes = self.read_slice(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_slice(&mut self, len: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos.checked_add(len).ok_or(ParseError::UnexpectedEof)?;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(ParseError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, len: usize) -> Result<(), ParseError> {
        self.read_slice(len).map(|_| ())
    }
}

fn skip_attributes(reader: &mut ClassReader<'_>, count: u16) -> Result<(), ParseError> {
    for _ in 0..count {
        reader.read_u2()?;
        let length = reader.read_u4()? as usize;
        reader.skip(length)?;
    }
    Ok(())
}

/// Walks the instructions of a `Code` attribute body, collecting referenced
/// members in first-seen order.
fn code_references(body: &[u8], pool: &ConstantPool) -> Result<Vec<MemberRef>, ParseError> {
    let mut reader = ClassReader::new(body);
    let _max_stack = reader.read_u2()?;
    let _max_locals = reader.read_u2()?;
    let code_length = reader.read_u4()? as usize;
    let code = reader.read_slice(code_length)?;

    let mut seen = HashSet::new();
    let mut references = Vec::new();
    let mut pc = 0;
    while pc < code.len() {
        let opcode = code[pc];
        let length = instruction_length(code, pc)?;
        if pc + length > code.len() {
            return Err(ParseError::UnexpectedEof);
        }
        // getstatic..invokeinterface; invokedynamic has no static owner
        if (0xb2..=0xb9).contains(&opcode) {
            let index = u16::from_be_bytes([code[pc + 1], code[pc + 2]]);
            let member = pool.member_ref(index)?;
            if seen.insert(member.clone()) {
                references.push(member);
            }
        }
        pc += length;
    }
    Ok(references)
}

fn instruction_length(code: &[u8], pc: usize) -> Result<usize, ParseError> {
    let opcode = code[pc];
    let length = match opcode {
        0x00..=0x0f => 1,
        0x10 => 2,
        0x11 => 3,
        0x12 => 2,
        0x13 | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        0x99..=0xa8 => 3,
        0xa9 => 2,
        0xaa => {
            let base = switch_operands(pc);
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(ParseError::Malformed(format!(
                    "tableswitch at {pc} has high < low"
                )));
            }
            let cases = (i64::from(high) - i64::from(low) + 1) as usize;
            base + 12 + cases * 4 - pc
        }
        0xab => {
            let base = switch_operands(pc);
            let pairs = read_i32(code, base + 4)?;
            if pairs < 0 {
                return Err(ParseError::Malformed(format!(
                    "lookupswitch at {pc} has negative pair count"
                )));
            }
            base + 8 + pairs as usize * 8 - pc
        }
        0xac..=0xb1 => 1,
        0xb2..=0xb8 => 3,
        0xb9 | 0xba => 5,
        0xbb => 3,
        0xbc => 2,
        0xbd => 3,
        0xbe | 0xbf => 1,
        0xc0 | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        0xc4 => match code.get(pc + 1).copied() {
            Some(0x84) => 6,
            Some(_) => 4,
            None => return Err(ParseError::UnexpectedEof),
        },
        0xc5 => 4,
        0xc6 | 0xc7 => 3,
        0xc8 | 0xc9 => 5,
        other => {
            return Err(ParseError::UnknownOpcode {
                opcode: other,
                offset: pc,
            });
        }
    };
    Ok(length)
}

/// Offset of the first 4-byte operand of a switch, after alignment padding.
fn switch_operands(pc: usize) -> usize {
    let after_opcode = pc + 1;
    after_opcode + (4 - after_opcode % 4) % 4
}

fn read_i32(code: &[u8], at: usize) -> Result<i32, ParseError> {
    let bytes = code.get(at..at + 4).ok_or(ParseError::UnexpectedEof)?;
    Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_annotation_types(
    body: &[u8],
    pool: &ConstantPool,
    out: &mut Vec<String>,
) -> Result<(), ParseError> {
    let mut reader = ClassReader::new(body);
    let count = reader.read_u2()?;
    for _ in 0..count {
        let type_name = descriptor_to_fqn(pool.utf8(reader.read_u2()?)?);
        skip_annotation_pairs(&mut reader)?;
        if !out.contains(&type_name) {
            out.push(type_name);
        }
    }
    Ok(())
}

fn skip_annotation_pairs(reader: &mut ClassReader<'_>) -> Result<(), ParseError> {
    let pairs = reader.read_u2()?;
    for _ in 0..pairs {
        reader.read_u2()?;
        skip_element_value(reader)?;
    }
    Ok(())
}

fn skip_element_value(reader: &mut ClassReader<'_>) -> Result<(), ParseError> {
    match reader.read_u1()? {
        b'B' | b'C' | b'D' | b'F' | b'I' | b'J' | b'S' | b'Z' | b's' | b'c' => reader.skip(2),
        b'e' => reader.skip(4),
        b'@' => {
            reader.read_u2()?;
            skip_annotation_pairs(reader)
        }
        b'[' => {
            let values = reader.read_u2()?;
            for _ in 0..values {
                skip_element_value(reader)?;
            }
            Ok(())
        }
        other => Err(ParseError::Malformed(format!(
            "unknown annotation element tag {:?}",
            other as char
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_magic() {
        let err = parse_class(&[0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 52]).unwrap_err();
        assert_eq!(err, ParseError::InvalidMagic);
    }

    #[test]
    fn truncated_input_is_eof() {
        let err = parse_class(&[0xca, 0xfe, 0xba]).unwrap_err();
        assert_eq!(err, ParseError::UnexpectedEof);
    }

    #[test]
    fn unknown_constant_tag_is_reported() {
        let bytes = [0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 52, 0, 2, 99];
        let err = parse_class(&bytes).unwrap_err();
        assert_eq!(err, ParseError::UnsupportedConstant { tag: 99 });
    }

    #[test]
    fn tableswitch_length_includes_padding_and_cases() {
        // pc 1: opcode, 2 pad bytes, default, low=0, high=1, two offsets
        let mut code = vec![0x00, 0xaa, 0, 0];
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&[0; 8]);
        assert_eq!(instruction_length(&code, 1).unwrap(), 3 + 12 + 8);
    }

    #[test]
    fn wide_iinc_is_six_bytes() {
        assert_eq!(instruction_length(&[0xc4, 0x84, 0, 1, 0, 1], 0).unwrap(), 6);
        assert_eq!(instruction_length(&[0xc4, 0x15, 0, 1], 0).unwrap(), 4);
    }

    #[test]
    fn annotation_descriptor_becomes_fqn() {
        assert_eq!(descriptor_to_fqn("Ljavax/inject/Named;"), "javax.inject.Named");
    }
}
