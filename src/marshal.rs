//! Reader for the CPython `marshal` subset written by `pstats.Stats.dump_stats`.
//!
//! Only the value kinds a profile dump can contain are supported. Code
//! objects, sets and complex numbers are rejected as unknown type codes.

use std::path::Path;

use crate::ParseError;

const FLAG_REF: u8 = 0x80;
const MAX_DEPTH: usize = 256;

const TYPE_NULL: u8 = b'0';
const TYPE_NONE: u8 = b'N';
const TYPE_FALSE: u8 = b'F';
const TYPE_TRUE: u8 = b'T';
const TYPE_INT: u8 = b'i';
const TYPE_INT64: u8 = b'I';
const TYPE_LONG: u8 = b'l';
const TYPE_FLOAT: u8 = b'f';
const TYPE_BINARY_FLOAT: u8 = b'g';
const TYPE_STRING: u8 = b's';
const TYPE_INTERNED: u8 = b't';
const TYPE_STRINGREF: u8 = b'R';
const TYPE_UNICODE: u8 = b'u';
const TYPE_ASCII: u8 = b'a';
const TYPE_ASCII_INTERNED: u8 = b'A';
const TYPE_SHORT_ASCII: u8 = b'z';
const TYPE_SHORT_ASCII_INTERNED: u8 = b'Z';
const TYPE_TUPLE: u8 = b'(';
const TYPE_SMALL_TUPLE: u8 = b')';
const TYPE_LIST: u8 = b'[';
const TYPE_DICT: u8 = b'{';
const TYPE_REF: u8 = b'r';

/// A decoded marshal value.
#[derive(Debug, Clone, PartialEq)]
pub enum MarshalValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<MarshalValue>),
    List(Vec<MarshalValue>),
    /// Entries in the order they were written.
    Dict(Vec<(MarshalValue, MarshalValue)>),
}

impl MarshalValue {
    /// Text content of `str` values, and of byte strings that are valid UTF-8
    /// (Python 2 dumps store file and function names as byte strings).
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::Tuple(_) => "tuple",
            Self::List(_) => "list",
            Self::Dict(_) => "dict",
        }
    }
}

pub fn from_path(path: &Path) -> Result<MarshalValue, ParseError> {
    let bytes = std::fs::read(path)?;
    from_slice(&bytes)
}

/// Decodes exactly one value; trailing bytes are an error.
pub fn from_slice(data: &[u8]) -> Result<MarshalValue, ParseError> {
    let mut reader = Reader::new(data);
    let value = reader.read_value()?;
    let rest = data.len() - reader.pos;
    if rest != 0 {
        return Err(ParseError::TrailingData { count: rest });
    }
    Ok(value)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
    refs: Vec<Option<MarshalValue>>,
    interned: Vec<String>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
            refs: Vec::new(),
            interned: Vec::new(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let available = self.data.len() - self.pos;
        if n > available {
            return Err(ParseError::Truncated {
                offset: self.pos,
                wanted: n - available,
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn peek(&self) -> Result<u8, ParseError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(ParseError::Truncated {
                offset: self.pos,
                wanted: 1,
            })
    }

    fn u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, ParseError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn length(&mut self) -> Result<usize, ParseError> {
        let offset = self.pos;
        let length = self.i32()?;
        usize::try_from(length).map_err(|_| ParseError::NegativeLength { length, offset })
    }

    fn read_value(&mut self) -> Result<MarshalValue, ParseError> {
        let offset = self.pos;
        let code = self.u8()?;
        if self.depth >= MAX_DEPTH {
            return Err(ParseError::TooDeep {
                limit: MAX_DEPTH,
                offset,
            });
        }

        // Container slots are reserved before their contents are read, so
        // indices match the writer's numbering.
        let slot = (code & FLAG_REF != 0).then(|| {
            self.refs.push(None);
            self.refs.len() - 1
        });

        self.depth += 1;
        let value = self.read_body(code & !FLAG_REF, offset);
        self.depth -= 1;
        let value = value?;

        if let Some(slot) = slot {
            self.refs[slot] = Some(value.clone());
        }
        Ok(value)
    }

    fn read_body(&mut self, kind: u8, offset: usize) -> Result<MarshalValue, ParseError> {
        match kind {
            TYPE_NULL => Err(ParseError::UnexpectedNull { offset }),
            TYPE_NONE => Ok(MarshalValue::None),
            TYPE_FALSE => Ok(MarshalValue::Bool(false)),
            TYPE_TRUE => Ok(MarshalValue::Bool(true)),
            TYPE_INT => Ok(MarshalValue::Int(i64::from(self.i32()?))),
            TYPE_INT64 => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(MarshalValue::Int(i64::from_le_bytes(raw)))
            }
            TYPE_LONG => self.read_long(offset),
            TYPE_FLOAT => {
                let n = usize::from(self.u8()?);
                let text = std::str::from_utf8(self.take(n)?)
                    .map_err(|source| ParseError::InvalidText { offset, source })?;
                text.trim()
                    .parse::<f64>()
                    .map(MarshalValue::Float)
                    .map_err(|_| ParseError::InvalidFloat { offset })
            }
            TYPE_BINARY_FLOAT => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(MarshalValue::Float(f64::from_le_bytes(raw)))
            }
            TYPE_STRING => {
                let n = self.length()?;
                Ok(MarshalValue::Bytes(self.take(n)?.to_vec()))
            }
            TYPE_INTERNED => {
                let n = self.length()?;
                let text = self.text(n, offset)?;
                self.interned.push(text.clone());
                Ok(MarshalValue::Str(text))
            }
            TYPE_STRINGREF => {
                let index = self.u32()?;
                self.interned
                    .get(index as usize)
                    .cloned()
                    .map(MarshalValue::Str)
                    .ok_or(ParseError::BadReference { index, offset })
            }
            TYPE_UNICODE | TYPE_ASCII | TYPE_ASCII_INTERNED => {
                let n = self.length()?;
                Ok(MarshalValue::Str(self.text(n, offset)?))
            }
            TYPE_SHORT_ASCII | TYPE_SHORT_ASCII_INTERNED => {
                let n = usize::from(self.u8()?);
                Ok(MarshalValue::Str(self.text(n, offset)?))
            }
            TYPE_TUPLE => {
                let n = self.length()?;
                Ok(MarshalValue::Tuple(self.sequence(n)?))
            }
            TYPE_SMALL_TUPLE => {
                let n = usize::from(self.u8()?);
                Ok(MarshalValue::Tuple(self.sequence(n)?))
            }
            TYPE_LIST => {
                let n = self.length()?;
                Ok(MarshalValue::List(self.sequence(n)?))
            }
            TYPE_DICT => {
                let mut entries = Vec::new();
                loop {
                    if self.peek()? == TYPE_NULL {
                        self.pos += 1;
                        break;
                    }
                    let key = self.read_value()?;
                    let value = self.read_value()?;
                    entries.push((key, value));
                }
                Ok(MarshalValue::Dict(entries))
            }
            TYPE_REF => {
                let index = self.u32()?;
                match self.refs.get(index as usize) {
                    Some(Some(value)) => Ok(value.clone()),
                    _ => Err(ParseError::BadReference { index, offset }),
                }
            }
            code => Err(ParseError::UnknownType { code, offset }),
        }
    }

    fn text(&mut self, n: usize, offset: usize) -> Result<String, ParseError> {
        let bytes = self.take(n)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|source| ParseError::InvalidText { offset, source })
    }

    fn sequence(&mut self, n: usize) -> Result<Vec<MarshalValue>, ParseError> {
        // Cap the preallocation; a corrupt length must not reserve gigabytes.
        let mut items = Vec::with_capacity(n.min(1024));
        for _ in 0..n {
            items.push(self.read_value()?);
        }
        Ok(items)
    }

    /// Arbitrary-precision ints as base 2**15 digits, least significant first.
    fn read_long(&mut self, offset: usize) -> Result<MarshalValue, ParseError> {
        let n = self.i32()?;
        let negative = n < 0;
        let count = n.unsigned_abs() as usize;
        let raw = self.take(count.saturating_mul(2))?;

        let mut magnitude: i128 = 0;
        for chunk in raw.chunks_exact(2).rev() {
            let digit = i128::from(u16::from_le_bytes([chunk[0], chunk[1]]));
            if digit >= 1 << 15 {
                return Err(ParseError::Shape(format!(
                    "long digit {digit} out of range at offset {offset}"
                )));
            }
            magnitude = (magnitude << 15) | digit;
            if magnitude > i128::from(i64::MAX) + 1 {
                return Err(ParseError::IntegerOverflow { offset });
            }
        }

        let value = if negative { -magnitude } else { magnitude };
        i64::try_from(value)
            .map(MarshalValue::Int)
            .map_err(|_| ParseError::IntegerOverflow { offset })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::dump;
    use super::*;

    #[test]
    fn reads_nested_containers_written_by_fixture_writer() {
        let value = MarshalValue::Dict(vec![(
            MarshalValue::Tuple(vec![
                MarshalValue::Str("a.py".to_string()),
                MarshalValue::Int(10),
                MarshalValue::Str("f".to_string()),
            ]),
            MarshalValue::List(vec![MarshalValue::Float(0.25), MarshalValue::None]),
        )]);
        assert_eq!(from_slice(&dump(&value)).expect("decode"), value);
    }

    #[test]
    fn longs_beyond_i32_decode() {
        for v in [i64::from(i32::MAX) + 1, -(1 << 40), i64::MAX, i64::MIN + 1] {
            let bytes = dump(&MarshalValue::Int(v));
            assert_eq!(bytes[0], TYPE_LONG);
            assert_eq!(from_slice(&bytes).expect("decode"), MarshalValue::Int(v));
        }
    }

    #[test]
    fn long_too_large_is_overflow() {
        // Five digits of 0x7fff is 75 bits.
        let mut bytes = vec![TYPE_LONG];
        bytes.extend_from_slice(&5i32.to_le_bytes());
        for _ in 0..5 {
            bytes.extend_from_slice(&0x7fffu16.to_le_bytes());
        }
        assert!(matches!(
            from_slice(&bytes),
            Err(ParseError::IntegerOverflow { offset: 0 })
        ));
    }

    #[test]
    fn back_references_resolve_to_earlier_values() {
        // ( 'a'|FLAG_REF "x", r 0 )
        let mut bytes = vec![TYPE_SMALL_TUPLE, 2, TYPE_SHORT_ASCII | FLAG_REF, 1, b'x'];
        bytes.push(TYPE_REF);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            from_slice(&bytes).expect("decode"),
            MarshalValue::Tuple(vec![
                MarshalValue::Str("x".to_string()),
                MarshalValue::Str("x".to_string()),
            ])
        );
    }

    #[test]
    fn flagged_container_reserves_slot_before_children() {
        // Outer tuple takes ref 0, the inner string ref 1; `r 1` must see the string.
        let mut bytes = vec![TYPE_SMALL_TUPLE | FLAG_REF, 2, TYPE_SHORT_ASCII | FLAG_REF, 1, b'y'];
        bytes.push(TYPE_REF);
        bytes.extend_from_slice(&1u32.to_le_bytes());
        let value = from_slice(&bytes).expect("decode");
        assert_eq!(
            value,
            MarshalValue::Tuple(vec![
                MarshalValue::Str("y".to_string()),
                MarshalValue::Str("y".to_string()),
            ])
        );
    }

    #[test]
    fn reference_to_unfinished_container_is_rejected() {
        let mut bytes = vec![TYPE_SMALL_TUPLE | FLAG_REF, 1, TYPE_REF];
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert!(matches!(
            from_slice(&bytes),
            Err(ParseError::BadReference { index: 0, .. })
        ));
    }

    #[test]
    fn python2_interned_strings_and_stringrefs() {
        let mut bytes = vec![TYPE_SMALL_TUPLE, 2, TYPE_INTERNED];
        bytes.extend_from_slice(&3i32.to_le_bytes());
        bytes.extend_from_slice(b"foo");
        bytes.push(TYPE_STRINGREF);
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(
            from_slice(&bytes).expect("decode"),
            MarshalValue::Tuple(vec![
                MarshalValue::Str("foo".to_string()),
                MarshalValue::Str("foo".to_string()),
            ])
        );
    }

    #[test]
    fn reads_cpython_cprofile_dump_with_references() {
        let bytes = include_bytes!("../tests/fixtures/cprofile_small.prof");
        assert_eq!(bytes[0], TYPE_DICT | FLAG_REF);
        assert!(bytes.contains(&TYPE_REF));

        let MarshalValue::Dict(entries) = from_slice(bytes).expect("decode") else {
            panic!("expected a dict");
        };
        assert_eq!(entries.len(), 4);

        let leaf = MarshalValue::Tuple(vec![
            MarshalValue::Str("demo.py".to_string()),
            MarshalValue::Int(2),
            MarshalValue::Str("leaf".to_string()),
        ]);
        let work = MarshalValue::Tuple(vec![
            MarshalValue::Str("demo.py".to_string()),
            MarshalValue::Int(5),
            MarshalValue::Str("work".to_string()),
        ]);
        assert_eq!(entries[0].0, leaf);
        assert_eq!(entries[1].0, work);

        // This caller key is built entirely from back-references.
        let MarshalValue::Tuple(stats) = &entries[3].1 else {
            panic!("expected a stats tuple");
        };
        let MarshalValue::Dict(callers) = &stats[4] else {
            panic!("expected a callers dict");
        };
        assert_eq!(callers[0].0, leaf);
    }

    #[test]
    fn text_floats_parse() {
        let mut bytes = vec![TYPE_FLOAT, 4];
        bytes.extend_from_slice(b"1.25");
        assert_eq!(from_slice(&bytes).expect("decode"), MarshalValue::Float(1.25));
    }

    #[test]
    fn truncated_input_reports_offset() {
        let bytes = [TYPE_INT, 1, 0];
        assert!(matches!(
            from_slice(&bytes),
            Err(ParseError::Truncated { offset: 1, wanted: 2 })
        ));
    }

    #[test]
    fn unterminated_dict_is_truncated() {
        let bytes = [TYPE_DICT, TYPE_NONE, TYPE_NONE];
        assert!(matches!(from_slice(&bytes), Err(ParseError::Truncated { .. })));
    }

    #[test]
    fn unknown_codes_and_trailing_bytes_are_errors() {
        assert!(matches!(
            from_slice(b"c"),
            Err(ParseError::UnknownType { code: b'c', offset: 0 })
        ));
        assert!(matches!(
            from_slice(b"NN"),
            Err(ParseError::TrailingData { count: 1 })
        ));
        assert!(matches!(
            from_slice(b"hello world"),
            Err(ParseError::UnknownType { .. })
        ));
    }

    #[test]
    fn negative_lengths_are_rejected() {
        let mut bytes = vec![TYPE_LIST];
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(
            from_slice(&bytes),
            Err(ParseError::NegativeLength { length: -1, offset: 1 })
        ));
    }

    #[test]
    fn deep_nesting_is_bounded() {
        let mut bytes = vec![TYPE_SMALL_TUPLE, 1].repeat(MAX_DEPTH + 1);
        bytes.push(TYPE_NONE);
        assert!(matches!(from_slice(&bytes), Err(ParseError::TooDeep { .. })));
    }
}
