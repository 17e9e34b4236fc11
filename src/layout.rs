//! Declarative description of fixed-size, big-endian on-disk records.
//!
//! Every structure of the container (trailer, chunk table header, chunk
//! descriptor) is written down once as a [`Layout`]: a list of [`Field`]s with
//! their offset, width and an optional constant they must hold. A single
//! [`Layout::decode`] routine turns raw bytes into a [`Record`], so the
//! endianness and constant checks live in one place.

use thiserror::Error;

/// Width and interpretation of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Big-endian unsigned 32-bit integer.
    U32,
    /// Big-endian unsigned 64-bit integer.
    U64,
    /// Opaque byte string of the given length.
    Bytes(usize),
}

impl FieldKind {
    /// Number of bytes occupied by a field of this kind.
    pub const fn width(&self) -> usize {
        match self {
            FieldKind::U32 => 4,
            FieldKind::U64 => 8,
            FieldKind::Bytes(len) => *len,
        }
    }
}

/// A value a field is required to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constant {
    U32(u32),
    Bytes(&'static [u8]),
}

/// One named field of a [`Layout`].
#[derive(Debug, Clone, Copy)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
    pub constant: Option<Constant>,
}

impl Field {
    pub const fn u32(name: &'static str, offset: usize) -> Self {
        Field {
            name,
            offset,
            kind: FieldKind::U32,
            constant: None,
        }
    }

    pub const fn u64(name: &'static str, offset: usize) -> Self {
        Field {
            name,
            offset,
            kind: FieldKind::U64,
            constant: None,
        }
    }

    pub const fn bytes(name: &'static str, offset: usize, len: usize) -> Self {
        Field {
            name,
            offset,
            kind: FieldKind::Bytes(len),
            constant: None,
        }
    }

    /// Attach a constant the decoded value must equal.
    pub const fn expect(mut self, constant: Constant) -> Self {
        self.constant = Some(constant);
        self
    }

    const fn end(&self) -> usize {
        self.offset + self.kind.width()
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    U32(u32),
    U64(u64),
    Bytes(Vec<u8>),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{layout}: need {needed} bytes, only {available} available")]
    Truncated {
        layout: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{layout}: field '{field}' does not hold its expected constant (found {found})")]
    ConstantMismatch {
        layout: &'static str,
        field: &'static str,
        found: String,
    },

    #[error("{layout}: no field named '{field}' of the requested kind")]
    NoSuchField {
        layout: &'static str,
        field: &'static str,
    },
}

/// Schema of a fixed-size record.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub name: &'static str,
    /// Total size of the record in bytes; may exceed the last field (padding).
    pub size: usize,
    pub fields: &'static [Field],
}

impl Layout {
    /// Decode the record found at the start of `data`.
    ///
    /// Bytes past `self.size` are ignored. Fails if `data` is shorter than the
    /// record or if any constant field differs from its expected value.
    pub fn decode(&self, data: &[u8]) -> Result<Record, LayoutError> {
        if data.len() < self.size {
            return Err(LayoutError::Truncated {
                layout: self.name,
                needed: self.size,
                available: data.len(),
            });
        }

        let mut values = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let raw = &data[field.offset..field.end()];
            let value = match field.kind {
                FieldKind::U32 => Value::U32(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
                FieldKind::U64 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(raw);
                    Value::U64(u64::from_be_bytes(buf))
                }
                FieldKind::Bytes(_) => Value::Bytes(raw.to_vec()),
            };

            if let Some(constant) = field.constant {
                let matches = match (&constant, &value) {
                    (Constant::U32(want), Value::U32(got)) => want == got,
                    (Constant::Bytes(want), Value::Bytes(got)) => *want == got.as_slice(),
                    _ => false,
                };
                if !matches {
                    return Err(LayoutError::ConstantMismatch {
                        layout: self.name,
                        field: field.name,
                        found: display_value(&value),
                    });
                }
            }
            values.push((field.name, value));
        }

        Ok(Record {
            layout: self.name,
            values,
        })
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::U32(v) => format!("0x{:08x}", v),
        Value::U64(v) => format!("0x{:016x}", v),
        Value::Bytes(b) => format!("{:02x?}", b),
    }
}

/// Field values decoded by [`Layout::decode`], looked up by name.
#[derive(Debug, Clone)]
pub struct Record {
    layout: &'static str,
    values: Vec<(&'static str, Value)>,
}

impl Record {
    fn get(&self, name: &'static str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    fn missing(&self, field: &'static str) -> LayoutError {
        LayoutError::NoSuchField {
            layout: self.layout,
            field,
        }
    }

    pub fn u32(&self, name: &'static str) -> Result<u32, LayoutError> {
        match self.get(name) {
            Some(Value::U32(v)) => Ok(*v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn u64(&self, name: &'static str) -> Result<u64, LayoutError> {
        match self.get(name) {
            Some(Value::U64(v)) => Ok(*v),
            _ => Err(self.missing(name)),
        }
    }

    pub fn bytes(&self, name: &'static str) -> Result<&[u8], LayoutError> {
        match self.get(name) {
            Some(Value::Bytes(v)) => Ok(v),
            _ => Err(self.missing(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: &[u8] = b"TEST";
    const FIELDS: [Field; 4] = [
        Field::bytes("magic", 0, 4).expect(Constant::Bytes(MAGIC)),
        Field::u32("size", 4).expect(Constant::U32(24)),
        Field::u64("count", 8),
        Field::u32("flags", 16),
    ];
    const TEST_LAYOUT: Layout = Layout {
        name: "test",
        size: 24,
        fields: &FIELDS,
    };

    fn sample() -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"TEST");
        data.extend_from_slice(&24u32.to_be_bytes());
        data.extend_from_slice(&0x0102_0304_0506_0708u64.to_be_bytes());
        data.extend_from_slice(&0xdead_beefu32.to_be_bytes());
        data.extend_from_slice(&[0u8; 4]);
        data
    }

    #[test]
    fn test_decode_big_endian_fields() {
        let record = TEST_LAYOUT.decode(&sample()).unwrap();
        assert_eq!(record.bytes("magic").unwrap(), b"TEST");
        assert_eq!(record.u32("size").unwrap(), 24);
        assert_eq!(record.u64("count").unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(record.u32("flags").unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let mut data = sample();
        data.extend_from_slice(&[0xff; 100]);
        assert!(TEST_LAYOUT.decode(&data).is_ok());
    }

    #[test]
    fn test_truncated_input() {
        let data = sample();
        assert_eq!(
            TEST_LAYOUT.decode(&data[..20]).unwrap_err(),
            LayoutError::Truncated {
                layout: "test",
                needed: 24,
                available: 20
            }
        );
    }

    #[test]
    fn test_constant_mismatch() {
        let mut data = sample();
        data[0] = b'X';
        match TEST_LAYOUT.decode(&data) {
            Err(LayoutError::ConstantMismatch { field, .. }) => assert_eq!(field, "magic"),
            other => panic!("unexpected result: {:?}", other),
        }

        let mut data = sample();
        data[7] = 25;
        match TEST_LAYOUT.decode(&data) {
            Err(LayoutError::ConstantMismatch { field, .. }) => assert_eq!(field, "size"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_wrong_kind_lookup() {
        let record = TEST_LAYOUT.decode(&sample()).unwrap();
        assert!(record.u64("size").is_err());
        assert!(record.u32("missing").is_err());
    }
}
