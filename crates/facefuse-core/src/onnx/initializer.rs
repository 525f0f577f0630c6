//! Minimal protobuf reader for pulling a graph initializer out of an ONNX
//! model file.
//!
//! Only the fields needed to reach `ModelProto.graph.initializer[*]` and to
//! decode a float tensor are understood; everything else is skipped by wire
//! type.

use thiserror::Error;

// ModelProto
const MODEL_GRAPH: u32 = 7;
// GraphProto
const GRAPH_INITIALIZER: u32 = 5;
// TensorProto
const TENSOR_DIMS: u32 = 1;
const TENSOR_DATA_TYPE: u32 = 2;
const TENSOR_FLOAT_DATA: u32 = 4;
const TENSOR_NAME: u32 = 8;
const TENSOR_RAW_DATA: u32 = 9;
const DATA_TYPE_FLOAT: i64 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OnnxInitializerError {
    #[error("protobuf truncated at byte {0}")]
    Truncated(usize),
    #[error("unsupported protobuf wire type {wire_type} at byte {offset}")]
    UnsupportedWireType { wire_type: u8, offset: usize },
    #[error("model has no graph")]
    NoGraph,
    #[error("graph has no initializers")]
    NoInitializer,
    #[error("initializer {name} has data type {data_type}, expected float")]
    UnsupportedDataType { name: String, data_type: i64 },
    #[error("initializer {name}: dims imply {expected} values, found {actual}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// A decoded float initializer.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatInitializer {
    pub name: String,
    pub dims: Vec<i64>,
    pub values: Vec<f32>,
}

enum Field<'a> {
    Varint(u64),
    Fixed64,
    Bytes(&'a [u8]),
    Fixed32,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64, OnnxInitializerError> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(OnnxInitializerError::Truncated(self.pos))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(OnnxInitializerError::Truncated(self.pos))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], OnnxInitializerError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or(OnnxInitializerError::Truncated(self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_field(&mut self) -> Result<Option<(u32, Field<'a>)>, OnnxInitializerError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let offset = self.pos;
        let key = self.varint()?;
        let number = (key >> 3) as u32;
        let field = match (key & 0x7) as u8 {
            0 => Field::Varint(self.varint()?),
            1 => {
                self.take(8)?;
                Field::Fixed64
            }
            2 => {
                let len = self.varint()? as usize;
                Field::Bytes(self.take(len)?)
            }
            5 => {
                self.take(4)?;
                Field::Fixed32
            }
            wire_type => {
                return Err(OnnxInitializerError::UnsupportedWireType { wire_type, offset })
            }
        };
        Ok(Some((number, field)))
    }
}

fn last_bytes_field(buf: &[u8], number: u32) -> Result<Option<&[u8]>, OnnxInitializerError> {
    let mut reader = Reader::new(buf);
    let mut last = None;
    while let Some((n, field)) = reader.next_field()? {
        if let (true, Field::Bytes(bytes)) = (n == number, field) {
            last = Some(bytes);
        }
    }
    Ok(last)
}

fn decode_tensor(buf: &[u8]) -> Result<FloatInitializer, OnnxInitializerError> {
    let mut name = String::new();
    let mut dims = Vec::new();
    let mut data_type = 0i64;
    let mut values = Vec::new();
    let mut raw: Option<&[u8]> = None;

    let mut reader = Reader::new(buf);
    while let Some((number, field)) = reader.next_field()? {
        match (number, field) {
            (TENSOR_DIMS, Field::Varint(v)) => dims.push(v as i64),
            (TENSOR_DIMS, Field::Bytes(packed)) => {
                let mut r = Reader::new(packed);
                while r.pos < packed.len() {
                    dims.push(r.varint()? as i64);
                }
            }
            (TENSOR_DATA_TYPE, Field::Varint(v)) => data_type = v as i64,
            (TENSOR_FLOAT_DATA, Field::Bytes(packed)) => {
                values.extend(
                    packed
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])),
                );
            }
            (TENSOR_NAME, Field::Bytes(bytes)) => name = String::from_utf8_lossy(bytes).into_owned(),
            (TENSOR_RAW_DATA, Field::Bytes(bytes)) => raw = Some(bytes),
            _ => {}
        }
    }

    if data_type != DATA_TYPE_FLOAT {
        return Err(OnnxInitializerError::UnsupportedDataType { name, data_type });
    }
    if let Some(raw) = raw {
        values = raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
    }

    let expected = dims.iter().map(|&d| d.max(0) as usize).product::<usize>();
    if expected != values.len() {
        return Err(OnnxInitializerError::ShapeMismatch {
            name,
            expected,
            actual: values.len(),
        });
    }

    Ok(FloatInitializer { name, dims, values })
}

/// Decode the last initializer of the model's graph.
pub fn last_initializer(model: &[u8]) -> Result<FloatInitializer, OnnxInitializerError> {
    let graph = last_bytes_field(model, MODEL_GRAPH)?.ok_or(OnnxInitializerError::NoGraph)?;
    let tensor =
        last_bytes_field(graph, GRAPH_INITIALIZER)?.ok_or(OnnxInitializerError::NoInitializer)?;
    decode_tensor(tensor)
}
