//! The SKilL field-type catalogue.
//!
//! [`FieldType`] is the closed set of types a field can carry, with uniform
//! decode, encode and offset computation. For every type and value,
//! `write_value` emits exactly `offset` bytes.

use std::io::Write;
use std::sync::Arc;

use byteorder::{BigEndian, WriteBytesExt};
use indexmap::IndexMap;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::SkillError;
use crate::pools::{self, Obj, StoragePool};
use crate::streams::{v64_len, MappedInStream, V64Write};
use crate::strings::StringPool;

/// First type id available to user pools.
pub const FIRST_POOL_TYPE_ID: i64 = 32;

/// Wire tags of the built-in field types.
///
/// User pool references are encoded as their pool type id (>= 32) and have
/// no tag here.
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TypeTag {
    ConstI8 = 0,
    ConstI16 = 1,
    ConstI32 = 2,
    ConstI64 = 3,
    ConstV64 = 4,
    Annotation = 5,
    Bool = 6,
    I8 = 7,
    I16 = 8,
    I32 = 9,
    I64 = 10,
    V64 = 11,
    F32 = 12,
    F64 = 13,
    Str = 14,
    ConstArray = 15,
    VarArray = 17,
    List = 18,
    Set = 19,
    Map = 20,
}

/// The type of a field.
///
/// Constants carry their baked-in value and are equal only if the values
/// match; they consume no bytes on read and emit none on write. `Ref` holds
/// the index of the target pool in the state's pool vector.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    ConstI8(i8),
    ConstI16(i16),
    ConstI32(i32),
    ConstI64(i64),
    ConstV64(i64),
    /// A reference to an instance of any type, encoded with its type id.
    Annotation,
    Bool,
    I8,
    I16,
    I32,
    I64,
    V64,
    F32,
    F64,
    Str,
    ConstArray { len: u64, ground: Box<FieldType> },
    VarArray(Box<FieldType>),
    List(Box<FieldType>),
    Set(Box<FieldType>),
    Map { key: Box<FieldType>, value: Box<FieldType> },
    /// A reference to an instance of the pool at this index.
    Ref(usize),
}

/// A dynamically typed field value.
///
/// `Null` stands in for absent strings, references, annotations and maps;
/// the owning [`FieldType`] decides how it is encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(Arc<str>),
    Ref(Obj),
    Array(Vec<FieldValue>),
    Set(Vec<FieldValue>),
    Map(Vec<(FieldValue, FieldValue)>),
}

/// Shared context of the decode phase.
pub(crate) struct ReadCtx<'a> {
    pub pools: &'a [StoragePool],
    pub strings: &'a StringPool,
}

/// Shared context of the offset and write phases.
///
/// `string_ids` is a snapshot of the string-id assignment produced by the
/// string pool's prepare step.
pub(crate) struct WriteCtx<'a> {
    pub pools: &'a [StoragePool],
    pub string_ids: &'a IndexMap<Arc<str>, u64>,
}

impl FieldType {
    /// The stable type id of this type.
    #[must_use]
    pub fn type_id(&self) -> i64 {
        use FieldType::*;
        match self {
            ConstI8(_) => 0,
            ConstI16(_) => 1,
            ConstI32(_) => 2,
            ConstI64(_) => 3,
            ConstV64(_) => 4,
            Annotation => 5,
            Bool => 6,
            I8 => 7,
            I16 => 8,
            I32 => 9,
            I64 => 10,
            V64 => 11,
            F32 => 12,
            F64 => 13,
            Str => 14,
            ConstArray { .. } => 15,
            VarArray(_) => 17,
            List(_) => 18,
            Set(_) => 19,
            Map { .. } => 20,
            Ref(pool) => FIRST_POOL_TYPE_ID + *pool as i64,
        }
    }

    /// Decode a field-type declaration from the schema stream.
    ///
    /// `pool_count` bounds the pool references a declaration may mention.
    pub(crate) fn parse(
        s: &mut MappedInStream<'_>,
        pool_count: usize,
    ) -> Result<FieldType, SkillError> {
        let tag = s.read_v64()?;
        if tag >= FIRST_POOL_TYPE_ID {
            let pool = (tag - FIRST_POOL_TYPE_ID) as usize;
            if pool >= pool_count {
                return Err(SkillError::InvalidPoolIndex {
                    index: tag as u64,
                    size: pool_count,
                });
            }
            return Ok(FieldType::Ref(pool));
        }
        let tag_byte =
            u8::try_from(tag).map_err(|_| SkillError::InvalidFieldTag(tag))?;
        let tag = TypeTag::try_from(tag_byte).map_err(|_| SkillError::InvalidFieldTag(tag))?;
        Ok(match tag {
            TypeTag::ConstI8 => FieldType::ConstI8(s.read_i8()?),
            TypeTag::ConstI16 => FieldType::ConstI16(s.read_i16()?),
            TypeTag::ConstI32 => FieldType::ConstI32(s.read_i32()?),
            TypeTag::ConstI64 => FieldType::ConstI64(s.read_i64()?),
            TypeTag::ConstV64 => FieldType::ConstV64(s.read_v64()?),
            TypeTag::Annotation => FieldType::Annotation,
            TypeTag::Bool => FieldType::Bool,
            TypeTag::I8 => FieldType::I8,
            TypeTag::I16 => FieldType::I16,
            TypeTag::I32 => FieldType::I32,
            TypeTag::I64 => FieldType::I64,
            TypeTag::V64 => FieldType::V64,
            TypeTag::F32 => FieldType::F32,
            TypeTag::F64 => FieldType::F64,
            TypeTag::Str => FieldType::Str,
            TypeTag::ConstArray => {
                let len = s.read_v64()?;
                let len = u64::try_from(len)
                    .map_err(|_| SkillError::MalformedData("negative array length"))?;
                FieldType::ConstArray {
                    len,
                    ground: Box::new(Self::parse_ground(s, pool_count)?),
                }
            }
            TypeTag::VarArray => {
                FieldType::VarArray(Box::new(Self::parse_ground(s, pool_count)?))
            }
            TypeTag::List => FieldType::List(Box::new(Self::parse_ground(s, pool_count)?)),
            TypeTag::Set => FieldType::Set(Box::new(Self::parse_ground(s, pool_count)?)),
            TypeTag::Map => FieldType::Map {
                key: Box::new(Self::parse(s, pool_count)?),
                value: Box::new(Self::parse(s, pool_count)?),
            },
        })
    }

    /// Ground types of containers are plain type ids; compound and constant
    /// grounds are not permitted.
    fn parse_ground(
        s: &mut MappedInStream<'_>,
        pool_count: usize,
    ) -> Result<FieldType, SkillError> {
        let id = s.read_v64()?;
        if id >= FIRST_POOL_TYPE_ID {
            let pool = (id - FIRST_POOL_TYPE_ID) as usize;
            if pool >= pool_count {
                return Err(SkillError::InvalidPoolIndex {
                    index: id as u64,
                    size: pool_count,
                });
            }
            return Ok(FieldType::Ref(pool));
        }
        Ok(match id {
            5 => FieldType::Annotation,
            6 => FieldType::Bool,
            7 => FieldType::I8,
            8 => FieldType::I16,
            9 => FieldType::I32,
            10 => FieldType::I64,
            11 => FieldType::V64,
            12 => FieldType::F32,
            13 => FieldType::F64,
            14 => FieldType::Str,
            other => return Err(SkillError::InvalidFieldTag(other)),
        })
    }

    /// Encode this type's declaration into the schema stream.
    pub(crate) fn write_decl<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        use FieldType::*;
        match self {
            ConstI8(v) => {
                w.write_v64(0)?;
                w.write_i8(*v)
            }
            ConstI16(v) => {
                w.write_v64(1)?;
                w.write_i16::<BigEndian>(*v)
            }
            ConstI32(v) => {
                w.write_v64(2)?;
                w.write_i32::<BigEndian>(*v)
            }
            ConstI64(v) => {
                w.write_v64(3)?;
                w.write_i64::<BigEndian>(*v)
            }
            ConstV64(v) => {
                w.write_v64(4)?;
                w.write_v64(*v)
            }
            ConstArray { len, ground } => {
                w.write_v64(15)?;
                w.write_v64(*len as i64)?;
                w.write_v64(ground.type_id())
            }
            VarArray(ground) => {
                w.write_v64(17)?;
                w.write_v64(ground.type_id())
            }
            List(ground) => {
                w.write_v64(18)?;
                w.write_v64(ground.type_id())
            }
            Set(ground) => {
                w.write_v64(19)?;
                w.write_v64(ground.type_id())
            }
            Map { key, value } => {
                w.write_v64(20)?;
                key.write_decl(w)?;
                value.write_decl(w)
            }
            other => w.write_v64(other.type_id()),
        }
    }

    /// The value an object carries before any assignment.
    #[must_use]
    pub fn default_value(&self) -> FieldValue {
        use FieldType::*;
        match self {
            ConstI8(v) => FieldValue::I8(*v),
            ConstI16(v) => FieldValue::I16(*v),
            ConstI32(v) => FieldValue::I32(*v),
            ConstI64(v) | ConstV64(v) => FieldValue::I64(*v),
            Bool => FieldValue::Bool(false),
            I8 => FieldValue::I8(0),
            I16 => FieldValue::I16(0),
            I32 => FieldValue::I32(0),
            I64 | V64 => FieldValue::I64(0),
            F32 => FieldValue::F32(0.0),
            F64 => FieldValue::F64(0.0),
            Annotation | Str | Ref(_) => FieldValue::Null,
            ConstArray { len, ground } => {
                FieldValue::Array(vec![ground.default_value(); *len as usize])
            }
            VarArray(_) | List(_) => FieldValue::Array(Vec::new()),
            Set(_) => FieldValue::Set(Vec::new()),
            Map { .. } => FieldValue::Map(Vec::new()),
        }
    }

    /// True if a value of this type can transitively contain strings.
    #[must_use]
    pub(crate) fn contains_strings(&self) -> bool {
        use FieldType::*;
        match self {
            Str => true,
            ConstArray { ground, .. } | VarArray(ground) | List(ground) | Set(ground) => {
                ground.contains_strings()
            }
            Map { key, value } => key.contains_strings() || value.contains_strings(),
            _ => false,
        }
    }

    /// Feed every string inside `v` to `out`.
    pub(crate) fn collect_strings(&self, v: &FieldValue, out: &mut dyn FnMut(&Arc<str>)) {
        use FieldType::*;
        match (self, v) {
            (Str, FieldValue::Str(s)) => out(s),
            (ConstArray { ground, .. } | VarArray(ground) | List(ground), FieldValue::Array(xs)) => {
                for x in xs {
                    ground.collect_strings(x, out);
                }
            }
            (Set(ground), FieldValue::Set(xs)) => {
                for x in xs {
                    ground.collect_strings(x, out);
                }
            }
            (Map { key, value }, FieldValue::Map(pairs)) => {
                for (k, v) in pairs {
                    key.collect_strings(k, out);
                    value.collect_strings(v, out);
                }
            }
            _ => {}
        }
    }

    /// Decode one value of this type.
    pub(crate) fn read_value(
        &self,
        s: &mut MappedInStream<'_>,
        cx: &ReadCtx<'_>,
    ) -> Result<FieldValue, SkillError> {
        use FieldType::*;
        Ok(match self {
            ConstI8(v) => FieldValue::I8(*v),
            ConstI16(v) => FieldValue::I16(*v),
            ConstI32(v) => FieldValue::I32(*v),
            ConstI64(v) | ConstV64(v) => FieldValue::I64(*v),
            Bool => FieldValue::Bool(s.read_bool()?),
            I8 => FieldValue::I8(s.read_i8()?),
            I16 => FieldValue::I16(s.read_i16()?),
            I32 => FieldValue::I32(s.read_i32()?),
            I64 => FieldValue::I64(s.read_i64()?),
            V64 => FieldValue::I64(s.read_v64()?),
            F32 => FieldValue::F32(s.read_f32()?),
            F64 => FieldValue::F64(s.read_f64()?),
            Str => {
                let id = s.read_v64()? as u64;
                match cx.strings.get(id)? {
                    Some(string) => FieldValue::Str(string),
                    None => FieldValue::Null,
                }
            }
            Annotation => {
                let type_id = s.read_v64()?;
                let id = s.read_v64()?;
                if type_id == 0 {
                    FieldValue::Null
                } else {
                    let pool = type_id - 1;
                    if pool < 0 || pool as usize >= cx.pools.len() {
                        return Err(SkillError::InvalidPoolIndex {
                            index: type_id as u64,
                            size: cx.pools.len(),
                        });
                    }
                    match pools::get_by_id(cx.pools, pool as usize, id) {
                        Some(obj) => FieldValue::Ref(obj),
                        None => FieldValue::Null,
                    }
                }
            }
            Ref(pool) => {
                let id = s.read_v64()?;
                match pools::get_by_id(cx.pools, *pool, id) {
                    Some(obj) => FieldValue::Ref(obj),
                    None => FieldValue::Null,
                }
            }
            ConstArray { len, ground } => {
                let mut xs = Vec::with_capacity(*len as usize);
                for _ in 0..*len {
                    xs.push(ground.read_value(s, cx)?);
                }
                FieldValue::Array(xs)
            }
            VarArray(ground) | List(ground) => {
                let n = read_count(s)?;
                let mut xs = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    xs.push(ground.read_value(s, cx)?);
                }
                FieldValue::Array(xs)
            }
            Set(ground) => {
                let n = read_count(s)?;
                let mut xs = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    xs.push(ground.read_value(s, cx)?);
                }
                FieldValue::Set(xs)
            }
            Map { key, value } => {
                let n = read_count(s)?;
                let mut pairs = Vec::with_capacity(n.min(1 << 20));
                for _ in 0..n {
                    let k = key.read_value(s, cx)?;
                    let v = value.read_value(s, cx)?;
                    pairs.push((k, v));
                }
                FieldValue::Map(pairs)
            }
        })
    }

    /// Encode one value of this type; emits exactly [`FieldType::offset`]
    /// bytes.
    pub(crate) fn write_value<W: Write>(
        &self,
        v: &FieldValue,
        w: &mut W,
        cx: &WriteCtx<'_>,
    ) -> Result<(), SkillError> {
        use FieldType::*;
        match (self, v) {
            (ConstI8(_) | ConstI16(_) | ConstI32(_) | ConstI64(_) | ConstV64(_), _) => Ok(()),
            (Bool, FieldValue::Bool(b)) => Ok(w.write_u8(u8::from(*b))?),
            (I8, FieldValue::I8(x)) => Ok(w.write_i8(*x)?),
            (I16, FieldValue::I16(x)) => Ok(w.write_i16::<BigEndian>(*x)?),
            (I32, FieldValue::I32(x)) => Ok(w.write_i32::<BigEndian>(*x)?),
            (I64, FieldValue::I64(x)) => Ok(w.write_i64::<BigEndian>(*x)?),
            (V64, FieldValue::I64(x)) => Ok(w.write_v64(*x)?),
            (F32, FieldValue::F32(x)) => Ok(w.write_f32::<BigEndian>(*x)?),
            (F64, FieldValue::F64(x)) => Ok(w.write_f64::<BigEndian>(*x)?),
            (Str, FieldValue::Null) => Ok(w.write_v64(0)?),
            (Str, FieldValue::Str(string)) => {
                let id = string_id(cx, string)?;
                Ok(w.write_v64(id as i64)?)
            }
            (Annotation, FieldValue::Null) => {
                w.write_v64(0)?;
                Ok(w.write_v64(0)?)
            }
            (Annotation, FieldValue::Ref(obj)) => {
                let type_id = cx.pools[obj.pool()].type_id - FIRST_POOL_TYPE_ID + 1;
                w.write_v64(type_id)?;
                Ok(w.write_v64(obj.skill_id())?)
            }
            (Ref(_), FieldValue::Null) => Ok(w.write_v64(0)?),
            (Ref(_), FieldValue::Ref(obj)) => Ok(w.write_v64(obj.skill_id())?),
            (ConstArray { len, ground }, FieldValue::Array(xs)) => {
                if xs.len() as u64 != *len {
                    return Err(SkillError::WrongConstantLength {
                        expected: *len,
                        actual: xs.len(),
                    });
                }
                for x in xs {
                    ground.write_value(x, w, cx)?;
                }
                Ok(())
            }
            (VarArray(_) | List(_), FieldValue::Null) => Ok(w.write_v64(0)?),
            (VarArray(ground) | List(ground), FieldValue::Array(xs)) => {
                w.write_v64(xs.len() as i64)?;
                for x in xs {
                    ground.write_value(x, w, cx)?;
                }
                Ok(())
            }
            (Set(_), FieldValue::Null) => Ok(w.write_v64(0)?),
            (Set(ground), FieldValue::Set(xs)) => {
                w.write_v64(xs.len() as i64)?;
                for x in xs {
                    ground.write_value(x, w, cx)?;
                }
                Ok(())
            }
            (Map { .. }, FieldValue::Null) => Ok(w.write_v64(0)?),
            (Map { key, value }, FieldValue::Map(pairs)) => {
                w.write_v64(pairs.len() as i64)?;
                for (k, v) in pairs {
                    key.write_value(k, w, cx)?;
                    value.write_value(v, w, cx)?;
                }
                Ok(())
            }
            _ => Err(SkillError::TypeMismatch {
                expected: self.type_name(),
            }),
        }
    }

    /// Number of bytes [`FieldType::write_value`] will emit for `v`.
    pub(crate) fn offset(&self, v: &FieldValue, cx: &WriteCtx<'_>) -> Result<u64, SkillError> {
        use FieldType::*;
        match (self, v) {
            (ConstI8(_) | ConstI16(_) | ConstI32(_) | ConstI64(_) | ConstV64(_), _) => Ok(0),
            (Bool, FieldValue::Bool(_)) | (I8, FieldValue::I8(_)) => Ok(1),
            (I16, FieldValue::I16(_)) => Ok(2),
            (I32, FieldValue::I32(_)) | (F32, FieldValue::F32(_)) => Ok(4),
            (I64, FieldValue::I64(_)) | (F64, FieldValue::F64(_)) => Ok(8),
            (V64, FieldValue::I64(x)) => Ok(v64_len(*x)),
            (Str, FieldValue::Null) => Ok(1),
            (Str, FieldValue::Str(string)) => Ok(v64_len(string_id(cx, string)? as i64)),
            (Annotation, FieldValue::Null) => Ok(2),
            (Annotation, FieldValue::Ref(obj)) => {
                let type_id = cx.pools[obj.pool()].type_id - FIRST_POOL_TYPE_ID + 1;
                Ok(v64_len(type_id) + v64_len(obj.skill_id()))
            }
            (Ref(_), FieldValue::Null) => Ok(1),
            (Ref(_), FieldValue::Ref(obj)) => Ok(v64_len(obj.skill_id())),
            (ConstArray { len, ground }, FieldValue::Array(xs)) => {
                if xs.len() as u64 != *len {
                    return Err(SkillError::WrongConstantLength {
                        expected: *len,
                        actual: xs.len(),
                    });
                }
                let mut sum = 0;
                for x in xs {
                    sum += ground.offset(x, cx)?;
                }
                Ok(sum)
            }
            (VarArray(_) | List(_) | Set(_) | Map { .. }, FieldValue::Null) => Ok(1),
            (VarArray(ground) | List(ground), FieldValue::Array(xs)) => {
                let mut sum = v64_len(xs.len() as i64);
                for x in xs {
                    sum += ground.offset(x, cx)?;
                }
                Ok(sum)
            }
            (Set(ground), FieldValue::Set(xs)) => {
                let mut sum = v64_len(xs.len() as i64);
                for x in xs {
                    sum += ground.offset(x, cx)?;
                }
                Ok(sum)
            }
            (Map { key, value }, FieldValue::Map(pairs)) => {
                let mut sum = v64_len(pairs.len() as i64);
                for (k, v) in pairs {
                    sum += key.offset(k, cx)?;
                    sum += value.offset(v, cx)?;
                }
                Ok(sum)
            }
            _ => Err(SkillError::TypeMismatch {
                expected: self.type_name(),
            }),
        }
    }

    fn type_name(&self) -> &'static str {
        use FieldType::*;
        match self {
            ConstI8(_) | ConstI16(_) | ConstI32(_) | ConstI64(_) | ConstV64(_) => "constant",
            Annotation => "annotation",
            Bool => "bool",
            I8 => "i8",
            I16 => "i16",
            I32 => "i32",
            I64 => "i64",
            V64 => "v64",
            F32 => "f32",
            F64 => "f64",
            Str => "string",
            ConstArray { .. } => "constant length array",
            VarArray(_) => "array",
            List(_) => "list",
            Set(_) => "set",
            Map { .. } => "map",
            Ref(_) => "reference",
        }
    }
}

fn read_count(s: &mut MappedInStream<'_>) -> Result<usize, SkillError> {
    let n = s.read_v64()?;
    usize::try_from(n).map_err(|_| SkillError::MalformedData("negative collection length"))
}

fn string_id(cx: &WriteCtx<'_>, s: &Arc<str>) -> Result<u64, SkillError> {
    cx.string_ids
        .get(s)
        .copied()
        .ok_or(SkillError::MalformedData("string missing from the id table"))
}
