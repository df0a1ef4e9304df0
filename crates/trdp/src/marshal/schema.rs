// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dataset schema model.
//!
//! A dataset is an ordered list of elements; an element is a primitive
//! type code (1..16) or a nested dataset reference (id >= 1000), with a
//! fixed repetition count or 0 for "dynamic" (count decided on the wire).

use crate::api::{Error, Result};

/// Primitive element type codes, wire values 1..16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCode {
    /// 8-bit boolean (zero = false).
    Bool8 = 1,
    /// 8-bit character, usable as UTF-8 octet.
    Char8 = 2,
    /// UTF-16 code unit.
    Utf16 = 3,
    /// Signed 8-bit integer.
    Int8 = 4,
    /// Signed 16-bit integer.
    Int16 = 5,
    /// Signed 32-bit integer.
    Int32 = 6,
    /// Signed 64-bit integer.
    Int64 = 7,
    /// Unsigned 8-bit integer.
    UInt8 = 8,
    /// Unsigned 16-bit integer.
    UInt16 = 9,
    /// Unsigned 32-bit integer.
    UInt32 = 10,
    /// Unsigned 64-bit integer.
    UInt64 = 11,
    /// IEEE 754 single.
    Real32 = 12,
    /// IEEE 754 double.
    Real64 = 13,
    /// 32-bit UNIX time.
    TimeDate32 = 14,
    /// 32-bit seconds + 16-bit ticks (TCN time).
    TimeDate48 = 15,
    /// 32-bit seconds + 32-bit microseconds.
    TimeDate64 = 16,
}

impl TypeCode {
    /// Decode a wire type code.
    pub fn from_u32(v: u32) -> Option<TypeCode> {
        Some(match v {
            1 => TypeCode::Bool8,
            2 => TypeCode::Char8,
            3 => TypeCode::Utf16,
            4 => TypeCode::Int8,
            5 => TypeCode::Int16,
            6 => TypeCode::Int32,
            7 => TypeCode::Int64,
            8 => TypeCode::UInt8,
            9 => TypeCode::UInt16,
            10 => TypeCode::UInt32,
            11 => TypeCode::UInt64,
            12 => TypeCode::Real32,
            13 => TypeCode::Real64,
            14 => TypeCode::TimeDate32,
            15 => TypeCode::TimeDate48,
            16 => TypeCode::TimeDate64,
            _ => return None,
        })
    }

    /// Octets one value occupies on the wire.
    pub fn wire_width(self) -> usize {
        match self {
            TypeCode::Bool8 | TypeCode::Char8 | TypeCode::Int8 | TypeCode::UInt8 => 1,
            TypeCode::Utf16 | TypeCode::Int16 | TypeCode::UInt16 => 2,
            TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::Real32
            | TypeCode::TimeDate32 => 4,
            TypeCode::TimeDate48 => 6,
            TypeCode::Int64 | TypeCode::UInt64 | TypeCode::Real64 | TypeCode::TimeDate64 => 8,
        }
    }

    /// Natural alignment of the host representation.
    pub fn host_align(self) -> usize {
        match self {
            TypeCode::Bool8 | TypeCode::Char8 | TypeCode::Int8 | TypeCode::UInt8 => 1,
            TypeCode::Utf16 | TypeCode::Int16 | TypeCode::UInt16 => 2,
            // TimeDate48/64 are (u32, u16/u32) pairs: alignment of the first
            TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::Real32
            | TypeCode::TimeDate32
            | TypeCode::TimeDate48
            | TypeCode::TimeDate64 => 4,
            TypeCode::Int64 | TypeCode::UInt64 | TypeCode::Real64 => 8,
        }
    }

    /// Octets one value occupies in host memory (padding included).
    pub fn host_size(self) -> usize {
        match self {
            // (u32 seconds, u16 ticks) rounds up to 8
            TypeCode::TimeDate48 => 8,
            other => other.wire_width(),
        }
    }
}

/// What an element contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// A primitive value.
    Primitive(TypeCode),
    /// A nested dataset by id (>= 1000).
    Dataset(u32),
}

/// One schema element.
#[derive(Debug, Clone)]
pub struct Element {
    /// Primitive code or nested dataset reference.
    pub ty: ElementType,
    /// Fixed repetition count, or 0 for dynamic.
    pub size: u32,
    /// Display scale factor; not part of the wire form.
    pub scale: f32,
    /// Display offset; not part of the wire form.
    pub offset: i32,
}

impl Element {
    /// A single fixed primitive value.
    pub fn primitive(ty: TypeCode) -> Self {
        Element {
            ty: ElementType::Primitive(ty),
            size: 1,
            scale: 1.0,
            offset: 0,
        }
    }

    /// A fixed-size primitive array.
    pub fn array(ty: TypeCode, size: u32) -> Self {
        Element {
            ty: ElementType::Primitive(ty),
            size,
            scale: 1.0,
            offset: 0,
        }
    }

    /// A dynamic primitive array (u16 count prefix on the wire; strings
    /// instead scan to their zero terminator).
    pub fn dynamic(ty: TypeCode) -> Self {
        Element {
            ty: ElementType::Primitive(ty),
            size: 0,
            scale: 1.0,
            offset: 0,
        }
    }

    /// A nested dataset occurring `size` times (0 = dynamic).
    pub fn nested(dataset_id: u32, size: u32) -> Self {
        Element {
            ty: ElementType::Dataset(dataset_id),
            size,
            scale: 1.0,
            offset: 0,
        }
    }
}

/// An ordered dataset schema.
#[derive(Debug, Clone)]
pub struct Dataset {
    /// Dataset id (>= 1000; the id space is shared with ComIDs).
    pub id: u32,
    /// Human-readable name from the configuration collaborator.
    pub name: String,
    /// Elements in wire order.
    pub elements: Vec<Element>,
}

impl Dataset {
    /// Validate the basic shape of a schema definition.
    pub fn validate(&self) -> Result<()> {
        if self.id < 1000 {
            return Err(Error::Param(format!("dataset id {} is reserved", self.id)));
        }
        if self.elements.is_empty() {
            return Err(Error::Param(format!("dataset {} has no elements", self.id)));
        }
        for el in &self.elements {
            if let ElementType::Dataset(id) = el.ty {
                if id < 1000 {
                    return Err(Error::Param(format!(
                        "dataset {} references reserved id {}",
                        self.id, id
                    )));
                }
            }
        }
        Ok(())
    }
}
