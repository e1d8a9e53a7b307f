//! N-dimensional array views over block payloads.
//!
//! An [`NdArray`] is a typed view `{handle, dtype, shape, strides, byte
//! offset, byteorder}` into a shared payload buffer.  The handle owns the
//! bytes; any number of views may share one handle, and they all share one
//! binary block.  Mapping arrays to blocks uses the handle's pointer
//! identity, never value equality, so equal-looking arrays in different
//! buffers stay in separate blocks.
//!
//! Views created from a lazily loaded file materialize the payload on
//! first element access; after the owning engine is closed that access
//! fails with `NotOpen`.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::block::{BlockBody, Handle};
use crate::error::{AsdfError, Result};

// ── Dtypes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dtype {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float32,
    Float64,
}

impl Dtype {
    pub fn itemsize(self) -> usize {
        match self {
            Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Int16 | Dtype::Uint16 => 2,
            Dtype::Int32 | Dtype::Uint32 | Dtype::Float32 => 4,
            Dtype::Int64 | Dtype::Uint64 | Dtype::Float64 => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Dtype::Int8 => "int8",
            Dtype::Uint8 => "uint8",
            Dtype::Int16 => "int16",
            Dtype::Uint16 => "uint16",
            Dtype::Int32 => "int32",
            Dtype::Uint32 => "uint32",
            Dtype::Int64 => "int64",
            Dtype::Uint64 => "uint64",
            Dtype::Float32 => "float32",
            Dtype::Float64 => "float64",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Ok(match name {
            "int8" => Dtype::Int8,
            "uint8" => Dtype::Uint8,
            "int16" => Dtype::Int16,
            "uint16" => Dtype::Uint16,
            "int32" => Dtype::Int32,
            "uint32" => Dtype::Uint32,
            "int64" => Dtype::Int64,
            "uint64" => Dtype::Uint64,
            "float32" => Dtype::Float32,
            "float64" => Dtype::Float64,
            other => return Err(AsdfError::BadType(format!("unknown datatype {other:?}"))),
        })
    }

    pub fn is_float(self) -> bool {
        matches!(self, Dtype::Float32 | Dtype::Float64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn name(self) -> &'static str {
        match self {
            Endian::Little => "little",
            Endian::Big => "big",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "little" => Ok(Endian::Little),
            "big" => Ok(Endian::Big),
            other => Err(AsdfError::BadType(format!("unknown byteorder {other:?}"))),
        }
    }
}

// ── NdArray ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct NdArray {
    handle: Handle,
    dtype: Dtype,
    shape: Vec<usize>,
    /// Byte strides per dimension; `None` means C-contiguous.
    strides: Option<Vec<usize>>,
    /// Byte offset of the first element within the handle's buffer.
    offset: usize,
    byteorder: Endian,
}

impl std::fmt::Debug for NdArray {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NdArray")
            .field("dtype", &self.dtype.name())
            .field("shape", &self.shape)
            .field("strides", &self.strides)
            .field("offset", &self.offset)
            .finish()
    }
}

impl NdArray {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Build an array over its own freshly materialized buffer.
    pub fn from_bytes(dtype: Dtype, shape: Vec<usize>, bytes: Vec<u8>) -> Result<Self> {
        let expected: usize = shape.iter().product::<usize>() * dtype.itemsize();
        if bytes.len() != expected {
            return Err(AsdfError::BadType(format!(
                "buffer is {} bytes, shape {:?} of {} needs {}",
                bytes.len(),
                shape,
                dtype.name(),
                expected
            )));
        }
        Ok(Self {
            handle: BlockBody::materialized(bytes),
            dtype,
            shape,
            strides: None,
            offset: 0,
            byteorder: Endian::Little,
        })
    }

    pub fn from_vec_i64(values: &[i64]) -> Self {
        let mut bytes = vec![0u8; values.len() * 8];
        LittleEndian::write_i64_into(values, &mut bytes);
        Self::from_bytes(Dtype::Int64, vec![values.len()], bytes).unwrap()
    }

    pub fn from_vec_f64(values: &[f64]) -> Self {
        let mut bytes = vec![0u8; values.len() * 8];
        LittleEndian::write_f64_into(values, &mut bytes);
        Self::from_bytes(Dtype::Float64, vec![values.len()], bytes).unwrap()
    }

    pub fn from_vec_u8(values: &[u8]) -> Self {
        Self::from_bytes(Dtype::Uint8, vec![values.len()], values.to_vec()).unwrap()
    }

    /// Rebind a view onto an existing handle (used when reading a file).
    pub(crate) fn from_parts(
        handle: Handle,
        dtype: Dtype,
        shape: Vec<usize>,
        strides: Option<Vec<usize>>,
        offset: usize,
        byteorder: Endian,
    ) -> Self {
        Self {
            handle,
            dtype,
            shape,
            strides,
            offset,
            byteorder,
        }
    }

    /// A view over the same buffer with an explicit geometry.
    ///
    /// `byte_offset` is relative to this view's start.
    pub fn view(&self, byte_offset: usize, shape: Vec<usize>, strides: Option<Vec<usize>>) -> Self {
        Self {
            handle: Rc::clone(&self.handle),
            dtype: self.dtype,
            shape,
            strides,
            offset: self.offset + byte_offset,
            byteorder: self.byteorder,
        }
    }

    /// Contiguous 1-D sub-slice, `[start, end)` in elements.
    pub fn slice(&self, start: usize, end: usize) -> Self {
        self.view(start * self.dtype.itemsize(), vec![end - start], None)
    }

    /// Strided 1-D view taking every `step`-th element.
    pub fn step_by(&self, step: usize) -> Self {
        let n = self.shape.first().copied().unwrap_or(0);
        let count = (n + step - 1) / step.max(1);
        self.view(
            0,
            vec![count],
            Some(vec![self.dtype.itemsize() * step]),
        )
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Pointer identity of the underlying buffer.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.handle) as usize
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn strides(&self) -> Option<&[usize]> {
        self.strides.as_deref()
    }

    pub fn byte_offset(&self) -> usize {
        self.offset
    }

    pub fn byteorder(&self) -> Endian {
        self.byteorder
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_contiguous(&self) -> bool {
        match &self.strides {
            None => true,
            Some(s) => *s == Self::default_strides(&self.shape, self.dtype.itemsize()),
        }
    }

    pub(crate) fn default_strides(shape: &[usize], itemsize: usize) -> Vec<usize> {
        let mut strides = vec![itemsize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    fn effective_strides(&self) -> Vec<usize> {
        self.strides
            .clone()
            .unwrap_or_else(|| Self::default_strides(&self.shape, self.dtype.itemsize()))
    }

    /// Byte offset of the element at `index` within the handle's buffer.
    fn element_offset(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.shape.len() {
            return Err(AsdfError::BadType(format!(
                "index rank {} against shape {:?}",
                index.len(),
                self.shape
            )));
        }
        let strides = self.effective_strides();
        let mut off = self.offset;
        for (d, &i) in index.iter().enumerate() {
            if i >= self.shape[d] {
                return Err(AsdfError::NotFound(format!(
                    "index {i} out of bounds for axis {d} (size {})",
                    self.shape[d]
                )));
            }
            off += i * strides[d];
        }
        Ok(off)
    }

    // ── Element and buffer access ────────────────────────────────────────────

    fn read_raw(&self, off: usize) -> Result<u64> {
        let size = self.dtype.itemsize();
        let mut body = self.handle.borrow_mut();
        let bytes = body.bytes()?;
        let chunk = bytes
            .get(off..off + size)
            .ok_or_else(|| AsdfError::NotFound(format!("byte offset {off} beyond buffer")))?;
        Ok(match (size, self.byteorder) {
            (1, _) => chunk[0] as u64,
            (2, Endian::Little) => LittleEndian::read_u16(chunk) as u64,
            (2, Endian::Big) => BigEndian::read_u16(chunk) as u64,
            (4, Endian::Little) => LittleEndian::read_u32(chunk) as u64,
            (4, Endian::Big) => BigEndian::read_u32(chunk) as u64,
            (8, Endian::Little) => LittleEndian::read_u64(chunk),
            (8, Endian::Big) => BigEndian::read_u64(chunk),
            _ => unreachable!(),
        })
    }

    fn write_raw(&self, off: usize, raw: u64) -> Result<()> {
        let size = self.dtype.itemsize();
        let mut body = self.handle.borrow_mut();
        let bytes = body.bytes_mut()?;
        let chunk = bytes
            .get_mut(off..off + size)
            .ok_or_else(|| AsdfError::NotFound(format!("byte offset {off} beyond buffer")))?;
        match (size, self.byteorder) {
            (1, _) => chunk[0] = raw as u8,
            (2, Endian::Little) => LittleEndian::write_u16(chunk, raw as u16),
            (2, Endian::Big) => BigEndian::write_u16(chunk, raw as u16),
            (4, Endian::Little) => LittleEndian::write_u32(chunk, raw as u32),
            (4, Endian::Big) => BigEndian::write_u32(chunk, raw as u32),
            (8, Endian::Little) => LittleEndian::write_u64(chunk, raw),
            (8, Endian::Big) => BigEndian::write_u64(chunk, raw),
            _ => unreachable!(),
        }
        Ok(())
    }

    fn raw_to_i64(&self, raw: u64) -> i64 {
        match self.dtype {
            Dtype::Int8 => raw as u8 as i8 as i64,
            Dtype::Int16 => raw as u16 as i16 as i64,
            Dtype::Int32 => raw as u32 as i32 as i64,
            _ => raw as i64,
        }
    }

    pub fn get_i64(&self, index: &[usize]) -> Result<i64> {
        if self.dtype.is_float() {
            return Err(AsdfError::BadType(format!(
                "integer access on {} array",
                self.dtype.name()
            )));
        }
        let off = self.element_offset(index)?;
        Ok(self.raw_to_i64(self.read_raw(off)?))
    }

    pub fn set_i64(&self, index: &[usize], value: i64) -> Result<()> {
        let off = self.element_offset(index)?;
        self.write_raw(off, value as u64)
    }

    pub fn get_f64(&self, index: &[usize]) -> Result<f64> {
        let off = self.element_offset(index)?;
        let raw = self.read_raw(off)?;
        Ok(match self.dtype {
            Dtype::Float32 => f32::from_bits(raw as u32) as f64,
            Dtype::Float64 => f64::from_bits(raw),
            _ => self.raw_to_i64(raw) as f64,
        })
    }

    pub fn set_f64(&self, index: &[usize], value: f64) -> Result<()> {
        let off = self.element_offset(index)?;
        let raw = match self.dtype {
            Dtype::Float32 => (value as f32).to_bits() as u64,
            Dtype::Float64 => value.to_bits(),
            _ => value as i64 as u64,
        };
        self.write_raw(off, raw)
    }

    /// Gather this view's elements into a contiguous byte vector.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let itemsize = self.dtype.itemsize();
        let total = self.element_count() * itemsize;
        let mut body = self.handle.borrow_mut();
        let bytes = body.bytes()?;

        if self.is_contiguous() {
            let end = self.offset + total;
            return bytes
                .get(self.offset..end)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| AsdfError::NotFound("view extends beyond buffer".into()));
        }

        if total == 0 {
            return Ok(Vec::new());
        }
        let strides = self.effective_strides();
        let mut out = Vec::with_capacity(total);
        let mut index = vec![0usize; self.shape.len()];
        'gather: loop {
            let mut off = self.offset;
            for (d, &i) in index.iter().enumerate() {
                off += i * strides[d];
            }
            let chunk = bytes
                .get(off..off + itemsize)
                .ok_or_else(|| AsdfError::NotFound("view extends beyond buffer".into()))?;
            out.extend_from_slice(chunk);
            // Odometer increment over the shape.
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    continue 'gather;
                }
                index[d] = 0;
            }
            break;
        }
        Ok(out)
    }

    pub fn to_vec_i64(&self) -> Result<Vec<i64>> {
        let mut out = Vec::with_capacity(self.element_count());
        self.for_each_flat(|arr, idx| {
            out.push(arr.get_i64(idx)?);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn to_vec_f64(&self) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.element_count());
        self.for_each_flat(|arr, idx| {
            out.push(arr.get_f64(idx)?);
            Ok(())
        })?;
        Ok(out)
    }

    fn for_each_flat(
        &self,
        mut f: impl FnMut(&NdArray, &[usize]) -> Result<()>,
    ) -> Result<()> {
        if self.shape.iter().any(|&n| n == 0) {
            return Ok(());
        }
        let mut index = vec![0usize; self.shape.len()];
        if self.shape.is_empty() {
            return f(self, &index);
        }
        'iter: loop {
            f(self, &index)?;
            for d in (0..index.len()).rev() {
                index[d] += 1;
                if index[d] < self.shape[d] {
                    continue 'iter;
                }
                index[d] = 0;
            }
            break;
        }
        Ok(())
    }

    /// Deep copy with a private buffer, dropping any block association.
    pub fn deep_copy(&self) -> Result<NdArray> {
        let bytes = self.to_bytes()?;
        NdArray::from_bytes(self.dtype, self.shape.clone(), bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_round_trip() {
        let values: Vec<i64> = (0..10).collect();
        let arr = NdArray::from_vec_i64(&values);
        assert_eq!(arr.to_vec_i64().unwrap(), values);
        assert!(arr.is_contiguous());
    }

    #[test]
    fn slice_shares_buffer() {
        let base = NdArray::from_vec_i64(&(0..10).collect::<Vec<_>>());
        let sub = base.slice(3, 7);
        assert_eq!(sub.identity(), base.identity());
        assert_eq!(sub.to_vec_i64().unwrap(), vec![3, 4, 5, 6]);
    }

    #[test]
    fn strided_view_gathers() {
        let base = NdArray::from_vec_i64(&(0..10).collect::<Vec<_>>());
        let skip = base.step_by(2);
        assert_eq!(skip.to_vec_i64().unwrap(), vec![0, 2, 4, 6, 8]);
        assert!(!skip.is_contiguous());
    }

    #[test]
    fn mutation_through_view_is_shared() {
        let base = NdArray::from_vec_i64(&[1, 2, 3, 4]);
        let sub = base.slice(2, 4);
        sub.set_i64(&[0], 99).unwrap();
        assert_eq!(base.to_vec_i64().unwrap(), vec![1, 2, 99, 4]);
    }

    #[test]
    fn multidim_indexing() {
        let bytes: Vec<u8> = (0..64).flat_map(|v: i64| v.to_le_bytes()).collect();
        let arr = NdArray::from_bytes(Dtype::Int64, vec![8, 8], bytes).unwrap();
        assert_eq!(arr.get_i64(&[7, 7]).unwrap(), 63);
        assert_eq!(arr.get_i64(&[1, 2]).unwrap(), 10);
        assert!(arr.get_i64(&[8, 0]).is_err());
    }

    #[test]
    fn deep_copy_detaches() {
        let base = NdArray::from_vec_i64(&[1, 2, 3]);
        let copy = base.deep_copy().unwrap();
        assert_ne!(copy.identity(), base.identity());
        copy.set_i64(&[0], 42).unwrap();
        assert_eq!(base.get_i64(&[0]).unwrap(), 1);
    }
}
