//! Caller-owned host buffers shared with the runtime
//!
//! A [`Buffer`] is a cheaply clonable handle; all clones refer to the same
//! bytes and share one [`BufferId`], which is what the device memory-mapping
//! table keys on. The length is fixed at creation.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{AccelError, AccelResult};

/// Identity of a buffer, stable for the lifetime of its allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct BufferInner {
    len: usize,
    data: RwLock<Box<[u8]>>,
}

/// Shared byte buffer backing tensors
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl Buffer {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                len: bytes.len(),
                data: RwLock::new(bytes.into_boxed_slice()),
            }),
        }
    }

    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    pub fn from_i8(values: &[i8]) -> Self {
        Self::new(values.iter().map(|v| *v as u8).collect())
    }

    pub fn from_i16(values: &[i16]) -> Self {
        let mut bytes = vec![0u8; values.len() * 2];
        LittleEndian::write_i16_into(values, &mut bytes);
        Self::new(bytes)
    }

    pub fn from_i32(values: &[i32]) -> Self {
        let mut bytes = vec![0u8; values.len() * 4];
        LittleEndian::write_i32_into(values, &mut bytes);
        Self::new(bytes)
    }

    /// Compound bias elements: `(bias, multiplier)` pairs
    pub fn from_compound_bias(values: &[(i32, u8)]) -> Self {
        let mut bytes = vec![0u8; values.len() * 8];
        for (chunk, (bias, multiplier)) in bytes.chunks_exact_mut(8).zip(values) {
            LittleEndian::write_i32(&mut chunk[..4], *bias);
            chunk[4] = *multiplier;
        }
        Self::new(bytes)
    }

    pub fn id(&self) -> BufferId {
        BufferId(Arc::as_ptr(&self.inner) as usize)
    }

    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn same_as(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Shared read access, blocking while a kernel writes
    pub fn read(&self) -> AccelResult<RwLockReadGuard<'_, Box<[u8]>>> {
        Ok(self.inner.data.read()?)
    }

    /// Exclusive write access, blocking while readers hold the buffer
    pub fn write(&self) -> AccelResult<RwLockWriteGuard<'_, Box<[u8]>>> {
        Ok(self.inner.data.write()?)
    }

    /// Exclusive write access that fails instead of blocking
    ///
    /// Kernels take their operands for reading first, so an output buffer
    /// that aliases an operand is reported here rather than deadlocking.
    pub fn try_write(&self) -> AccelResult<RwLockWriteGuard<'_, Box<[u8]>>> {
        match self.inner.data.try_write() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::WouldBlock) => Err(AccelError::BufferAccess(format!(
                "buffer {} is in use; output may alias an operand",
                self.id()
            ))),
            Err(TryLockError::Poisoned(e)) => Err(e.into()),
        }
    }

    pub fn to_vec(&self) -> AccelResult<Vec<u8>> {
        Ok(self.read()?.to_vec())
    }

    pub fn to_i32_vec(&self) -> AccelResult<Vec<i32>> {
        let data = self.read()?;
        let mut out = vec![0i32; data.len() / 4];
        LittleEndian::read_i32_into(&data[..out.len() * 4], &mut out);
        Ok(out)
    }

    pub fn to_i16_vec(&self) -> AccelResult<Vec<i16>> {
        let data = self.read()?;
        let mut out = vec![0i16; data.len() / 2];
        LittleEndian::read_i16_into(&data[..out.len() * 2], &mut out);
        Ok(out)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id())
            .field("len", &self.len())
            .finish()
    }
}
