//! Simulated global memory
//!
//! Buffers are flat byte arrays behind a lock, addressed by opaque
//! handles. Kernels see typed element views; a high-water mark per buffer
//! records the furthest byte ever written, which is how workspace sizing
//! is checked against real usage.

use crate::element::Element;
use crate::error::{GemmError, GemmResult};
use parking_lot::RwLock;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Opaque reference to an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    id: usize,
    bytes: usize,
}

impl BufferHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// The whole buffer as a region
    pub fn region(&self) -> Region {
        Region {
            handle: *self,
            offset: 0,
            bytes: self.bytes,
        }
    }
}

/// A byte range inside a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Region {
    pub handle: BufferHandle,
    pub offset: usize,
    pub bytes: usize,
}

impl Region {
    pub fn end(&self) -> usize {
        self.offset + self.bytes
    }

    pub fn overlaps(&self, other: &Region) -> bool {
        self.handle == other.handle && self.offset < other.end() && other.offset < self.end()
    }

    /// First element index of this region for elements of `E`
    pub fn base<E: Element>(&self) -> usize {
        self.offset / E::size()
    }

    /// Sub-region starting `offset` bytes in
    pub fn slice(&self, offset: usize, bytes: usize) -> Region {
        Region {
            handle: self.handle,
            offset: self.offset + offset,
            bytes,
        }
    }
}

/// Allocation interface
pub trait Allocator {
    fn allocate(&self, bytes: usize) -> BufferHandle;

    fn release(&self, handle: BufferHandle) -> GemmResult<()>;
}

#[derive(Debug)]
struct Buffer {
    data: RwLock<Vec<u8>>,
    high_water: AtomicUsize,
}

/// All buffers of one simulated device
#[derive(Debug, Default)]
pub struct DeviceMemory {
    buffers: RwLock<Vec<Option<Arc<Buffer>>>>,
}

/// Read-only typed view, valid while the buffer lock is held
pub struct Elements<'a, E> {
    bytes: &'a [u8],
    _element: PhantomData<E>,
}

impl<E: Element> Elements<'_, E> {
    #[inline]
    pub fn get(&self, index: usize) -> E {
        let size = E::size();
        E::read_le(&self.bytes[index * size..(index + 1) * size])
    }
}

/// Mutable typed view, valid while the buffer lock is held
pub struct ElementsMut<'a, E> {
    bytes: &'a mut [u8],
    high: usize,
    _element: PhantomData<E>,
}

impl<E: Element> ElementsMut<'_, E> {
    #[inline]
    pub fn get(&self, index: usize) -> E {
        let size = E::size();
        E::read_le(&self.bytes[index * size..(index + 1) * size])
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: E) {
        let size = E::size();
        let end = (index + 1) * size;
        value.write_le(&mut self.bytes[index * size..end]);
        self.high = self.high.max(end);
    }
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self, handle: BufferHandle) -> Arc<Buffer> {
        // Device-side access has no error channel; a stale handle is a bug.
        match self.buffers.read().get(handle.id) {
            Some(Some(buffer)) => Arc::clone(buffer),
            _ => panic!("access to released or foreign buffer {}", handle.id),
        }
    }

    fn checked_buffer(&self, handle: BufferHandle) -> GemmResult<Arc<Buffer>> {
        match self.buffers.read().get(handle.id) {
            Some(Some(buffer)) => Ok(Arc::clone(buffer)),
            _ => Err(GemmError::buffer(handle.id, "not allocated")),
        }
    }

    /// Copy host elements into a fresh buffer
    pub fn upload<E: Element>(&self, data: &[E]) -> BufferHandle {
        let handle = self.allocate(data.len() * E::size());
        let buffer = self.buffer(handle);
        let mut bytes = buffer.data.write();
        for (i, value) in data.iter().enumerate() {
            value.write_le(&mut bytes[i * E::size()..]);
        }
        handle
    }

    pub fn upload_bytes(&self, data: &[u8]) -> BufferHandle {
        let handle = self.allocate(data.len());
        self.buffer(handle).data.write().copy_from_slice(data);
        handle
    }

    /// Copy `count` elements out of a buffer
    pub fn download<E: Element>(&self, handle: BufferHandle, count: usize) -> GemmResult<Vec<E>> {
        let buffer = self.checked_buffer(handle)?;
        let bytes = buffer.data.read();
        if count * E::size() > bytes.len() {
            return Err(GemmError::buffer(
                handle.id,
                format!("{count} {} elements exceed {} bytes", E::DTYPE, bytes.len()),
            ));
        }
        Ok((0..count).map(|i| E::read_le(&bytes[i * E::size()..])).collect())
    }

    pub fn download_bytes(&self, handle: BufferHandle) -> GemmResult<Vec<u8>> {
        Ok(self.checked_buffer(handle)?.data.read().clone())
    }

    /// Run `f` with a read view of the buffer
    pub fn read<E: Element, R>(&self, handle: BufferHandle, f: impl FnOnce(&Elements<'_, E>) -> R) -> R {
        let buffer = self.buffer(handle);
        let bytes = buffer.data.read();
        f(&Elements {
            bytes: &bytes,
            _element: PhantomData,
        })
    }

    /// Run `f` with a write view of the buffer
    pub fn write<E: Element, R>(&self, handle: BufferHandle, f: impl FnOnce(&mut ElementsMut<'_, E>) -> R) -> R {
        let buffer = self.buffer(handle);
        let mut bytes = buffer.data.write();
        let mut view = ElementsMut {
            bytes: &mut bytes,
            high: 0,
            _element: PhantomData,
        };
        let result = f(&mut view);
        buffer.high_water.fetch_max(view.high, Ordering::Relaxed);
        result
    }

    /// Furthest byte written by device code (host uploads excluded)
    pub fn high_water(&self, handle: BufferHandle) -> GemmResult<usize> {
        Ok(self.checked_buffer(handle)?.high_water.load(Ordering::Relaxed))
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.read().iter().filter(|b| b.is_some()).count()
    }
}

impl Allocator for DeviceMemory {
    fn allocate(&self, bytes: usize) -> BufferHandle {
        let buffer = Arc::new(Buffer {
            data: RwLock::new(vec![0u8; bytes]),
            high_water: AtomicUsize::new(0),
        });
        let mut buffers = self.buffers.write();
        let id = buffers.len();
        buffers.push(Some(buffer));
        trace!(id, bytes, "allocate");
        BufferHandle { id, bytes }
    }

    fn release(&self, handle: BufferHandle) -> GemmResult<()> {
        let mut buffers = self.buffers.write();
        match buffers.get_mut(handle.id) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(GemmError::buffer(handle.id, "double release")),
        }
    }
}
