use crate::{Error, Result};
use bytemuck::Pod;
use std::marker::PhantomData;
use wgpu::util::{BufferInitDescriptor, DeviceExt};
use wgpu::{Buffer, BufferAddress, BufferDescriptor, BufferUsages, CommandEncoder, Device, Queue};

/// A typed, linear, device-resident buffer of `T`.
///
/// The element count and stride are known on the host so that kernels can be dispatched and
/// validated without reading the buffer back.
pub struct GpuVector<T> {
    buffer: Buffer,
    len: u64,
    phantom: PhantomData<T>,
}

impl<T: Pod> GpuVector<T> {
    /// Allocates a buffer initialized with `data`.
    pub fn init(device: &Device, data: impl AsRef<[T]>, usage: BufferUsages) -> Self {
        let data = data.as_ref();
        let buffer = device.create_buffer_init(&BufferInitDescriptor {
            label: None,
            contents: bytemuck::cast_slice(data),
            usage,
        });
        Self {
            buffer,
            len: data.len() as u64,
            phantom: PhantomData,
        }
    }

    /// Allocates a buffer of `len` elements with unspecified content.
    pub fn uninit(device: &Device, len: u32, usage: BufferUsages) -> Self {
        let buffer = device.create_buffer(&BufferDescriptor {
            label: None,
            size: len as BufferAddress * size_of::<T>() as BufferAddress,
            usage,
            mapped_at_creation: false,
        });
        Self {
            buffer,
            len: len as u64,
            phantom: PhantomData,
        }
    }

    /// Wraps an existing buffer, interpreting its content as an array of `T`.
    ///
    /// Fails if the buffer size is not a multiple of `size_of::<T>()`.
    pub fn from_buffer(buffer: Buffer) -> Result<Self> {
        let stride = size_of::<T>();
        if stride == 0 || buffer.size() % stride as u64 != 0 {
            return Err(Error::MisalignedBuffer {
                size: buffer.size(),
                stride,
            });
        }

        Ok(Self {
            len: buffer.size() / stride as u64,
            buffer,
            phantom: PhantomData,
        })
    }

    /// The number of elements in this buffer.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Is this buffer empty?
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The size of this buffer, in bytes.
    pub fn size_in_bytes(&self) -> BufferAddress {
        self.len * size_of::<T>() as BufferAddress
    }

    /// The underlying `wgpu` buffer.
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// The usages this buffer was created with.
    pub fn usage(&self) -> BufferUsages {
        self.buffer.usage()
    }

    /// Unwraps the underlying `wgpu` buffer.
    pub fn into_inner(self) -> Buffer {
        self.buffer
    }

    /// Fails with [`Error::MissingUsages`] unless this buffer has all the `required` usages.
    pub fn check_usages(&self, required: BufferUsages) -> Result<()> {
        let found = self.usage();
        if found.contains(required) {
            Ok(())
        } else {
            Err(Error::MissingUsages { required, found })
        }
    }

    /// Queues a write of `data` at the beginning of this buffer.
    pub fn write(&self, queue: &Queue, data: &[T]) {
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(data));
    }

    /// Records a copy of the whole `source` into `self`.
    ///
    /// Copies `min(self.len(), source.len())` elements.
    pub fn copy_from(&self, encoder: &mut CommandEncoder, source: &GpuVector<T>) {
        let size = self.size_in_bytes().min(source.size_in_bytes());
        if size > 0 {
            encoder.copy_buffer_to_buffer(&source.buffer, 0, &self.buffer, 0, size);
        }
    }

    /// Reads the content of this buffer back to the host.
    ///
    /// The buffer must have the [`BufferUsages::MAP_READ`] usage. This waits for every
    /// previously submitted command to complete.
    pub async fn read(&self, device: &Device) -> Result<Vec<T>> {
        if self.is_empty() {
            return Ok(vec![]);
        }

        let slice = self.buffer.slice(..);
        let (sender, receiver) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        device.poll(wgpu::PollType::Wait)?;
        receiver.await.map_err(|_| Error::ReadbackCancelled)??;

        let result = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice(&data[..]).to_vec()
        };
        self.buffer.unmap();
        Ok(result)
    }
}

/// Returns the vector in `slot`, reallocated first if its length isn’t `len`.
pub(crate) fn reserve_vector<'a, T: Pod>(
    slot: &'a mut Option<GpuVector<T>>,
    device: &Device,
    len: u32,
    usage: BufferUsages,
    name: &str,
) -> &'a GpuVector<T> {
    let vector = match slot.take() {
        Some(vector) if vector.len() == len as u64 => vector,
        _ => {
            log::debug!("allocating {len} elements for {name}");
            GpuVector::uninit(device, len, usage)
        }
    };
    slot.insert(vector)
}

/// A device-resident single value of type `T`.
pub struct GpuScalar<T>(GpuVector<T>);

impl<T: Pod> GpuScalar<T> {
    /// Allocates a buffer containing `value`.
    pub fn init(device: &Device, value: T, usage: BufferUsages) -> Self {
        Self(GpuVector::init(device, [value], usage))
    }

    /// Allocates a buffer for one value with unspecified content.
    pub fn uninit(device: &Device, usage: BufferUsages) -> Self {
        Self(GpuVector::uninit(device, 1, usage))
    }

    /// The underlying `wgpu` buffer.
    pub fn buffer(&self) -> &Buffer {
        self.0.buffer()
    }

    /// This scalar seen as a one-element vector.
    pub fn as_vector(&self) -> &GpuVector<T> {
        &self.0
    }

    /// Reads the value back to the host.
    pub async fn read(&self, device: &Device) -> Result<T> {
        let values = self.0.read(device).await?;
        values.first().copied().ok_or(Error::ReadbackCancelled)
    }
}

/// A destination for a scalar result computed on the GPU: the element `offset` of a `u32`
/// buffer.
///
/// Writing results to a device buffer lets them be chained with other kernels without a host
/// round-trip.
#[derive(Copy, Clone)]
pub struct ScalarDest<'a> {
    /// The destination buffer.
    pub buffer: &'a GpuVector<u32>,
    /// The index of the element to overwrite.
    pub offset: u32,
}

impl<'a> ScalarDest<'a> {
    /// A destination targeting `buffer[offset]`.
    pub fn new(buffer: &'a GpuVector<u32>, offset: u32) -> Self {
        Self { buffer, offset }
    }

    /// Checks that `offset` is in bounds and that the buffer can be written by copies.
    pub fn validate(&self) -> Result<()> {
        if self.offset as u64 >= self.buffer.len() {
            return Err(Error::OffsetOutOfRange {
                offset: self.offset,
                len: self.buffer.len(),
            });
        }
        self.buffer.check_usages(BufferUsages::COPY_DST)
    }

    pub(crate) fn byte_offset(&self) -> BufferAddress {
        self.offset as BufferAddress * size_of::<u32>() as BufferAddress
    }

    /// Records a copy of the first element of `source` into this destination.
    pub(crate) fn copy_from(&self, encoder: &mut CommandEncoder, source: &Buffer) {
        encoder.copy_buffer_to_buffer(
            source,
            0,
            self.buffer.buffer(),
            self.byte_offset(),
            size_of::<u32>() as BufferAddress,
        );
    }

    /// Records a write of zero into this destination.
    pub(crate) fn clear(&self, encoder: &mut CommandEncoder) {
        encoder.clear_buffer(
            self.buffer.buffer(),
            self.byte_offset(),
            Some(size_of::<u32>() as BufferAddress),
        );
    }
}

#[cfg(test)]
mod test {
    use super::GpuVector;
    use crate::test_utils::test_gpu;
    use crate::Error;
    use wgpu::{BufferDescriptor, BufferUsages};

    #[futures_test::test]
    #[serial_test::serial]
    async fn wrap_raw_buffer() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let raw = gpu.device().create_buffer(&BufferDescriptor {
            label: None,
            size: 24,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        let wrapped = GpuVector::<[u32; 2]>::from_buffer(raw).unwrap();
        assert_eq!(wrapped.len(), 3);

        let raw = gpu.device().create_buffer(&BufferDescriptor {
            label: None,
            size: 20,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        assert!(matches!(
            GpuVector::<[u32; 2]>::from_buffer(raw),
            Err(Error::MisalignedBuffer {
                size: 20,
                stride: 8
            })
        ));
    }

    #[futures_test::test]
    #[serial_test::serial]
    async fn write_and_read_back() {
        let Some(gpu) = test_gpu().await else {
            return;
        };

        let values = [3u32, 1, 4, 1, 5];
        let staging = GpuVector::uninit(
            gpu.device(),
            values.len() as u32,
            BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        );
        staging.write(gpu.queue(), &values);
        gpu.queue().submit([]);
        assert_eq!(staging.read(gpu.device()).await.unwrap(), values);
    }
}
