use naga_oil::compose::ComposerError;
use wgpu::BufferUsages;

/// Errors returned by the GPU buffer operators.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A kernel could not be composed by naga-oil.
    #[error("failed to compose shader `{path}`: {source}")]
    ShaderComposition {
        /// The virtual path of the shader being composed.
        path: String,
        /// The composer error.
        #[source]
        source: ComposerError,
    },

    /// A composed kernel failed naga validation.
    #[error("shader `{path}` failed validation: {message}")]
    ShaderValidation {
        /// The virtual path of the shader being validated.
        path: String,
        /// The validation error message.
        message: String,
    },

    /// An auxiliary scalar destination points past the end of its buffer.
    #[error("offset {offset} is out of range for a buffer of {len} elements")]
    OffsetOutOfRange {
        /// The requested element offset.
        offset: u32,
        /// The number of elements in the destination buffer.
        len: u64,
    },

    /// The host element size does not match the array stride of the WGSL element type.
    #[error("element stride mismatch: the host type is {host} bytes but the shader expects {shader} bytes")]
    StrideMismatch {
        /// `size_of::<T>()` of the host element type.
        host: usize,
        /// The array stride reflected from the composed shader.
        shader: u32,
    },

    /// A raw buffer size is not a multiple of the element size.
    #[error("buffer of {size} bytes cannot hold a whole number of {stride}-byte elements")]
    MisalignedBuffer {
        /// The buffer size, in bytes.
        size: u64,
        /// The element size, in bytes.
        stride: usize,
    },

    /// A buffer lacks usage flags needed by an operation.
    #[error("buffer usages {found:?} are missing the required {required:?}")]
    MissingUsages {
        /// The usages the operation needs.
        required: BufferUsages,
        /// The usages the buffer was created with.
        found: BufferUsages,
    },

    /// The buffer holds more elements than can be addressed by the kernels.
    #[error("{len} elements cannot be addressed with 32-bit indices")]
    TooManyElements {
        /// The number of elements requested.
        len: u64,
    },

    /// No scan kernel was compiled for the requested workgroup size.
    #[error("no scan kernel was compiled for {group_threads} threads per group")]
    UnsupportedGroupSize {
        /// The requested number of threads per group.
        group_threads: u32,
    },

    /// Mapping a buffer for readback failed.
    #[error("buffer readback failed: {0}")]
    Readback(#[from] wgpu::BufferAsyncError),

    /// Waiting for the device failed during a readback.
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),

    /// The map callback was dropped before completing.
    #[error("buffer readback was cancelled before completion")]
    ReadbackCancelled,
}

/// Result type of the GPU buffer operators.
pub type Result<T> = std::result::Result<T, Error>;
