//! Reusable tensor buffers
use enum_map::{Enum, EnumMap};
use log::debug;
use std::collections::HashMap;
use tch::{Device, Kind, Tensor};

/// Logical role of a pooled buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Enum)]
pub enum BufferRole {
    /// Recurrent layer state.
    State,
    /// Gradient with respect to a forward value.
    Gradient,
    /// Source context matrix.
    Context,
    /// Coverage vector.
    Coverage,
    /// Input feed vector.
    InputFeed,
    /// Dropout mask.
    Mask,
    /// Sampled tokens.
    Sampling,
}

/// Identifies a buffer within a [`BufferPool`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BufferKey {
    pub role: BufferRole,
    pub slot: usize,
}

impl BufferKey {
    pub const fn new(role: BufferRole, slot: usize) -> Self {
        Self { role, slot }
    }
}

/// Pool of preallocated tensors that are reused across calls.
///
/// A buffer is reallocated only when the requested shape or kind differs from the existing one.
/// Returned tensors share storage with the pooled buffer so writing to them updates the buffer.
/// Any tensor previously handed out for a key is clobbered the next time that key is requested
/// with a filling method; callers must not hold on to buffer contents across passes.
#[derive(Debug)]
pub struct BufferPool {
    buffers: HashMap<BufferKey, Tensor>,
    allocations: EnumMap<BufferRole, usize>,
    kind: Kind,
    device: Device,
}

impl BufferPool {
    /// Create an empty pool for floating-point buffers of the given kind.
    pub fn new(kind: Kind, device: Device) -> Self {
        Self {
            buffers: HashMap::new(),
            allocations: EnumMap::default(),
            kind,
            device,
        }
    }

    /// Default floating-point kind of the pooled buffers.
    pub const fn kind(&self) -> Kind {
        self.kind
    }

    /// Device on which the buffers are allocated.
    pub const fn device(&self) -> Device {
        self.device
    }

    /// Buffer with the given shape and the pool kind. The contents are unspecified.
    pub fn get(&mut self, key: BufferKey, shape: &[i64]) -> Tensor {
        self.get_with_kind(key, shape, self.kind)
    }

    /// Buffer with the given shape and kind. The contents are unspecified.
    pub fn get_with_kind(&mut self, key: BufferKey, shape: &[i64], kind: Kind) -> Tensor {
        if let Some(buffer) = self.buffers.get(&key) {
            if buffer.size() == shape && buffer.kind() == kind {
                return buffer.shallow_clone();
            }
        }
        debug!("allocating {:?} buffer with shape {:?}", key, shape);
        self.allocations[key.role] += 1;
        let buffer = Tensor::zeros(shape, (kind, self.device));
        self.buffers.insert(key, buffer.shallow_clone());
        buffer
    }

    /// Zero-filled buffer with the given shape.
    pub fn zeros(&mut self, key: BufferKey, shape: &[i64]) -> Tensor {
        self.filled(key, shape, 0.0)
    }

    /// Buffer with the given shape filled with a constant value.
    pub fn filled(&mut self, key: BufferKey, shape: &[i64], value: f64) -> Tensor {
        let mut buffer = self.get(key, shape);
        let _ = buffer.fill_(value);
        buffer
    }

    /// Buffer with the given shape holding a copy of `source`.
    pub fn copy_of(&mut self, key: BufferKey, source: &Tensor) -> Tensor {
        let mut buffer = self.get_with_kind(key, &source.size(), source.kind());
        buffer.copy_(source);
        buffer
    }

    /// Number of allocations made so far for buffers of the given role.
    pub fn allocations(&self, role: BufferRole) -> usize {
        self.allocations[role]
    }
}
