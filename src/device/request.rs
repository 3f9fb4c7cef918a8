//! Hardware requests and their lifecycle
//!
//! A [`HardwareRequest`] is built from a [`RequestConfig`] and then moves
//! through `Built -> MemoryRegistered -> Submitted -> Completed | TimedOut |
//! Failed`. A timed-out request may still complete or fail on a later wait.

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::capability::OperationKind;
use crate::error::{AccelError, AccelResult};
use crate::internal_error;
use crate::kernels::{AccelerationMode, ExecutionContext};
use crate::tensor::{Buffer, BufferId};
use crate::transform::{ActiveList, LayerDescriptor, Transform};

pub type RequestId = u64;

/// Leading bytes of a serialized request
pub const REQUEST_MAGIC: &[u8; 4] = b"AFRQ";
pub const REQUEST_FORMAT_VERSION: u16 = 1;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    Built,
    MemoryRegistered,
    Submitted,
    Completed,
    TimedOut,
    Failed,
}

impl RequestState {
    pub fn can_transition(self, to: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, to),
            (Built, MemoryRegistered)
                | (Built, Failed)
                | (MemoryRegistered, Submitted)
                | (MemoryRegistered, Failed)
                | (Submitted, Completed)
                | (Submitted, TimedOut)
                | (Submitted, Failed)
                | (TimedOut, TimedOut)
                | (TimedOut, Completed)
                | (TimedOut, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Failed)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Layers to run, in order, with optional per-layer active lists
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    layers: Vec<Arc<dyn Transform>>,
    active_lists: HashMap<usize, ActiveList>,
    acceleration: Option<AccelerationMode>,
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, layer: Arc<dyn Transform>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Attach an active list to layer `index`, validated against that layer
    pub fn with_active_list(mut self, index: usize, list: ActiveList) -> AccelResult<Self> {
        let layer = self
            .layers
            .get(index)
            .ok_or_else(|| internal_error!("active list for missing layer {}", index))?;
        layer.validate_active_list(&list)?;
        self.active_lists.insert(index, list);
        Ok(self)
    }

    /// Override the session's acceleration mode for this request
    pub fn with_acceleration(mut self, accel: AccelerationMode) -> Self {
        self.acceleration = Some(accel);
        self
    }

    pub fn layers(&self) -> &[Arc<dyn Transform>] {
        &self.layers
    }

    pub fn acceleration(&self) -> Option<AccelerationMode> {
        self.acceleration
    }
}

/// One layer as the device sees it
#[derive(Debug, Clone)]
pub struct RequestLayer {
    pub transform: Arc<dyn Transform>,
    pub descriptor: LayerDescriptor,
    pub active_list: Option<ActiveList>,
}

/// Self-contained description of one submission
#[derive(Debug, Clone)]
pub struct HardwareRequest {
    id: RequestId,
    state: RequestState,
    layers: Vec<RequestLayer>,
    acceleration: Option<AccelerationMode>,
    mappings: HashMap<BufferId, u64>,
}

impl HardwareRequest {
    pub fn build(config: &RequestConfig) -> AccelResult<Self> {
        if config.layers.is_empty() {
            return Err(internal_error!("request has no layers"));
        }
        let layers = config
            .layers
            .iter()
            .enumerate()
            .map(|(i, transform)| {
                Ok(RequestLayer {
                    transform: Arc::clone(transform),
                    descriptor: transform.layer_descriptor()?,
                    active_list: config.active_lists.get(&i).cloned(),
                })
            })
            .collect::<AccelResult<Vec<_>>>()?;

        let id = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Built request {} with {} layer(s)", id, layers.len());
        Ok(Self {
            id,
            state: RequestState::Built,
            layers,
            acceleration: config.acceleration,
            mappings: HashMap::new(),
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn layers(&self) -> &[RequestLayer] {
        &self.layers
    }

    pub fn acceleration(&self) -> Option<AccelerationMode> {
        self.acceleration
    }

    pub(crate) fn set_default_acceleration(&mut self, accel: AccelerationMode) {
        self.acceleration.get_or_insert(accel);
    }

    pub fn transition(&mut self, to: RequestState) -> AccelResult<()> {
        if !self.state.can_transition(to) {
            return Err(AccelError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        tracing::trace!("request {}: {} -> {}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    /// Distinct buffers referenced by any layer, in first-use order
    pub fn buffers(&self) -> Vec<Buffer> {
        let mut seen = Vec::new();
        let mut buffers = Vec::new();
        for binding in self.layers.iter().flat_map(|l| l.descriptor.operands.iter()) {
            let id = binding.buffer.id();
            if !seen.contains(&id) {
                seen.push(id);
                buffers.push(binding.buffer.clone());
            }
        }
        buffers
    }

    pub(crate) fn bind_mapping(&mut self, buffer: BufferId, mapping: u64) {
        self.mappings.insert(buffer, mapping);
    }

    pub fn mapping(&self, buffer: BufferId) -> Option<u64> {
        self.mappings.get(&buffer).copied()
    }

    /// Run every layer on the host kernels
    pub fn execute(&self, accel: AccelerationMode, ctx: &mut ExecutionContext) -> AccelResult<()> {
        for layer in &self.layers {
            layer
                .transform
                .compute(accel, layer.active_list.as_ref(), ctx)?;
        }
        Ok(())
    }

    /// Little-endian wire image; every buffer must already be registered
    pub fn to_bytes(&self) -> AccelResult<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    fn encode(&self, out: &mut Vec<u8>) -> AccelResult<()> {
        let io = |e: std::io::Error| internal_error!("request encoding failed: {}", e);

        out.write_all(REQUEST_MAGIC).map_err(io)?;
        out.write_u16::<LittleEndian>(REQUEST_FORMAT_VERSION).map_err(io)?;
        out.write_u16::<LittleEndian>(0).map_err(io)?;
        out.write_u64::<LittleEndian>(self.id).map_err(io)?;
        out.write_u32::<LittleEndian>(self.layers.len() as u32).map_err(io)?;

        for layer in &self.layers {
            let d = &layer.descriptor;
            out.write_u8(operation_code(d.operation)).map_err(io)?;
            out.write_u8(d.kernel_mode.input.size() as u8).map_err(io)?;
            out.write_u8(d.kernel_mode.weight.size() as u8).map_err(io)?;
            out.write_u8(d.kernel_mode.bias.size() as u8).map_err(io)?;

            out.write_u16::<LittleEndian>(d.config_words.len() as u16).map_err(io)?;
            for word in &d.config_words {
                out.write_u32::<LittleEndian>(*word).map_err(io)?;
            }

            let indices = layer.active_list.as_ref().map(|l| l.indices.as_slice()).unwrap_or(&[]);
            out.write_u32::<LittleEndian>(indices.len() as u32).map_err(io)?;
            for index in indices {
                out.write_u32::<LittleEndian>(*index).map_err(io)?;
            }

            out.write_u8(d.operands.len() as u8).map_err(io)?;
            for binding in &d.operands {
                let mapping = self.mapping(binding.buffer.id()).ok_or_else(|| {
                    internal_error!("request {}: buffer {} not registered", self.id, binding.buffer.id())
                })?;
                out.write_u8(binding.role.index() as u8).map_err(io)?;
                out.write_u64::<LittleEndian>(mapping).map_err(io)?;
                out.write_u64::<LittleEndian>(binding.size as u64).map_err(io)?;
            }
        }
        Ok(())
    }
}

fn operation_code(kind: OperationKind) -> u8 {
    match kind {
        OperationKind::Affine => 1,
        OperationKind::AffineDiagonal => 2,
        OperationKind::AffineMultiBias => 3,
        OperationKind::Pooling => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DataType, OperandRole, Shape, TensorDesc};
    use crate::transform::descriptor::BIAS_MODE_PARAM;
    use crate::transform::{build_transform, BiasMode, OperationDescriptor, Parameter};
    use crate::validator::Validator;
    use byteorder::{ByteOrder, LittleEndian};

    fn affine_layer() -> Arc<dyn Transform> {
        let desc = OperationDescriptor::new(OperationKind::Affine)
            .with_operand(
                OperandRole::Input,
                TensorDesc::new(Shape::hw(8, 1), DataType::Int16, Buffer::from_i16(&[1; 8])),
            )
            .with_operand(
                OperandRole::Output,
                TensorDesc::new(Shape::hw(2, 1), DataType::Int32, Buffer::zeroed(8)),
            )
            .with_operand(
                OperandRole::Weights,
                TensorDesc::new(Shape::hw(2, 8), DataType::Int16, Buffer::from_i16(&[1; 16])),
            )
            .with_operand(
                OperandRole::Biases,
                TensorDesc::new(Shape::h(2), DataType::Int32, Buffer::from_i32(&[0, 0])),
            )
            .with_parameter(BIAS_MODE_PARAM, Parameter::BiasMode(BiasMode::Default));
        let transform = build_transform(&desc, &Validator::default()).unwrap().unwrap();
        Arc::from(transform)
    }

    #[test]
    fn test_state_machine() {
        use RequestState::*;
        assert!(Built.can_transition(MemoryRegistered));
        assert!(Submitted.can_transition(TimedOut));
        assert!(TimedOut.can_transition(Completed));
        assert!(TimedOut.can_transition(TimedOut));
        assert!(!Built.can_transition(Submitted));
        assert!(!Completed.can_transition(Failed));
        assert!(!Failed.can_transition(Completed));
        assert!(Completed.is_terminal());
        assert!(!TimedOut.is_terminal());
    }

    #[test]
    fn test_invalid_transition_is_error() {
        let mut request = HardwareRequest::build(&RequestConfig::new().with_layer(affine_layer())).unwrap();
        let err = request.transition(RequestState::Completed).unwrap_err();
        assert!(matches!(err, AccelError::InvalidStateTransition { .. }));
        assert_eq!(request.state(), RequestState::Built);
    }

    #[test]
    fn test_ids_are_unique() {
        let config = RequestConfig::new().with_layer(affine_layer());
        let a = HardwareRequest::build(&config).unwrap();
        let b = HardwareRequest::build(&config).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_empty_request_rejected() {
        assert!(HardwareRequest::build(&RequestConfig::new()).is_err());
    }

    #[test]
    fn test_buffers_deduplicated() {
        let layer = affine_layer();
        let request =
            HardwareRequest::build(&RequestConfig::new().with_layer(layer.clone()).with_layer(layer)).unwrap();
        assert_eq!(request.buffers().len(), 4);
    }

    #[test]
    fn test_active_list_validated_on_attach() {
        let config = RequestConfig::new().with_layer(affine_layer());
        assert!(config.clone().with_active_list(0, ActiveList::new(vec![1])).is_ok());
        let err = config.with_active_list(0, ActiveList::new(vec![5])).unwrap_err();
        assert_eq!(err.status(), crate::error::Status::ActiveListIndicesInvalid);
    }

    #[test]
    fn test_wire_image() {
        let mut request = HardwareRequest::build(&RequestConfig::new().with_layer(affine_layer())).unwrap();
        assert!(request.to_bytes().is_err());

        for (i, buffer) in request.buffers().iter().enumerate() {
            request.bind_mapping(buffer.id(), 100 + i as u64);
        }
        let bytes = request.to_bytes().unwrap();
        assert_eq!(&bytes[0..4], REQUEST_MAGIC);
        assert_eq!(LittleEndian::read_u16(&bytes[4..6]), REQUEST_FORMAT_VERSION);
        assert_eq!(LittleEndian::read_u64(&bytes[8..16]), request.id());
        assert_eq!(LittleEndian::read_u32(&bytes[16..20]), 1);
        assert_eq!(bytes[20], 1);
        // header 20, layer prefix 4, word count 2, 5 words, list count 4, operand count 1, 4 operands
        assert_eq!(bytes.len(), 20 + 4 + 2 + 5 * 4 + 4 + 1 + 4 * 17);
    }
}
