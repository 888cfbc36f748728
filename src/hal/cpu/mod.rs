//! A pure-Rust reference engine.
//!
//! Plans primitives the way the vendor library does and rejects the same descriptors,
//! but executes nothing. Every object it creates, releases or flushes is written to a
//! shared [`Ledger`] that outlives the engine.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use derive_more::{Deref, Display};
use rustc_hash::FxHashSet as HashSet;

use super::{
    ops::{ConvolutionDesc, PoolingAlgorithm, PoolingDesc, PrimitiveDesc},
    vendor::{Vendor, VendorError},
};
use crate::loom::{
    memory::{Format, MemoryDesc},
    num::DataType,
};

pub mod validate;

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct ObjectId(uid::Id<ObjectId>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Create(ObjectId),
    Release(ObjectId),
    Flush,
}

/// What a reference object stands for.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Memory(MemoryDesc),
    Compute {
        desc: PrimitiveDesc,
        memories: Vec<ObjectId>,
    },
}

/// A memory handle or compute primitive of the reference engine.
#[derive(Debug)]
pub struct Object {
    pub id: ObjectId,
    pub body: Body,
}

/// Record of every object the engine touched, in order.
#[derive(Debug, Default)]
pub struct Ledger {
    events: Mutex<Vec<Event>>,
}

impl Ledger {
    fn lock(&self) -> MutexGuard<'_, Vec<Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event) {
        self.lock().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().clone()
    }

    pub fn created(&self) -> usize {
        self.count(|event| matches!(event, Event::Create(_)))
    }

    pub fn released(&self) -> usize {
        self.count(|event| matches!(event, Event::Release(_)))
    }

    pub fn flushes(&self) -> usize {
        self.count(|event| matches!(event, Event::Flush))
    }

    /// Objects created and not released yet.
    pub fn live(&self) -> HashSet<ObjectId> {
        let mut live = HashSet::default();
        for event in self.lock().iter() {
            match event {
                Event::Create(id) => _ = live.insert(*id),
                Event::Release(id) => _ = live.remove(id),
                Event::Flush => {}
            }
        }
        live
    }

    /// Objects released more than once, or never created.
    pub fn double_releases(&self) -> usize {
        let mut created = HashSet::default();
        let mut released = HashSet::default();
        let mut faults = 0;
        for event in self.lock().iter() {
            match event {
                Event::Create(id) => _ = created.insert(*id),
                Event::Release(id) if !created.contains(id) || !released.insert(*id) => faults += 1,
                _ => {}
            }
        }
        faults
    }

    fn count(&self, f: impl Fn(&Event) -> bool) -> usize {
        self.lock().iter().filter(|event| f(event)).count()
    }
}

#[derive(Debug)]
pub struct Reference {
    conv_auto: bool,
    ledger: Arc<Ledger>,
}

impl Reference {
    #[inline]
    pub fn builder() -> ReferenceBuilder {
        ReferenceBuilder::new()
    }

    /// The ledger this engine writes to. Stays readable after the engine is dropped.
    #[inline]
    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    fn create(&mut self, body: Body) -> Object {
        let id = ObjectId(uid::Id::new());
        self.ledger.push(Event::Create(id));
        Object { id, body }
    }
}

fn pooling_workspace(desc: &PoolingDesc) -> Result<MemoryDesc, VendorError> {
    if desc.algorithm != PoolingAlgorithm::Max {
        return Err(VendorError::Unsupported(format!(
            "{} pooling with indices",
            desc.algorithm
        )));
    }
    // indices into windows of 256 elements or more overflow a byte
    let window: usize = desc.window.shape.iter().product();
    let r#type = match window < 256 {
        true => DataType::U8,
        false => DataType::I32,
    };
    Ok(MemoryDesc::dense(desc.dst.shape.clone(), r#type))
}

impl Vendor for Reference {
    type Primitive = Object;

    fn memory(&mut self, desc: &MemoryDesc) -> Result<Object, VendorError> {
        validate::memory(desc)?;
        Ok(self.create(Body::Memory(desc.clone())))
    }

    fn primitive(&mut self, desc: &PrimitiveDesc, memories: &[&Object]) -> Result<Object, VendorError> {
        let kind = desc.kind();
        let expected = kind.operand_count();
        if memories.len() != expected {
            return Err(VendorError::Bindings {
                kind,
                expected,
                found: memories.len(),
            });
        }
        if let Some(index) = memories
            .iter()
            .position(|object| !matches!(object.body, Body::Memory(_)))
        {
            return Err(VendorError::Param {
                name: "bindings",
                reason: format!("binding {index} of {kind} is not a memory object"),
            });
        }

        validate::primitive(desc, self.conv_auto)?;
        let memories = memories.iter().map(|object| object.id).collect();
        let desc = desc.clone();
        Ok(self.create(Body::Compute { desc, memories }))
    }

    fn workspace(&self, desc: &PrimitiveDesc) -> Result<Option<MemoryDesc>, VendorError> {
        if desc.kind().workspace_slot().is_none() {
            return Ok(None);
        }
        for stage in desc.stages() {
            validate::primitive(&stage, self.conv_auto)?;
        }

        let desc = match desc {
            PrimitiveDesc::MaxPoolingWithIndices(desc) => pooling_workspace(desc)?,
            PrimitiveDesc::MaxPoolingWithIndicesBackward(desc) => pooling_workspace(&desc.hint)?,
            PrimitiveDesc::MaxPoolingBackward(desc) => pooling_workspace(&desc.forward())?,
            PrimitiveDesc::BatchNormTraining(desc) => {
                // one bit per element for the fused relu mask
                MemoryDesc::dense([desc.src.size().div_ceil(8)], DataType::U8)
            }
            PrimitiveDesc::Rnn(desc) => {
                let (steps, batch, channels) = validate::rnn_dims(desc)?;
                let layers = desc.src_iter.shape.first().copied().unwrap_or(1);
                let directions = desc.direction.count();
                let size = [layers, directions, batch, channels, desc.cell.gates()]
                    .into_iter()
                    .fold(steps.checked_add(1), |size, dim| size?.checked_mul(dim))
                    .ok_or_else(|| VendorError::Param {
                        name: "workspace",
                        reason: format!("rnn over {} overflows the address space", desc.src_layer.shape),
                    })?;
                MemoryDesc::dense([size], DataType::F32)
            }
            _ => return Ok(None),
        };
        Ok(Some(desc))
    }

    fn weights_format(&self, desc: &ConvolutionDesc) -> Result<Format, VendorError> {
        validate::convolution(desc, self.conv_auto)?;
        match desc.weights.format {
            Format::Any => Ok(Format::Default),
            ref format => Ok(format.clone()),
        }
    }

    #[inline]
    fn supports_conv_auto(&self) -> bool {
        self.conv_auto
    }

    fn release(&mut self, primitive: Object) {
        self.ledger.push(Event::Release(primitive.id));
    }

    fn flush_buffers(&mut self) {
        self.ledger.push(Event::Flush);
    }
}

#[derive(Debug, Default, Clone)]
pub struct ReferenceBuilder {
    pub conv_auto: bool,
    pub ledger: Option<Arc<Ledger>>,
}

impl ReferenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the engine accepts [`ConvAlgorithm::Auto`](super::ops::ConvAlgorithm::Auto).
    pub fn conv_auto(mut self, conv_auto: bool) -> Self {
        self.conv_auto = conv_auto;
        self
    }

    /// Writes to an existing ledger instead of a fresh one.
    pub fn ledger(mut self, ledger: Arc<Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn build(self) -> Reference {
        Reference {
            conv_auto: self.conv_auto,
            ledger: self.ledger.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Body, Event, Reference};
    use crate::{
        hal::{
            ops::{PoolingAlgorithm, PoolingDesc, PoolingWindow, PrimitiveDesc},
            vendor::{Vendor, VendorError},
        },
        loom::{
            memory::{Format, MemoryDesc},
            num::DataType,
        },
    };

    fn pool(algorithm: PoolingAlgorithm, window: usize) -> PoolingDesc {
        let output = 32 / window;
        PoolingDesc {
            src: MemoryDesc::dense([1, 2, 32, 32], DataType::F32),
            dst: MemoryDesc::dense([1, 2, output, output], DataType::F32),
            algorithm,
            window: PoolingWindow {
                shape: vec![window; 2],
                strides: vec![window; 2],
                padding_below: vec![0; 2],
                padding_above: vec![0; 2],
            },
        }
    }

    #[test]
    fn test_memory() {
        let mut engine = Reference::builder().build();
        let ledger = engine.ledger();

        let object = engine.memory(&MemoryDesc::dense([2, 3], DataType::F32)).unwrap();
        assert!(matches!(object.body, Body::Memory(_)));
        assert!(matches!(
            engine.memory(&MemoryDesc::any([2, 3], DataType::F32)),
            Err(VendorError::Layout(_))
        ));
        assert!(matches!(
            engine.memory(&MemoryDesc::new([2, 3], DataType::F32, Format::Blocked)),
            Err(VendorError::Layout(_))
        ));

        let id = object.id;
        engine.release(object);
        engine.flush_buffers();
        assert_eq!(ledger.events(), [Event::Create(id), Event::Release(id), Event::Flush]);
        assert!(ledger.live().is_empty());
        assert_eq!(ledger.double_releases(), 0);
    }

    #[test]
    fn test_bindings() {
        let mut engine = Reference::builder().build();
        let desc = pool(PoolingAlgorithm::Max, 2);
        let src = engine.memory(&desc.src).unwrap();
        let dst = engine.memory(&desc.dst).unwrap();

        let desc = PrimitiveDesc::Pooling(desc);
        assert!(matches!(
            engine.primitive(&desc, &[&src]),
            Err(VendorError::Bindings {
                expected: 2,
                found: 1,
                ..
            })
        ));
        let pool = engine.primitive(&desc, &[&src, &dst]).unwrap();
        assert!(matches!(
            engine.primitive(&desc, &[&src, &pool]),
            Err(VendorError::Param {
                name: "bindings",
                ..
            })
        ));
    }

    #[test]
    fn test_pooling_workspace() {
        let engine = Reference::builder().build();

        let desc = PrimitiveDesc::MaxPoolingWithIndices(pool(PoolingAlgorithm::Max, 2));
        let workspace = engine.workspace(&desc).unwrap().unwrap();
        assert_eq!(workspace.r#type, DataType::U8);
        assert_eq!(format!("{}", workspace.shape), "[1, 2, 16, 16]");

        let desc = PrimitiveDesc::MaxPoolingWithIndices(pool(PoolingAlgorithm::Max, 16));
        let workspace = engine.workspace(&desc).unwrap().unwrap();
        assert_eq!(workspace.r#type, DataType::I32);

        let desc = PrimitiveDesc::MaxPoolingWithIndices(pool(PoolingAlgorithm::AvgIncludePadding, 2));
        assert!(matches!(
            engine.workspace(&desc),
            Err(VendorError::Unsupported(_))
        ));

        let desc = PrimitiveDesc::Pooling(pool(PoolingAlgorithm::Max, 2));
        assert!(engine.workspace(&desc).unwrap().is_none());
    }
}
