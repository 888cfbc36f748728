//! Builds vendor primitives and keeps them in an index-addressed registry.
//!
//! Every primitive occupies a run of consecutive slots: one memory slot per operand in the
//! kind's fixed order, the workspace slot included, followed by the primitive itself. The
//! fused max-pooling backward appends two primitives, forward then backward.
//!
//! Slots are never removed individually. Dropping the emitter releases every built object
//! once, in index order, and then flushes the vendor's buffer cache.

use std::ops::Range;

use derive_more::{Deref, Display, From, Into};
use itertools::Itertools;
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    ops::{ConvAlgorithm, ConvolutionDesc, PrimitiveDesc, PrimitiveKind},
    vendor::{Vendor, VendorError},
};
use crate::loom::{
    layout::Shape,
    memory::{Format, MemoryDesc, Operands},
};

/// Index of a slot in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("#{_0}")]
pub struct PrimitiveId(usize);

/// Index of an emitter-owned scratch buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deref, From, Into, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("ws{_0}")]
pub struct WorkspaceId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SlotState {
    Unreserved,
    Reserved,
    Built,
}

#[derive(Debug)]
enum Slot<P> {
    Reserved,
    Memory { desc: MemoryDesc, handle: P },
    Compute { desc: PrimitiveDesc, handle: P },
}

impl<P> Slot<P> {
    fn into_handle(self) -> Option<P> {
        match self {
            Slot::Reserved => None,
            Slot::Memory { handle, .. } | Slot::Compute { handle, .. } => Some(handle),
        }
    }
}

/// Buffers a primitive binds, in the order it binds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deps {
    pub kind: PrimitiveKind,
    pub slots: Vec<PrimitiveId>,
    /// Scratch buffer owned by the emitter.
    pub workspace: Option<WorkspaceId>,
    /// Primitive that must run right before this one.
    pub forward: Option<PrimitiveId>,
}

/// Slots laid out by one `construct` or `reserve`.
#[derive(Debug, Clone)]
struct Span {
    kind: PrimitiveKind,
    memories: Range<usize>,
    stages: Range<usize>,
}

impl Span {
    /// The id handed back to the caller: the last primitive built.
    #[inline]
    fn root(&self) -> PrimitiveId {
        PrimitiveId(self.stages.end - 1)
    }
}

/// Vendor objects built for one descriptor and not yet in the registry.
struct Staged<P> {
    memories: Vec<(MemoryDesc, P)>,
    stages: Vec<(PrimitiveDesc, P)>,
    workspace: Option<Box<[u8]>>,
}

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("`{0}` requests a blocked layout, which is ambiguous without padding")]
    Blocked(&'static str),
    #[error("`{operand}` has {strides} strides for rank {rank}")]
    Rank {
        operand: &'static str,
        rank: usize,
        strides: usize,
    },
    #[error("softmax over {0} axes, only a single axis is supported")]
    MultiAxis(usize),
    #[error("axis {axis} is outside rank {rank}")]
    Axis { axis: usize, rank: usize },
    #[error("`{0}` disagrees with the forward hint")]
    Hint(&'static str),
    #[error("{0} was not returned by construct or reserve")]
    Unregistered(PrimitiveId),
    #[error("{id} holds a {expected} primitive, not {found}")]
    Kind {
        id: PrimitiveId,
        expected: PrimitiveKind,
        found: PrimitiveKind,
    },
    #[error("expected {expected} operands, found {found}")]
    Operands { expected: usize, found: usize },
    #[error("`{operand}` was built as {expected}, rebuilt as {found}")]
    Layout {
        operand: &'static str,
        expected: Shape,
        found: Shape,
    },
    #[error("{0} requires a workspace the engine did not describe")]
    Workspace(PrimitiveKind),
    #[error(transparent)]
    Vendor(#[from] VendorError),
}

/// A failed construction, with the operator it was for.
#[derive(Debug, Error)]
#[error("failed to emit {kind} over {shape}")]
pub struct EmitError {
    pub kind: PrimitiveKind,
    pub shape: Shape,
    #[source]
    pub source: ConstructionError,
}

impl EmitError {
    fn new(desc: &PrimitiveDesc, source: impl Into<ConstructionError>) -> Self {
        Self {
            kind: desc.kind(),
            shape: desc.shape(),
            source: source.into(),
        }
    }
}

/// How convolutions without an explicit algorithm are planned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmPolicy {
    /// Always [`ConvAlgorithm::Direct`].
    Direct,
    /// [`ConvAlgorithm::Auto`] where the vendor supports it.
    #[default]
    Auto,
}

fn check_layout(operand: &'static str, desc: &MemoryDesc) -> Result<(), ConstructionError> {
    match &desc.format {
        Format::Blocked => Err(ConstructionError::Blocked(operand)),
        Format::Strided(strides) if strides.len() != desc.shape.len() => {
            Err(ConstructionError::Rank {
                operand,
                rank: desc.shape.len(),
                strides: strides.len(),
            })
        }
        _ => Ok(()),
    }
}

fn agree(operand: &'static str, desc: &MemoryDesc, hint: &MemoryDesc) -> Result<(), ConstructionError> {
    match desc.shape == hint.shape {
        true => Ok(()),
        false => Err(ConstructionError::Hint(operand)),
    }
}

/// Checks that hold whatever the vendor.
fn validate(desc: &PrimitiveDesc) -> Result<(), ConstructionError> {
    for (operand, layout) in desc.operand_names().into_iter().zip_eq(desc.operands()) {
        check_layout(operand, layout)?;
    }
    if let Some(hint) = desc.hint() {
        for (operand, layout) in hint.operand_names().into_iter().zip_eq(hint.operands()) {
            check_layout(operand, layout)?;
        }
    }

    match desc {
        PrimitiveDesc::Softmax(desc) => {
            let rank = desc.src.shape.len();
            match desc.axes[..] {
                [axis] if axis < rank => Ok(()),
                [axis] => Err(ConstructionError::Axis { axis, rank }),
                _ => Err(ConstructionError::MultiAxis(desc.axes.len())),
            }
        }
        PrimitiveDesc::Concat(desc) => {
            let (axis, rank) = (desc.axis, desc.dst.shape.len());
            match axis < rank {
                true => Ok(()),
                false => Err(ConstructionError::Axis { axis, rank }),
            }
        }
        PrimitiveDesc::ConvolutionBackwardData(desc) => {
            agree("weights", &desc.weights, &desc.hint.weights)?;
            agree("diff_dst", &desc.diff_dst, &desc.hint.dst)?;
            agree("diff_src", &desc.diff_src, &desc.hint.src)
        }
        PrimitiveDesc::ConvolutionBackwardWeights(desc) => {
            agree("src", &desc.src, &desc.hint.src)?;
            agree("diff_dst", &desc.diff_dst, &desc.hint.dst)?;
            agree("diff_weights", &desc.diff_weights, &desc.hint.weights)?;
            match (&desc.diff_bias, &desc.hint.bias) {
                (Some(diff_bias), Some(bias)) => agree("diff_bias", diff_bias, bias),
                (Some(_), None) => Err(ConstructionError::Hint("diff_bias")),
                (None, _) => Ok(()),
            }
        }
        PrimitiveDesc::PoolingBackward(desc) | PrimitiveDesc::MaxPoolingWithIndicesBackward(desc) => {
            agree("diff_dst", &desc.diff_dst, &desc.hint.dst)?;
            agree("diff_src", &desc.diff_src, &desc.hint.src)
        }
        PrimitiveDesc::EltwiseBackward(desc) => {
            agree("src", &desc.src, &desc.hint.src)?;
            agree("diff_dst", &desc.diff_dst, &desc.hint.dst)?;
            agree("diff_src", &desc.diff_src, &desc.hint.src)
        }
        PrimitiveDesc::BatchNormBackward(desc) => {
            let hint = &desc.hint;
            agree("weights", &desc.weights, &hint.weights)?;
            agree("src", &desc.src, &hint.src)?;
            agree("mean", &desc.mean, &hint.mean)?;
            agree("variance", &desc.variance, &hint.variance)?;
            agree("diff_dst", &desc.diff_dst, &hint.dst)?;
            agree("diff_src", &desc.diff_src, &hint.src)?;
            agree("diff_weights", &desc.diff_weights, &hint.weights)
        }
        _ => Ok(()),
    }
}

#[derive(Debug)]
pub struct Emitter<V: Vendor> {
    engine: V,
    policy: AlgorithmPolicy,
    slots: Vec<Slot<V::Primitive>>,
    deps: HashMap<PrimitiveId, Deps>,
    spans: HashMap<PrimitiveId, Span>,
    workspaces: Vec<Box<[u8]>>,
}

impl<V: Vendor> Emitter<V> {
    /// Number of slots, reserved ones included.
    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn engine(&self) -> &V {
        &self.engine
    }

    pub fn state(&self, id: PrimitiveId) -> SlotState {
        match self.slots.get(*id) {
            None => SlotState::Unreserved,
            Some(Slot::Reserved) => SlotState::Reserved,
            Some(_) => SlotState::Built,
        }
    }

    /// The compute primitive at `id`, if one is built there.
    pub fn primitive(&self, id: PrimitiveId) -> Option<&V::Primitive> {
        match self.slots.get(*id) {
            Some(Slot::Compute { handle, .. }) => Some(handle),
            _ => None,
        }
    }

    /// The memory handle at `id`, if one is built there.
    pub fn memory(&self, id: PrimitiveId) -> Option<&V::Primitive> {
        match self.slots.get(*id) {
            Some(Slot::Memory { handle, .. }) => Some(handle),
            _ => None,
        }
    }

    pub fn memory_desc(&self, id: PrimitiveId) -> Option<&MemoryDesc> {
        match self.slots.get(*id) {
            Some(Slot::Memory { desc, .. }) => Some(desc),
            _ => None,
        }
    }

    /// The resolved descriptor the primitive at `id` was built from.
    pub fn desc(&self, id: PrimitiveId) -> Option<&PrimitiveDesc> {
        match self.slots.get(*id) {
            Some(Slot::Compute { desc, .. }) => Some(desc),
            _ => None,
        }
    }

    #[inline]
    pub fn deps(&self, id: PrimitiveId) -> Option<&Deps> {
        self.deps.get(&id)
    }

    #[inline]
    pub fn workspace(&self, id: WorkspaceId) -> Option<&[u8]> {
        self.workspaces.get(*id).map(|buffer| &buffer[..])
    }

    #[inline]
    pub fn workspace_mut(&mut self, id: WorkspaceId) -> Option<&mut [u8]> {
        self.workspaces.get_mut(*id).map(|buffer| &mut buffer[..])
    }

    /// Every scratch buffer allocated so far. Buffers replaced by a rebuild stay here.
    #[inline]
    pub fn workspaces(&self) -> &[Box<[u8]>] {
        &self.workspaces
    }

    fn algorithm(&self, explicit: Option<ConvAlgorithm>) -> ConvAlgorithm {
        let auto = self.policy == AlgorithmPolicy::Auto && self.engine.supports_conv_auto();
        match (explicit, auto) {
            (Some(algorithm), _) => algorithm,
            (None, true) => ConvAlgorithm::Auto,
            (None, false) => ConvAlgorithm::Direct,
        }
    }

    /// Settles the convolution algorithm once, for the descriptor and its hint alike.
    fn resolve(&self, mut desc: PrimitiveDesc) -> PrimitiveDesc {
        let explicit = match &desc {
            PrimitiveDesc::Convolution(desc) => desc.algorithm,
            PrimitiveDesc::ConvolutionBackwardData(desc) => desc.hint.algorithm,
            PrimitiveDesc::ConvolutionBackwardWeights(desc) => desc.hint.algorithm,
            _ => None,
        };
        let algorithm = self.algorithm(explicit);
        desc.for_each_convolution(|conv| conv.algorithm = Some(algorithm));
        desc
    }

    fn discard(&mut self, staged: Staged<V::Primitive>) {
        let handles = staged.memories.into_iter().map(|(_, handle)| handle);
        let handles = handles.chain(staged.stages.into_iter().map(|(_, handle)| handle));
        for handle in handles {
            self.engine.release(handle);
        }
    }

    /// Builds every vendor object for `desc` without touching the registry.
    /// On failure, whatever was built is released again.
    fn stage(&mut self, desc: &PrimitiveDesc) -> Result<Staged<V::Primitive>, ConstructionError> {
        let kind = desc.kind();
        let mut layouts: Vec<MemoryDesc> = desc.operands().into_iter().cloned().collect();
        let mut owned = None;
        if let Some(slot) = kind.workspace_slot() {
            let layout = self
                .engine
                .workspace(desc)?
                .ok_or(ConstructionError::Workspace(kind))?;
            if kind.owns_workspace() {
                owned = Some(layout.data_size());
            }
            layouts.insert(slot, layout);
        }

        let mut staged = Staged {
            memories: Vec::with_capacity(layouts.len()),
            stages: Vec::with_capacity(1),
            workspace: None,
        };

        for layout in layouts {
            match self.engine.memory(&layout) {
                Ok(handle) => staged.memories.push((layout, handle)),
                Err(err) => {
                    self.discard(staged);
                    return Err(err.into());
                }
            }
        }

        for (stage, bindings) in desc.stages().into_iter().zip_eq(kind.bindings()) {
            let memories = bindings
                .iter()
                .map(|&index| &staged.memories[index].1)
                .collect_vec();
            match self.engine.primitive(&stage, &memories) {
                Ok(handle) => staged.stages.push((stage, handle)),
                Err(err) => {
                    self.discard(staged);
                    return Err(err.into());
                }
            }
        }

        // scratch is committed only once the vendor accepted every stage
        staged.workspace = owned.map(|size| vec![0u8; size].into_boxed_slice());
        Ok(staged)
    }

    fn insert_workspace(&mut self, buffer: Box<[u8]>) -> WorkspaceId {
        self.workspaces.push(buffer);
        WorkspaceId(self.workspaces.len() - 1)
    }

    /// Writes the dependency entries of every primitive in `span`.
    fn record(&mut self, span: Span, workspace: Option<WorkspaceId>) -> PrimitiveId {
        let mut forward = None;
        for (stage, bindings) in span.stages.clone().zip_eq(span.kind.bindings()) {
            let id = PrimitiveId(stage);
            let slots = bindings
                .into_iter()
                .map(|index| PrimitiveId(span.memories.start + index))
                .collect();
            let deps = Deps {
                kind: span.kind,
                slots,
                workspace,
                forward,
            };
            self.deps.insert(id, deps);
            forward = Some(id);
        }

        let root = span.root();
        self.spans.insert(root, span);
        root
    }

    /// Validates `desc`, builds its buffers and primitive(s) and registers them.
    ///
    /// Returns the id of the primitive to execute; for the fused max-pooling backward
    /// that is the backward half, whose [`Deps::forward`] names the forward half.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn construct(&mut self, desc: impl Into<PrimitiveDesc>) -> Result<PrimitiveId, EmitError> {
        let desc = self.resolve(desc.into());
        validate(&desc).map_err(|err| EmitError::new(&desc, err))?;
        let staged = self.stage(&desc).map_err(|err| EmitError::new(&desc, err))?;

        let start = self.slots.len();
        let memories = start..start + staged.memories.len();
        let stages = memories.end..memories.end + staged.stages.len();
        let span = Span {
            kind: desc.kind(),
            memories,
            stages,
        };

        let workspace = staged.workspace.map(|buffer| self.insert_workspace(buffer));
        let memories = staged.memories.into_iter();
        self.slots
            .extend(memories.map(|(desc, handle)| Slot::Memory { desc, handle }));
        let stages = staged.stages.into_iter();
        self.slots
            .extend(stages.map(|(desc, handle)| Slot::Compute { desc, handle }));

        let id = self.record(span, workspace);
        log::debug!("construct {} over {} at {id}", desc.kind(), desc.shape());
        Ok(id)
    }

    /// Holds slots for a primitive of `kind` without building anything.
    /// The returned id is completed by [`Emitter::rebuild`].
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn reserve(&mut self, kind: PrimitiveKind) -> PrimitiveId {
        let start = self.slots.len();
        let memories = start..start + kind.operand_count();
        let stages = memories.end..memories.end + kind.bindings().len();
        self.slots
            .extend((memories.start..stages.end).map(|_| Slot::Reserved));

        let span = Span {
            kind,
            memories,
            stages,
        };
        let id = self.record(span, None);
        log::debug!("reserve {kind} at {id}");
        id
    }

    #[cfg(feature = "strict")]
    fn check_rebuild(&self, span: &Span, desc: &PrimitiveDesc) -> Result<(), ConstructionError> {
        let workspace = span.kind.workspace_slot();
        let slots = span
            .memories
            .clone()
            .filter(|&index| Some(index - span.memories.start) != workspace);
        for ((operand, layout), index) in desc
            .operand_names()
            .into_iter()
            .zip_eq(desc.operands())
            .zip(slots)
        {
            if let Some(Slot::Memory { desc: built, .. }) = self.slots.get(index) {
                if built.shape != layout.shape {
                    return Err(ConstructionError::Layout {
                        operand,
                        expected: built.shape.clone(),
                        found: layout.shape.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the primitive at `id` and its buffers from resolved layouts, in place.
    ///
    /// The replaced objects are released only after everything new is built. On failure
    /// the registry keeps the previous objects.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn rebuild(&mut self, id: PrimitiveId, desc: impl Into<PrimitiveDesc>) -> Result<(), EmitError> {
        let desc = self.resolve(desc.into());
        let error = |err: ConstructionError| EmitError::new(&desc, err);

        let span = match self.spans.get(&id) {
            Some(span) => span.clone(),
            None => return Err(error(ConstructionError::Unregistered(id))),
        };
        let kind = desc.kind();
        if span.kind != kind {
            return Err(error(ConstructionError::Kind {
                id,
                expected: span.kind,
                found: kind,
            }));
        }
        let found = desc.operands().len() + kind.workspace_slot().map_or(0, |_| 1);
        if found != span.memories.len() {
            return Err(error(ConstructionError::Operands {
                expected: span.memories.len(),
                found,
            }));
        }
        validate(&desc).map_err(error)?;
        #[cfg(feature = "strict")]
        self.check_rebuild(&span, &desc).map_err(error)?;

        let staged = self.stage(&desc).map_err(error)?;
        let workspace = staged.workspace.map(|buffer| self.insert_workspace(buffer));

        let mut replaced = Vec::with_capacity(span.memories.len() + span.stages.len());
        for (index, (desc, handle)) in span.memories.clone().zip_eq(staged.memories) {
            let slot = Slot::Memory { desc, handle };
            replaced.push(std::mem::replace(&mut self.slots[index], slot));
        }
        for (index, (desc, handle)) in span.stages.clone().zip_eq(staged.stages) {
            let slot = Slot::Compute { desc, handle };
            replaced.push(std::mem::replace(&mut self.slots[index], slot));
        }

        self.record(span, workspace);
        for handle in replaced.into_iter().filter_map(Slot::into_handle) {
            self.engine.release(handle);
        }

        log::debug!("rebuild {kind} over {} at {id}", desc.shape());
        Ok(())
    }

    /// Asks the vendor which weights layout it prefers for `desc`.
    pub fn query_weights_format(&self, desc: &ConvolutionDesc) -> Result<Format, EmitError> {
        let mut conv = desc.clone();
        conv.algorithm = Some(self.algorithm(conv.algorithm));
        self.engine
            .weights_format(&conv)
            .map_err(|err| EmitError::new(&PrimitiveDesc::Convolution(conv.clone()), err))
    }
}

impl<V: Vendor> Drop for Emitter<V> {
    fn drop(&mut self) {
        let slots = std::mem::take(&mut self.slots);
        let count = slots.len();
        for handle in slots.into_iter().filter_map(Slot::into_handle) {
            self.engine.release(handle);
        }
        self.engine.flush_buffers();
        log::trace!(
            "released {count} slots and {} workspaces",
            self.workspaces.len()
        );
    }
}

#[derive(Debug, Clone)]
pub struct EmitterBuilder<V> {
    pub engine: V,
    pub policy: AlgorithmPolicy,
}

impl<V: Vendor> EmitterBuilder<V> {
    pub fn new(engine: V) -> Self {
        Self {
            engine,
            policy: AlgorithmPolicy::default(),
        }
    }

    /// How convolutions without an explicit algorithm are planned.
    pub fn algorithm(mut self, policy: AlgorithmPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Emitter<V> {
        Emitter {
            engine: self.engine,
            policy: self.policy,
            slots: vec![],
            deps: HashMap::default(),
            spans: HashMap::default(),
            workspaces: vec![],
        }
    }
}
