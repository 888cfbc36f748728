use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use weft_derive::Operands;

use crate::loom::{
    layout::Shape,
    memory::{MemoryDesc, Operands},
};

/// The kind of a primitive, with the arity needed to lay out its operand slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitiveKind {
    #[display("reorder")]
    Reorder,
    #[display("slice")]
    Slice,
    #[display("convolution")]
    Convolution { bias: bool },
    #[display("convolution backward data")]
    ConvolutionBackwardData,
    #[display("convolution backward weights")]
    ConvolutionBackwardWeights { bias: bool },
    #[display("pooling")]
    Pooling,
    #[display("pooling backward")]
    PoolingBackward,
    #[display("max pooling with indices")]
    MaxPoolingWithIndices,
    #[display("max pooling with indices backward")]
    MaxPoolingWithIndicesBackward,
    #[display("max pooling backward")]
    MaxPoolingBackward,
    #[display("lrn")]
    Lrn,
    #[display("eltwise")]
    Eltwise,
    #[display("eltwise backward")]
    EltwiseBackward,
    #[display("sum of {inputs}")]
    Sum { inputs: usize },
    #[display("concat of {inputs}")]
    Concat { inputs: usize },
    #[display("softmax")]
    Softmax,
    #[display("batch norm training")]
    BatchNormTraining,
    #[display("batch norm inference")]
    BatchNormInference,
    #[display("batch norm backward")]
    BatchNormBackward,
    #[display("rnn")]
    Rnn,
}

impl PrimitiveKind {
    /// Number of buffer slots, the workspace slot included.
    pub fn operand_count(self) -> usize {
        match self {
            PrimitiveKind::Reorder
            | PrimitiveKind::Slice
            | PrimitiveKind::Pooling
            | PrimitiveKind::PoolingBackward
            | PrimitiveKind::Lrn
            | PrimitiveKind::Eltwise
            | PrimitiveKind::Softmax => 2,
            PrimitiveKind::Convolution { bias } | PrimitiveKind::ConvolutionBackwardWeights { bias } => {
                3 + bias as usize
            }
            PrimitiveKind::ConvolutionBackwardData
            | PrimitiveKind::MaxPoolingWithIndices
            | PrimitiveKind::MaxPoolingWithIndicesBackward
            | PrimitiveKind::EltwiseBackward => 3,
            PrimitiveKind::MaxPoolingBackward => 4,
            PrimitiveKind::Sum { inputs } | PrimitiveKind::Concat { inputs } => inputs + 1,
            PrimitiveKind::BatchNormInference => 5,
            PrimitiveKind::BatchNormTraining => 6,
            PrimitiveKind::BatchNormBackward => 7,
            PrimitiveKind::Rnn => 8,
        }
    }

    /// Position of the vendor-described workspace among the buffer slots.
    pub fn workspace_slot(self) -> Option<usize> {
        match self {
            PrimitiveKind::MaxPoolingWithIndices => Some(2),
            PrimitiveKind::MaxPoolingWithIndicesBackward => Some(1),
            PrimitiveKind::MaxPoolingBackward => Some(3),
            PrimitiveKind::BatchNormTraining => Some(5),
            PrimitiveKind::Rnn => Some(7),
            _ => None,
        }
    }

    /// Returns `true` if the emitter allocates and keeps a scratch buffer for the kind.
    pub fn owns_workspace(self) -> bool {
        matches!(
            self,
            PrimitiveKind::MaxPoolingBackward
                | PrimitiveKind::BatchNormTraining
                | PrimitiveKind::Rnn
        )
    }

    /// Buffer slots each built primitive binds, in execution order.
    ///
    /// Only the fused max-pooling backward builds two primitives: a forward pass that
    /// regenerates the indices, then the backward pass reading them.
    pub fn bindings(self) -> Vec<Vec<usize>> {
        match self {
            PrimitiveKind::MaxPoolingBackward => vec![vec![0, 2, 3], vec![1, 3, 2]],
            kind => vec![(0..kind.operand_count()).collect()],
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ConvAlgorithm {
    #[default]
    #[display("direct")]
    Direct,
    /// Let the vendor choose per shape.
    #[display("auto")]
    Auto,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PoolingAlgorithm {
    #[default]
    #[display("max")]
    Max,
    #[display("avg include padding")]
    AvgIncludePadding,
    #[display("avg exclude padding")]
    AvgExcludePadding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EltwiseAlgorithm {
    #[display("relu")]
    Relu,
    /// Relu with negative slope `alpha`.
    #[display("leaky relu")]
    LeakyRelu,
    /// Relu clipped at `alpha`.
    #[display("bounded relu")]
    BoundedRelu,
    #[display("logistic")]
    Logistic,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RoundMode {
    #[default]
    #[display("nearest")]
    Nearest,
    #[display("down")]
    Down,
}

/// An operation fused after the primitive's main computation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PostOp {
    Eltwise {
        algorithm: EltwiseAlgorithm,
        alpha: f32,
        beta: f32,
        scale: f32,
    },
    /// Accumulates into the existing destination contents.
    Sum { scale: f32 },
}

/// Output scaling of a quantized primitive.
///
/// Bit `i` of `mask` set means dimension `i` of the destination has its own scale.
/// A zero mask applies one global scale.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputScales {
    pub mask: u32,
    pub scales: Vec<f32>,
}

impl OutputScales {
    #[inline]
    pub fn single(scale: f32) -> Self {
        Self {
            mask: 0,
            scales: vec![scale],
        }
    }

    /// One scale per channel, the destination's dimension 1.
    #[inline]
    pub fn per_channel(scales: impl Into<Vec<f32>>) -> Self {
        Self {
            mask: 1 << 1,
            scales: scales.into(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PrimitiveAttr {
    pub post_ops: Vec<PostOp>,
    pub output_scales: Option<OutputScales>,
    pub round_mode: RoundMode,
}

impl PrimitiveAttr {
    /// Quantizing attribute: the given scales with round-to-nearest.
    pub fn quantize(scales: OutputScales) -> Self {
        Self {
            post_ops: vec![],
            output_scales: Some(scales),
            round_mode: RoundMode::Nearest,
        }
    }

    /// A single fused relu.
    pub fn relu() -> Self {
        Self {
            post_ops: vec![PostOp::Eltwise {
                algorithm: EltwiseAlgorithm::Relu,
                alpha: 0.0,
                beta: 0.0,
                scale: 1.0,
            }],
            ..Default::default()
        }
    }
}

/// Layout conversion, also quantizing or dequantizing when `attr` carries output scales.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ReorderDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub attr: PrimitiveAttr,
}

/// Copies the window of `src` starting at `lower_bounds` with the shape of `dst`.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SliceDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub lower_bounds: Vec<usize>,
}

/// Forward convolution. Tensors are `[N, C, spatial..]`, weights `[O, C, kernel..]`.
///
/// Dilation counts the distance between kernel taps, so `1` is a dense kernel.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvolutionDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub weights: MemoryDesc,
    #[operand]
    pub bias: Option<MemoryDesc>,
    #[operand]
    pub dst: MemoryDesc,
    pub strides: Vec<usize>,
    pub dilation: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
    /// `None` leaves the choice to the emitter's policy.
    pub algorithm: Option<ConvAlgorithm>,
    pub attr: PrimitiveAttr,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvolutionBackwardDataDesc {
    pub hint: ConvolutionDesc,
    #[operand]
    pub weights: MemoryDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_src: MemoryDesc,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConvolutionBackwardWeightsDesc {
    pub hint: ConvolutionDesc,
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_weights: MemoryDesc,
    #[operand]
    pub diff_bias: Option<MemoryDesc>,
}

/// Spatial window of a pooling primitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolingWindow {
    pub shape: Vec<usize>,
    pub strides: Vec<usize>,
    pub padding_below: Vec<usize>,
    pub padding_above: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolingDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub algorithm: PoolingAlgorithm,
    pub window: PoolingWindow,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolingBackwardDesc {
    pub hint: PoolingDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_src: MemoryDesc,
}

/// Max-pooling backward that recomputes its own indices from the forward input.
///
/// The forward pass is planned over `diff_src -> diff_dst` and writes into the
/// `diff_src` buffer as scratch, which always holds at least as many elements as
/// the pooled output.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MaxPoolingBackwardDesc {
    #[operand]
    pub fprop_src: MemoryDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_src: MemoryDesc,
    pub window: PoolingWindow,
}

impl MaxPoolingBackwardDesc {
    /// The forward configuration both halves are planned against.
    pub fn forward(&self) -> PoolingDesc {
        PoolingDesc {
            src: self.diff_src.clone(),
            dst: self.diff_dst.clone(),
            algorithm: PoolingAlgorithm::Max,
            window: self.window.clone(),
        }
    }

    pub fn backward(&self) -> PoolingBackwardDesc {
        PoolingBackwardDesc {
            hint: self.forward(),
            diff_dst: self.diff_dst.clone(),
            diff_src: self.diff_src.clone(),
        }
    }
}

/// Local response normalization across channels.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LrnDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub size: usize,
    pub alpha: f32,
    pub beta: f32,
    pub bias: f32,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EltwiseDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub algorithm: EltwiseAlgorithm,
    pub alpha: f32,
    pub beta: f32,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EltwiseBackwardDesc {
    pub hint: EltwiseDesc,
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_src: MemoryDesc,
}

/// Scaled elementwise sum of `inputs`.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SumDesc {
    #[operand]
    pub inputs: Vec<MemoryDesc>,
    #[operand]
    pub dst: MemoryDesc,
    pub scales: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ConcatDesc {
    #[operand]
    pub inputs: Vec<MemoryDesc>,
    #[operand]
    pub dst: MemoryDesc,
    pub axis: usize,
}

/// Softmax over `axes`. Only a single axis is supported.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SoftmaxDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub axes: Vec<usize>,
}

/// Batch normalization computing batch statistics. `weights` is `[2, C]`: scale then shift.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchNormTrainingDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub weights: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    #[operand]
    pub mean: MemoryDesc,
    #[operand]
    pub variance: MemoryDesc,
    pub epsilon: f32,
    /// Fuses a relu, whose mask lands in the workspace.
    pub fuse_relu: bool,
}

/// Batch normalization with global statistics.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchNormInferenceDesc {
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub mean: MemoryDesc,
    #[operand]
    pub variance: MemoryDesc,
    #[operand]
    pub weights: MemoryDesc,
    #[operand]
    pub dst: MemoryDesc,
    pub epsilon: f32,
    pub fuse_relu: bool,
}

#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BatchNormBackwardDesc {
    pub hint: BatchNormTrainingDesc,
    #[operand]
    pub weights: MemoryDesc,
    #[operand]
    pub src: MemoryDesc,
    #[operand]
    pub mean: MemoryDesc,
    #[operand]
    pub variance: MemoryDesc,
    #[operand]
    pub diff_dst: MemoryDesc,
    #[operand]
    pub diff_src: MemoryDesc,
    #[operand]
    pub diff_weights: MemoryDesc,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RnnCell {
    #[display("vanilla")]
    Vanilla,
    #[default]
    #[display("lstm")]
    Lstm,
    #[display("gru")]
    Gru,
}

impl RnnCell {
    pub fn gates(self) -> usize {
        match self {
            RnnCell::Vanilla => 1,
            RnnCell::Lstm => 4,
            RnnCell::Gru => 3,
        }
    }

    /// Hidden states carried between steps: `h`, plus `c` for an LSTM.
    pub fn states(self) -> usize {
        match self {
            RnnCell::Lstm => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum RnnDirection {
    #[default]
    #[display("left to right")]
    LeftToRight,
    #[display("right to left")]
    RightToLeft,
    #[display("bidirectional concat")]
    BidirectionalConcat,
    #[display("bidirectional sum")]
    BidirectionalSum,
}

impl RnnDirection {
    pub fn count(self) -> usize {
        match self {
            RnnDirection::LeftToRight | RnnDirection::RightToLeft => 1,
            _ => 2,
        }
    }
}

/// Forward recurrent network.
///
/// | operand | shape |
/// |---|---|
/// | `src_layer` | `[T, N, C]` |
/// | `src_iter` | `[L, D, S, N, C]` |
/// | `weights_layer` | `[L, D, C, G, C]` |
/// | `weights_iter` | `[L, D, C, G, C]` |
/// | `bias` | `[L, D, G, C]` |
/// | `dst_layer` | `[T, N, C * D]` for bidirectional concat, else `[T, N, C]` |
/// | `dst_iter` | `[L, D, S, N, C]` |
///
/// `L` layers, `D` directions, `S` states and `G` gates per cell.
#[derive(Debug, Clone, PartialEq, Operands)]
#[operands(crate = "crate")]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RnnDesc {
    #[operand]
    pub src_layer: MemoryDesc,
    #[operand]
    pub src_iter: MemoryDesc,
    #[operand]
    pub weights_layer: MemoryDesc,
    #[operand]
    pub weights_iter: MemoryDesc,
    #[operand]
    pub bias: MemoryDesc,
    #[operand]
    pub dst_layer: MemoryDesc,
    #[operand]
    pub dst_iter: MemoryDesc,
    pub cell: RnnCell,
    pub direction: RnnDirection,
}

/// Everything the emitter can build.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitiveDesc {
    Reorder(ReorderDesc),
    Slice(SliceDesc),
    Convolution(ConvolutionDesc),
    ConvolutionBackwardData(ConvolutionBackwardDataDesc),
    ConvolutionBackwardWeights(ConvolutionBackwardWeightsDesc),
    /// Forward inference pooling.
    Pooling(PoolingDesc),
    PoolingBackward(PoolingBackwardDesc),
    /// Forward training max pooling that records argmax indices in the workspace.
    MaxPoolingWithIndices(PoolingDesc),
    MaxPoolingWithIndicesBackward(PoolingBackwardDesc),
    MaxPoolingBackward(MaxPoolingBackwardDesc),
    Lrn(LrnDesc),
    Eltwise(EltwiseDesc),
    EltwiseBackward(EltwiseBackwardDesc),
    Sum(SumDesc),
    Concat(ConcatDesc),
    Softmax(SoftmaxDesc),
    BatchNormTraining(BatchNormTrainingDesc),
    BatchNormInference(BatchNormInferenceDesc),
    BatchNormBackward(BatchNormBackwardDesc),
    Rnn(RnnDesc),
}

macro_rules! impl_from_desc {
    ($($variant:ident($desc:ty)),* $(,)?) => {
        $(
            impl From<$desc> for PrimitiveDesc {
                #[inline]
                fn from(value: $desc) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

impl_from_desc!(
    Reorder(ReorderDesc),
    Slice(SliceDesc),
    Convolution(ConvolutionDesc),
    ConvolutionBackwardData(ConvolutionBackwardDataDesc),
    ConvolutionBackwardWeights(ConvolutionBackwardWeightsDesc),
    MaxPoolingBackward(MaxPoolingBackwardDesc),
    Lrn(LrnDesc),
    Eltwise(EltwiseDesc),
    EltwiseBackward(EltwiseBackwardDesc),
    Sum(SumDesc),
    Concat(ConcatDesc),
    Softmax(SoftmaxDesc),
    BatchNormTraining(BatchNormTrainingDesc),
    BatchNormInference(BatchNormInferenceDesc),
    BatchNormBackward(BatchNormBackwardDesc),
    Rnn(RnnDesc),
);

/// Dispatches `$f` over the descriptor inside every variant.
macro_rules! visit {
    ($desc:expr, $inner:ident => $f:expr) => {
        match $desc {
            PrimitiveDesc::Reorder($inner) => $f,
            PrimitiveDesc::Slice($inner) => $f,
            PrimitiveDesc::Convolution($inner) => $f,
            PrimitiveDesc::ConvolutionBackwardData($inner) => $f,
            PrimitiveDesc::ConvolutionBackwardWeights($inner) => $f,
            PrimitiveDesc::Pooling($inner) => $f,
            PrimitiveDesc::PoolingBackward($inner) => $f,
            PrimitiveDesc::MaxPoolingWithIndices($inner) => $f,
            PrimitiveDesc::MaxPoolingWithIndicesBackward($inner) => $f,
            PrimitiveDesc::MaxPoolingBackward($inner) => $f,
            PrimitiveDesc::Lrn($inner) => $f,
            PrimitiveDesc::Eltwise($inner) => $f,
            PrimitiveDesc::EltwiseBackward($inner) => $f,
            PrimitiveDesc::Sum($inner) => $f,
            PrimitiveDesc::Concat($inner) => $f,
            PrimitiveDesc::Softmax($inner) => $f,
            PrimitiveDesc::BatchNormTraining($inner) => $f,
            PrimitiveDesc::BatchNormInference($inner) => $f,
            PrimitiveDesc::BatchNormBackward($inner) => $f,
            PrimitiveDesc::Rnn($inner) => $f,
        }
    };
}

impl PrimitiveDesc {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            PrimitiveDesc::Reorder(_) => PrimitiveKind::Reorder,
            PrimitiveDesc::Slice(_) => PrimitiveKind::Slice,
            PrimitiveDesc::Convolution(desc) => PrimitiveKind::Convolution {
                bias: desc.bias.is_some(),
            },
            PrimitiveDesc::ConvolutionBackwardData(_) => PrimitiveKind::ConvolutionBackwardData,
            PrimitiveDesc::ConvolutionBackwardWeights(desc) => {
                PrimitiveKind::ConvolutionBackwardWeights {
                    bias: desc.diff_bias.is_some(),
                }
            }
            PrimitiveDesc::Pooling(_) => PrimitiveKind::Pooling,
            PrimitiveDesc::PoolingBackward(_) => PrimitiveKind::PoolingBackward,
            PrimitiveDesc::MaxPoolingWithIndices(_) => PrimitiveKind::MaxPoolingWithIndices,
            PrimitiveDesc::MaxPoolingWithIndicesBackward(_) => {
                PrimitiveKind::MaxPoolingWithIndicesBackward
            }
            PrimitiveDesc::MaxPoolingBackward(_) => PrimitiveKind::MaxPoolingBackward,
            PrimitiveDesc::Lrn(_) => PrimitiveKind::Lrn,
            PrimitiveDesc::Eltwise(_) => PrimitiveKind::Eltwise,
            PrimitiveDesc::EltwiseBackward(_) => PrimitiveKind::EltwiseBackward,
            PrimitiveDesc::Sum(desc) => PrimitiveKind::Sum {
                inputs: desc.inputs.len(),
            },
            PrimitiveDesc::Concat(desc) => PrimitiveKind::Concat {
                inputs: desc.inputs.len(),
            },
            PrimitiveDesc::Softmax(_) => PrimitiveKind::Softmax,
            PrimitiveDesc::BatchNormTraining(_) => PrimitiveKind::BatchNormTraining,
            PrimitiveDesc::BatchNormInference(_) => PrimitiveKind::BatchNormInference,
            PrimitiveDesc::BatchNormBackward(_) => PrimitiveKind::BatchNormBackward,
            PrimitiveDesc::Rnn(_) => PrimitiveKind::Rnn,
        }
    }

    /// Shape the primitive is reported against in errors: its first operand's.
    pub fn shape(&self) -> Shape {
        self.operands()
            .first()
            .map(|desc| desc.shape.clone())
            .unwrap_or_default()
    }

    /// Forward configuration a backward descriptor is planned against.
    pub fn hint(&self) -> Option<PrimitiveDesc> {
        match self {
            PrimitiveDesc::ConvolutionBackwardData(desc) => {
                Some(PrimitiveDesc::Convolution(desc.hint.clone()))
            }
            PrimitiveDesc::ConvolutionBackwardWeights(desc) => {
                Some(PrimitiveDesc::Convolution(desc.hint.clone()))
            }
            PrimitiveDesc::PoolingBackward(desc) => Some(PrimitiveDesc::Pooling(desc.hint.clone())),
            PrimitiveDesc::MaxPoolingWithIndicesBackward(desc) => {
                Some(PrimitiveDesc::MaxPoolingWithIndices(desc.hint.clone()))
            }
            PrimitiveDesc::MaxPoolingBackward(desc) => {
                Some(PrimitiveDesc::MaxPoolingWithIndices(desc.forward()))
            }
            PrimitiveDesc::EltwiseBackward(desc) => Some(PrimitiveDesc::Eltwise(desc.hint.clone())),
            PrimitiveDesc::BatchNormBackward(desc) => {
                Some(PrimitiveDesc::BatchNormTraining(desc.hint.clone()))
            }
            _ => None,
        }
    }

    /// The primitives built for this descriptor, matching [`PrimitiveKind::bindings`].
    pub fn stages(&self) -> Vec<PrimitiveDesc> {
        match self {
            PrimitiveDesc::MaxPoolingBackward(desc) => vec![
                PrimitiveDesc::MaxPoolingWithIndices(desc.forward()),
                PrimitiveDesc::MaxPoolingWithIndicesBackward(desc.backward()),
            ],
            desc => vec![desc.clone()],
        }
    }

    /// Applies `f` to every convolution configuration, forward hints included.
    pub fn for_each_convolution(&mut self, mut f: impl FnMut(&mut ConvolutionDesc)) {
        match self {
            PrimitiveDesc::Convolution(desc) => f(desc),
            PrimitiveDesc::ConvolutionBackwardData(desc) => f(&mut desc.hint),
            PrimitiveDesc::ConvolutionBackwardWeights(desc) => f(&mut desc.hint),
            _ => {}
        }
    }

    /// Attribute the primitive is built with. A batch norm with `fuse_relu` carries a
    /// relu post-op.
    pub fn attr(&self) -> Option<PrimitiveAttr> {
        match self {
            PrimitiveDesc::Reorder(desc) => Some(desc.attr.clone()),
            PrimitiveDesc::Convolution(desc) => Some(desc.attr.clone()),
            PrimitiveDesc::BatchNormTraining(desc) => desc.fuse_relu.then(PrimitiveAttr::relu),
            PrimitiveDesc::BatchNormInference(desc) => desc.fuse_relu.then(PrimitiveAttr::relu),
            _ => None,
        }
    }
}

impl Operands for PrimitiveDesc {
    fn operands(&self) -> Vec<&MemoryDesc> {
        visit!(self, desc => desc.operands())
    }

    fn operand_names(&self) -> Vec<&'static str> {
        visit!(self, desc => desc.operand_names())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ConvolutionDesc, MaxPoolingBackwardDesc, PoolingWindow, PrimitiveAttr, PrimitiveDesc,
        PrimitiveKind, SumDesc,
    };
    use crate::loom::{
        memory::{MemoryDesc, Operands},
        num::DataType,
    };

    fn conv(bias: bool) -> ConvolutionDesc {
        ConvolutionDesc {
            src: MemoryDesc::dense([1, 3, 8, 8], DataType::F32),
            weights: MemoryDesc::dense([4, 3, 3, 3], DataType::F32),
            bias: bias.then(|| MemoryDesc::dense([4], DataType::F32)),
            dst: MemoryDesc::dense([1, 4, 6, 6], DataType::F32),
            strides: vec![1, 1],
            dilation: vec![1, 1],
            padding_below: vec![0, 0],
            padding_above: vec![0, 0],
            algorithm: None,
            attr: PrimitiveAttr::default(),
        }
    }

    #[test]
    fn test_operand_order() {
        let desc = PrimitiveDesc::from(conv(true));
        assert_eq!(desc.kind(), PrimitiveKind::Convolution { bias: true });
        assert_eq!(desc.operand_names(), ["src", "weights", "bias", "dst"]);
        assert_eq!(desc.kind().operand_count(), 4);

        let desc = PrimitiveDesc::from(conv(false));
        assert_eq!(desc.operand_names(), ["src", "weights", "dst"]);
        assert_eq!(desc.kind().operand_count(), 3);
        assert_eq!(format!("{}", desc.shape()), "[1, 3, 8, 8]");

        let input = MemoryDesc::dense([2, 2], DataType::F32);
        let desc = PrimitiveDesc::from(SumDesc {
            inputs: vec![input.clone(), input.clone(), input.clone()],
            dst: input,
            scales: vec![1.0; 3],
        });
        assert_eq!(desc.kind(), PrimitiveKind::Sum { inputs: 3 });
        assert_eq!(desc.operands().len(), desc.kind().operand_count());
        assert_eq!(desc.operand_names(), ["inputs", "inputs", "inputs", "dst"]);
    }

    #[test]
    fn test_workspace_slots() {
        for kind in [
            PrimitiveKind::MaxPoolingWithIndices,
            PrimitiveKind::MaxPoolingWithIndicesBackward,
            PrimitiveKind::MaxPoolingBackward,
            PrimitiveKind::BatchNormTraining,
            PrimitiveKind::Rnn,
        ] {
            let slot = kind.workspace_slot().unwrap();
            assert!(slot < kind.operand_count());
            for bindings in kind.bindings() {
                assert!(bindings.contains(&slot), "{kind} does not bind its workspace");
            }
        }
        assert_eq!(PrimitiveKind::Softmax.workspace_slot(), None);
    }

    #[test]
    fn test_fused_stages() {
        let window = PoolingWindow {
            shape: vec![2, 2],
            strides: vec![2, 2],
            padding_below: vec![0, 0],
            padding_above: vec![0, 0],
        };
        let desc = PrimitiveDesc::from(MaxPoolingBackwardDesc {
            fprop_src: MemoryDesc::dense([1, 1, 4, 4], DataType::F32),
            diff_dst: MemoryDesc::dense([1, 1, 2, 2], DataType::F32),
            diff_src: MemoryDesc::dense([1, 1, 4, 4], DataType::F32),
            window,
        });
        let stages = desc.stages();
        assert_eq!(stages.len(), desc.kind().bindings().len());
        assert_eq!(stages[0].kind(), PrimitiveKind::MaxPoolingWithIndices);
        assert_eq!(stages[1].kind(), PrimitiveKind::MaxPoolingWithIndicesBackward);
        assert_eq!(stages[1].hint(), Some(stages[0].clone()));
    }
}
