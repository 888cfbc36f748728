//! Descriptor checks the reference engine runs before building a primitive.

use itertools::Itertools;

use crate::{
    hal::{
        ops::{
            BatchNormTrainingDesc, ConcatDesc, ConvAlgorithm, ConvolutionDesc, EltwiseAlgorithm,
            EltwiseDesc, LrnDesc, PoolingAlgorithm, PoolingBackwardDesc, PoolingDesc,
            PostOp, PrimitiveAttr, PrimitiveDesc, ReorderDesc, RnnDesc, RnnDirection, RoundMode,
            SliceDesc, SoftmaxDesc, SumDesc,
        },
        vendor::VendorError,
    },
    loom::{
        layout::Shape,
        memory::{Format, MemoryDesc},
        num::DataType,
    },
};

#[inline]
fn param(name: &'static str, reason: impl Into<String>) -> VendorError {
    VendorError::Param {
        name,
        reason: reason.into(),
    }
}

fn same_shape(operand: &'static str, expected: &Shape, found: &MemoryDesc) -> Result<(), VendorError> {
    match *expected == found.shape {
        true => Ok(()),
        false => Err(VendorError::Shape {
            operand,
            expected: expected.clone(),
            found: found.shape.clone(),
        }),
    }
}

fn same_type(operand: &'static str, expected: DataType, found: &MemoryDesc) -> Result<(), VendorError> {
    match found.r#type == expected {
        true => Ok(()),
        false => Err(VendorError::Type {
            operand,
            found: found.r#type,
        }),
    }
}

fn floating(operand: &'static str, desc: &MemoryDesc) -> Result<(), VendorError> {
    match desc.r#type.is_integer() {
        false => Ok(()),
        true => Err(VendorError::Type {
            operand,
            found: desc.r#type,
        }),
    }
}

fn lengths(name: &'static str, values: &[usize], spatial: usize) -> Result<(), VendorError> {
    match values.len() == spatial {
        true => Ok(()),
        false => Err(param(
            name,
            format!("{} values for {spatial} spatial dimensions", values.len()),
        )),
    }
}

fn nonzero(name: &'static str, values: &[usize]) -> Result<(), VendorError> {
    match values.contains(&0) {
        false => Ok(()),
        true => Err(param(name, "zero entry")),
    }
}

/// Output extent of a sliding window over a padded input.
fn window_output(input: usize, extent: usize, stride: usize, below: usize, above: usize) -> Option<usize> {
    (input + below + above)
        .checked_sub(extent)
        .map(|span| span / stride + 1)
}

/// Checks a layout a memory object can be created for.
pub fn memory(desc: &MemoryDesc) -> Result<(), VendorError> {
    match &desc.format {
        Format::Default => Ok(()),
        Format::Strided(strides) if strides.len() == desc.shape.len() => Ok(()),
        Format::Strided(strides) => Err(param(
            "strides",
            format!("{} strides for rank {}", strides.len(), desc.shape.len()),
        )),
        Format::Any | Format::Blocked => Err(VendorError::Layout(desc.clone())),
    }
}

/// Checks output scales against the destination they scale.
pub fn scales(attr: &PrimitiveAttr, dst: &MemoryDesc) -> Result<(), VendorError> {
    let Some(scales) = &attr.output_scales else {
        return Ok(());
    };
    let mask = scales.mask;
    let rank = dst.shape.len();
    if mask.checked_shr(rank as u32).unwrap_or(0) != 0 {
        return Err(param(
            "mask",
            format!("{mask:#b} selects dimensions beyond rank {rank}"),
        ));
    }

    let expected = dst
        .shape
        .iter()
        .enumerate()
        .filter(|&(axis, _)| {
            u32::try_from(axis)
                .ok()
                .and_then(|axis| 1u32.checked_shl(axis))
                .is_some_and(|bit| mask & bit != 0)
        })
        .map(|(_, &dim)| dim)
        .product();
    match scales.scales.len() == expected {
        true => Ok(()),
        false => Err(VendorError::Scales {
            mask,
            expected,
            found: scales.scales.len(),
        }),
    }
}

/// Checks the post-ops and rounding of a primitive attribute.
pub fn attributes(attr: &PrimitiveAttr) -> Result<(), VendorError> {
    for (index, op) in attr.post_ops.iter().enumerate() {
        match *op {
            PostOp::Sum { .. } if index != 0 => {
                return Err(param("post ops", format!("sum at position {index}, it must come first")));
            }
            PostOp::Sum { scale } if !scale.is_finite() => {
                return Err(param("post ops", format!("sum scale {scale} is not finite")));
            }
            PostOp::Sum { .. } => {}
            PostOp::Eltwise {
                algorithm,
                alpha,
                beta,
                scale,
            } => {
                if ![alpha, beta, scale].iter().all(|value| value.is_finite()) {
                    return Err(param("post ops", format!("{algorithm} has a non-finite parameter")));
                }
                if algorithm == EltwiseAlgorithm::BoundedRelu && alpha <= 0.0 {
                    return Err(param("post ops", format!("bound {alpha} is not positive")));
                }
            }
        }
    }
    match (attr.round_mode, &attr.output_scales) {
        (RoundMode::Down, None) => Err(param("round mode", "rounding down needs output scales")),
        _ => Ok(()),
    }
}

fn convolution_types(desc: &ConvolutionDesc) -> Result<(), VendorError> {
    use DataType::{F32, I8, I32, U8};

    let src = desc.src.r#type;
    if !src.is_integer() {
        same_type("weights", src, &desc.weights)?;
        same_type("dst", src, &desc.dst)?;
        if let Some(bias) = &desc.bias {
            same_type("bias", src, bias)?;
        }
        return Ok(());
    }

    if !matches!(src, U8 | I8) {
        return Err(VendorError::Type {
            operand: "src",
            found: src,
        });
    }
    same_type("weights", I8, &desc.weights)?;
    if !matches!(desc.dst.r#type, U8 | I8 | I32 | F32) {
        return Err(VendorError::Type {
            operand: "dst",
            found: desc.dst.r#type,
        });
    }
    match &desc.bias {
        Some(bias) if !matches!(bias.r#type, I32 | F32) => Err(VendorError::Type {
            operand: "bias",
            found: bias.r#type,
        }),
        _ => Ok(()),
    }
}

pub fn convolution(desc: &ConvolutionDesc, conv_auto: bool) -> Result<(), VendorError> {
    let rank = desc.src.shape.len();
    if rank < 3 {
        return Err(param("src", format!("rank {rank} has no spatial dimensions")));
    }
    if desc.weights.shape.len() != rank {
        return Err(param("weights", format!("rank {} for a rank {rank} input", desc.weights.shape.len())));
    }
    if desc.dst.shape.len() != rank {
        return Err(param("dst", format!("rank {} for a rank {rank} input", desc.dst.shape.len())));
    }

    let spatial = rank - 2;
    lengths("strides", &desc.strides, spatial)?;
    lengths("dilation", &desc.dilation, spatial)?;
    lengths("padding below", &desc.padding_below, spatial)?;
    lengths("padding above", &desc.padding_above, spatial)?;
    nonzero("strides", &desc.strides)?;
    nonzero("dilation", &desc.dilation)?;

    let (batch, channels) = (desc.src.shape[0], desc.src.shape[1]);
    let outputs = desc.weights.shape[0];
    if desc.weights.shape[1] != channels {
        let mut expected = desc.weights.shape.to_vec();
        expected[1] = channels;
        return Err(VendorError::Shape {
            operand: "weights",
            expected: expected.into(),
            found: desc.weights.shape.clone(),
        });
    }

    let mut expected = vec![batch, outputs];
    for axis in 0..spatial {
        let kernel = desc.weights.shape[2 + axis];
        let extent = kernel.saturating_sub(1) * desc.dilation[axis] + 1;
        let output = window_output(
            desc.src.shape[2 + axis],
            extent,
            desc.strides[axis],
            desc.padding_below[axis],
            desc.padding_above[axis],
        )
        .ok_or_else(|| param("weights", format!("kernel extent {extent} exceeds the padded input")))?;
        expected.push(output);
    }
    same_shape("dst", &expected.into(), &desc.dst)?;
    if let Some(bias) = &desc.bias {
        same_shape("bias", &[outputs].into(), bias)?;
    }

    convolution_types(desc)?;
    if desc.algorithm == Some(ConvAlgorithm::Auto) && !conv_auto {
        return Err(VendorError::Unsupported("auto convolution algorithm".into()));
    }
    scales(&desc.attr, &desc.dst)
}

pub fn pooling(desc: &PoolingDesc) -> Result<(), VendorError> {
    let rank = desc.src.shape.len();
    if rank < 3 {
        return Err(param("src", format!("rank {rank} has no spatial dimensions")));
    }
    if desc.dst.shape.len() != rank {
        return Err(param("dst", format!("rank {} for a rank {rank} input", desc.dst.shape.len())));
    }

    let window = &desc.window;
    let spatial = rank - 2;
    lengths("window", &window.shape, spatial)?;
    lengths("strides", &window.strides, spatial)?;
    lengths("padding below", &window.padding_below, spatial)?;
    lengths("padding above", &window.padding_above, spatial)?;
    nonzero("window", &window.shape)?;
    nonzero("strides", &window.strides)?;

    let mut expected = vec![desc.src.shape[0], desc.src.shape[1]];
    for axis in 0..spatial {
        let output = window_output(
            desc.src.shape[2 + axis],
            window.shape[axis],
            window.strides[axis],
            window.padding_below[axis],
            window.padding_above[axis],
        )
        .ok_or_else(|| param("window", "window exceeds the padded input"))?;
        expected.push(output);
    }
    same_shape("dst", &expected.into(), &desc.dst)?;
    same_type("dst", desc.src.r#type, &desc.dst)
}

fn pooling_with_indices(desc: &PoolingDesc) -> Result<(), VendorError> {
    pooling(desc)?;
    match desc.algorithm {
        PoolingAlgorithm::Max => Ok(()),
        algorithm => Err(VendorError::Unsupported(format!(
            "{algorithm} pooling with indices"
        ))),
    }
}

fn pooling_backward(desc: &PoolingBackwardDesc) -> Result<(), VendorError> {
    same_shape("diff_dst", &desc.hint.dst.shape, &desc.diff_dst)?;
    same_shape("diff_src", &desc.hint.src.shape, &desc.diff_src)?;
    floating("diff_dst", &desc.diff_dst)
}

fn lrn(desc: &LrnDesc) -> Result<(), VendorError> {
    if desc.src.shape.len() != 4 {
        return Err(param("src", format!("rank {} where 4 is required", desc.src.shape.len())));
    }
    if desc.size % 2 == 0 {
        return Err(param("size", format!("{} is not odd", desc.size)));
    }
    same_shape("dst", &desc.src.shape, &desc.dst)?;
    floating("src", &desc.src)
}

fn eltwise(desc: &EltwiseDesc) -> Result<(), VendorError> {
    same_shape("dst", &desc.src.shape, &desc.dst)?;
    same_type("dst", desc.src.r#type, &desc.dst)?;
    match desc.algorithm {
        EltwiseAlgorithm::BoundedRelu if desc.alpha <= 0.0 => {
            Err(param("alpha", format!("bound {} is not positive", desc.alpha)))
        }
        _ => Ok(()),
    }
}

fn sum(desc: &SumDesc) -> Result<(), VendorError> {
    if desc.inputs.is_empty() {
        return Err(param("inputs", "nothing to sum"));
    }
    if desc.scales.len() != desc.inputs.len() {
        return Err(param(
            "scales",
            format!("{} scales for {} inputs", desc.scales.len(), desc.inputs.len()),
        ));
    }
    for input in &desc.inputs {
        same_shape("inputs", &desc.dst.shape, input)?;
        same_type("inputs", desc.dst.r#type, input)?;
    }
    Ok(())
}

fn concat(desc: &ConcatDesc) -> Result<(), VendorError> {
    let rank = desc.dst.shape.len();
    if desc.inputs.is_empty() {
        return Err(param("inputs", "nothing to concatenate"));
    }
    if desc.axis >= rank {
        return Err(param("axis", format!("{} is outside rank {rank}", desc.axis)));
    }

    let mut extent = 0;
    for input in &desc.inputs {
        let matches = input.shape.len() == rank
            && (0..rank)
                .filter(|&axis| axis != desc.axis)
                .all(|axis| input.shape[axis] == desc.dst.shape[axis]);
        if !matches {
            let mut expected = desc.dst.shape.to_vec();
            expected[desc.axis] = input.shape.dim(desc.axis).unwrap_or(0);
            return Err(VendorError::Shape {
                operand: "inputs",
                expected: expected.into(),
                found: input.shape.clone(),
            });
        }
        same_type("inputs", desc.dst.r#type, input)?;
        extent += input.shape[desc.axis];
    }
    match extent == desc.dst.shape[desc.axis] {
        true => Ok(()),
        false => Err(param(
            "dst",
            format!("axis {} holds {} but inputs add up to {extent}", desc.axis, desc.dst.shape[desc.axis]),
        )),
    }
}

fn softmax(desc: &SoftmaxDesc) -> Result<(), VendorError> {
    let rank = desc.src.shape.len();
    match desc.axes[..] {
        [axis] if axis < rank => {}
        [axis] => return Err(param("axis", format!("{axis} is outside rank {rank}"))),
        _ => {
            return Err(VendorError::Unsupported(format!(
                "softmax over axes [{}]",
                desc.axes.iter().format(", ")
            )));
        }
    }
    same_shape("dst", &desc.src.shape, &desc.dst)?;
    floating("src", &desc.src)
}

/// Checks the statistics of a batch normalization over `src`.
fn batch_norm(
    src: &MemoryDesc,
    weights: &MemoryDesc,
    mean: &MemoryDesc,
    variance: &MemoryDesc,
    epsilon: f32,
) -> Result<(), VendorError> {
    let Some(channels) = src.shape.dim(1) else {
        return Err(param("src", "no channel dimension"));
    };
    same_shape("weights", &[2, channels].into(), weights)?;
    same_shape("mean", &[channels].into(), mean)?;
    same_shape("variance", &[channels].into(), variance)?;
    floating("src", src)?;
    match epsilon > 0.0 {
        true => Ok(()),
        false => Err(param("epsilon", format!("{epsilon} is not positive"))),
    }
}

fn batch_norm_training(desc: &BatchNormTrainingDesc) -> Result<(), VendorError> {
    batch_norm(&desc.src, &desc.weights, &desc.mean, &desc.variance, desc.epsilon)?;
    same_shape("dst", &desc.src.shape, &desc.dst)
}

/// Dimensions `(T, N, C)` of the layer input.
pub fn rnn_dims(desc: &RnnDesc) -> Result<(usize, usize, usize), VendorError> {
    match desc.src_layer.shape[..] {
        [steps, batch, channels] => Ok((steps, batch, channels)),
        _ => Err(param(
            "src_layer",
            format!("rank {} where 3 is required", desc.src_layer.shape.len()),
        )),
    }
}

fn rnn(desc: &RnnDesc) -> Result<(), VendorError> {
    let (steps, batch, channels) = rnn_dims(desc)?;
    let Some(layers) = desc.src_iter.shape.first().copied() else {
        return Err(param("src_iter", "rank 0"));
    };
    let directions = desc.direction.count();
    let states = desc.cell.states();
    let gates = desc.cell.gates();
    let outputs = match desc.direction {
        RnnDirection::BidirectionalConcat => channels * directions,
        _ => channels,
    };

    let state: Shape = [layers, directions, states, batch, channels].into();
    let weights: Shape = [layers, directions, channels, gates, channels].into();
    same_shape("src_iter", &state, &desc.src_iter)?;
    same_shape("weights_layer", &weights, &desc.weights_layer)?;
    same_shape("weights_iter", &weights, &desc.weights_iter)?;
    same_shape("bias", &[layers, directions, gates, channels].into(), &desc.bias)?;
    same_shape("dst_layer", &[steps, batch, outputs].into(), &desc.dst_layer)?;
    same_shape("dst_iter", &state, &desc.dst_iter)?;
    floating("src_layer", &desc.src_layer)
}

fn reorder(desc: &ReorderDesc) -> Result<(), VendorError> {
    same_shape("dst", &desc.src.shape, &desc.dst)?;
    scales(&desc.attr, &desc.dst)
}

fn slice(desc: &SliceDesc) -> Result<(), VendorError> {
    let rank = desc.src.shape.len();
    if desc.dst.shape.len() != rank {
        return Err(param("dst", format!("rank {} for a rank {rank} source", desc.dst.shape.len())));
    }
    lengths("lower bounds", &desc.lower_bounds, rank)?;
    let fits = desc
        .lower_bounds
        .iter()
        .zip_eq(desc.dst.shape.iter())
        .zip_eq(desc.src.shape.iter())
        .all(|((&lower, &extent), &bound)| lower + extent <= bound);
    if !fits {
        return Err(param(
            "lower bounds",
            format!(
                "[{}] + {} exceeds {}",
                desc.lower_bounds.iter().format(", "),
                desc.dst.shape,
                desc.src.shape
            ),
        ));
    }
    same_type("dst", desc.src.r#type, &desc.dst)
}

/// Checks a primitive descriptor the way the engine plans it.
pub fn primitive(desc: &PrimitiveDesc, conv_auto: bool) -> Result<(), VendorError> {
    if let Some(attr) = desc.attr() {
        attributes(&attr)?;
    }
    match desc {
        PrimitiveDesc::Reorder(desc) => reorder(desc),
        PrimitiveDesc::Slice(desc) => slice(desc),
        PrimitiveDesc::Convolution(desc) => convolution(desc, conv_auto),
        PrimitiveDesc::ConvolutionBackwardData(desc) => {
            convolution(&desc.hint, conv_auto)?;
            same_shape("weights", &desc.hint.weights.shape, &desc.weights)?;
            same_shape("diff_dst", &desc.hint.dst.shape, &desc.diff_dst)?;
            same_shape("diff_src", &desc.hint.src.shape, &desc.diff_src)?;
            floating("diff_dst", &desc.diff_dst)
        }
        PrimitiveDesc::ConvolutionBackwardWeights(desc) => {
            convolution(&desc.hint, conv_auto)?;
            same_shape("src", &desc.hint.src.shape, &desc.src)?;
            same_shape("diff_dst", &desc.hint.dst.shape, &desc.diff_dst)?;
            same_shape("diff_weights", &desc.hint.weights.shape, &desc.diff_weights)?;
            match (&desc.diff_bias, &desc.hint.bias) {
                (Some(diff_bias), Some(bias)) => same_shape("diff_bias", &bias.shape, diff_bias)?,
                (Some(_), None) => return Err(param("diff_bias", "forward convolution has no bias")),
                (None, _) => {}
            }
            floating("diff_dst", &desc.diff_dst)
        }
        PrimitiveDesc::Pooling(desc) => pooling(desc),
        PrimitiveDesc::MaxPoolingWithIndices(desc) => pooling_with_indices(desc),
        PrimitiveDesc::PoolingBackward(desc) => {
            pooling(&desc.hint)?;
            pooling_backward(desc)
        }
        PrimitiveDesc::MaxPoolingWithIndicesBackward(desc) => {
            pooling_with_indices(&desc.hint)?;
            pooling_backward(desc)
        }
        PrimitiveDesc::MaxPoolingBackward(_) => Err(VendorError::Unsupported(
            "fused max pooling backward as a single primitive".into(),
        )),
        PrimitiveDesc::Lrn(desc) => lrn(desc),
        PrimitiveDesc::Eltwise(desc) => eltwise(desc),
        PrimitiveDesc::EltwiseBackward(desc) => {
            eltwise(&desc.hint)?;
            if !matches!(desc.hint.algorithm, EltwiseAlgorithm::Relu | EltwiseAlgorithm::Logistic) {
                return Err(VendorError::Unsupported(format!("{} backward", desc.hint.algorithm)));
            }
            same_shape("src", &desc.hint.src.shape, &desc.src)?;
            same_shape("diff_dst", &desc.hint.dst.shape, &desc.diff_dst)?;
            same_shape("diff_src", &desc.hint.src.shape, &desc.diff_src)?;
            floating("diff_dst", &desc.diff_dst)
        }
        PrimitiveDesc::Sum(desc) => sum(desc),
        PrimitiveDesc::Concat(desc) => concat(desc),
        PrimitiveDesc::Softmax(desc) => softmax(desc),
        PrimitiveDesc::BatchNormTraining(desc) => batch_norm_training(desc),
        PrimitiveDesc::BatchNormInference(desc) => {
            batch_norm(&desc.src, &desc.weights, &desc.mean, &desc.variance, desc.epsilon)?;
            same_shape("dst", &desc.src.shape, &desc.dst)
        }
        PrimitiveDesc::BatchNormBackward(desc) => {
            let hint = &desc.hint;
            batch_norm_training(hint)?;
            same_shape("weights", &hint.weights.shape, &desc.weights)?;
            same_shape("src", &hint.src.shape, &desc.src)?;
            same_shape("mean", &hint.mean.shape, &desc.mean)?;
            same_shape("variance", &hint.variance.shape, &desc.variance)?;
            same_shape("diff_dst", &hint.dst.shape, &desc.diff_dst)?;
            same_shape("diff_src", &hint.src.shape, &desc.diff_src)?;
            same_shape("diff_weights", &hint.weights.shape, &desc.diff_weights)
        }
        PrimitiveDesc::Rnn(desc) => rnn(desc),
    }
}
