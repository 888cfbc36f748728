use std::error::Error;

use itertools::Itertools;

use weft::{
    hal::{
        cpu::Reference,
        emitter::EmitterBuilder,
        ops::{
            ConvolutionDesc, EltwiseAlgorithm, EltwiseDesc, MaxPoolingBackwardDesc, PoolingAlgorithm,
            PoolingDesc, PoolingWindow, PrimitiveAttr, PrimitiveDesc, PrimitiveKind,
        },
    },
    loom::{
        device::{DeviceMemory, Host, Transfer},
        magic::magic_division,
        memory::{Format, MemoryDesc},
        num::DataType,
    },
};

fn main() -> Result<(), Box<dyn Error>> {
    let engine = Reference::builder().conv_auto(true).build();
    let ledger = engine.ledger();
    let mut emitter = EmitterBuilder::new(engine).build();

    let window = PoolingWindow {
        shape: vec![2, 2],
        strides: vec![2, 2],
        padding_below: vec![0, 0],
        padding_above: vec![0, 0],
    };
    let mut conv = ConvolutionDesc {
        src: MemoryDesc::dense([1, 3, 10, 10], DataType::F32),
        weights: MemoryDesc::any([8, 3, 3, 3], DataType::F32),
        bias: Some(MemoryDesc::dense([8], DataType::F32)),
        dst: MemoryDesc::dense([1, 8, 8, 8], DataType::F32),
        strides: vec![1, 1],
        dilation: vec![1, 1],
        padding_below: vec![0, 0],
        padding_above: vec![0, 0],
        algorithm: None,
        attr: PrimitiveAttr::default(),
    };
    let format = emitter.query_weights_format(&conv)?;
    println!("weights format: {format}");
    conv.weights.format = format;

    let relu = EltwiseDesc {
        src: conv.dst.clone(),
        dst: conv.dst.clone(),
        algorithm: EltwiseAlgorithm::Relu,
        alpha: 0.0,
        beta: 0.0,
    };
    let pool = PoolingDesc {
        src: relu.dst.clone(),
        dst: MemoryDesc::dense([1, 8, 4, 4], DataType::F32),
        algorithm: PoolingAlgorithm::Max,
        window: window.clone(),
    };
    let pool_backward = MaxPoolingBackwardDesc {
        fprop_src: pool.src.clone(),
        diff_dst: pool.dst.clone(),
        diff_src: pool.src.clone(),
        window,
    };

    let ids = [
        emitter.construct(conv)?,
        emitter.construct(relu)?,
        emitter.construct(PrimitiveDesc::Pooling(pool))?,
        emitter.construct(pool_backward.clone())?,
    ];
    for id in ids {
        let deps = emitter.deps(id).ok_or("missing deps")?;
        println!("{id}: {} <- [{}]", deps.kind, deps.slots.iter().format(", "));
        if let Some(forward) = deps.forward {
            println!("  after {forward}, workspace {:?}", deps.workspace);
        }
    }

    // layouts resolved late: plan the slots first, build them once shapes are known
    let late = emitter.reserve(PrimitiveKind::MaxPoolingBackward);
    emitter.rebuild(late, pool_backward)?;
    println!("{late}: {}", emitter.state(late));

    let mut desc = ConvolutionDesc {
        src: MemoryDesc::dense([1, 3, 10, 10], DataType::F32),
        weights: MemoryDesc::new([8, 3, 3, 3], DataType::F32, Format::Blocked),
        bias: None,
        dst: MemoryDesc::dense([1, 8, 8, 8], DataType::F32),
        strides: vec![1, 1],
        dilation: vec![1, 1],
        padding_below: vec![0, 0],
        padding_above: vec![0, 0],
        algorithm: None,
        attr: PrimitiveAttr::default(),
    };
    if let Err(err) = emitter.construct(desc.clone()) {
        println!("{err}: {}", err.source);
    }
    desc.weights.format = Format::Default;
    emitter.construct(desc)?;

    // division constants handed to generated kernels
    let host = Host::builder().capacity(1 << 20).build();
    let divisors = [3u64, 7, 64, 1000];
    let mut constants = vec![];
    for divisor in divisors {
        let magic = magic_division(divisor)?;
        println!("{divisor}: {magic}");
        // generated kernels read both as 32-bit words
        constants.extend([magic.magic as i32, magic.shift as i32]);
    }
    let ptr = host.upload(&constants)?;
    let check: Vec<i32> = host.download(ptr, constants.len())?;
    assert_eq!(check, constants);

    let scratch = host.allocate(16)?;
    host.copy(Transfer::DeviceToDevice { dst: scratch, src: ptr }, 16)?;
    host.fill(scratch.offset(8), 0, 8)?;
    println!("scratch: {:?}", host.download::<i32>(scratch, 4)?);
    host.free(scratch);
    host.free(ptr);

    let slots = emitter.len();
    drop(emitter);
    println!(
        "{slots} slots, {} objects created, {} released",
        ledger.created(),
        ledger.released()
    );

    Ok(())
}
