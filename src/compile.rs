//! Layer lowering and the model compiler core.
//!
//! Each layer compiles to an [`Op`] list over the virtual register file
//! ([`crate::ir`]); the lists are optimized per layer, concatenated with
//! `begin_N`/`end_N` labels, and rendered to Thumb assembly
//! ([`crate::render`]). Weights are appended to a shared pool as they are
//! referenced, so the kernel pointer simply streams through flash.

use crate::error::CompileError;
use crate::float16::to_half;
use crate::ir::{self, IdAlloc, Op, Reg};
use crate::model::{
    output_shape, shape_elts, shape_to_string, Activation, CompileOptions, Layer, LayerKind,
    Model, Shape,
};
use crate::optimize::{fixup_and_mark_f16, optimize};
use crate::render;
use crate::sim::Simulator;

const NUM_FP_REGS: usize = 32;
const NUM_TMP_REGS: usize = 8;

fn s(n: usize) -> Reg {
    Reg::S(n as u8)
}

fn fix3(shape: &[usize]) -> Result<[usize; 3], CompileError> {
    match *shape {
        [h, w, c] => Ok([h, w, c]),
        [w, c] => Ok([1, w, c]),
        _ => Err(CompileError::internal(format!(
            "expected 2- or 3-dim shape, got {}",
            shape_to_string(shape)
        ))),
    }
}

// ---- weight pool ----

/// Append-only weight pool: little-endian bytes plus the matching
/// `.float`/`.float16` assembly text.
struct WeightPool {
    bytes: Vec<u8>,
    asm: String,
    float16: bool,
}

impl WeightPool {
    fn new(float16: bool) -> Self {
        WeightPool {
            bytes: Vec::new(),
            asm: String::new(),
            float16,
        }
    }

    fn add_float32(&mut self, v: f32) {
        debug_assert!(!v.is_nan());
        self.asm.push_str(&format!(".float {}\n", v));
        self.bytes.extend_from_slice(&v.to_bits().to_le_bytes());
    }

    fn add_float16(&mut self, v: f32) {
        debug_assert!(!v.is_nan());
        debug_assert_eq!(self.bytes.len() & 1, 0);
        self.asm.push_str(&format!(".float16 {}\n", v));
        self.bytes.extend_from_slice(&to_half(v).to_le_bytes());
    }

    fn add_weight(&mut self, v: f32) {
        if self.float16 {
            self.add_float16(v);
        } else {
            self.add_float32(v);
        }
    }

    /// Biases stay full precision even with half-precision weights.
    fn add_bias(&mut self, v: f32) {
        self.add_float32(v);
    }

    fn align(&mut self) {
        while self.bytes.len() & 3 != 0 {
            self.bytes.push(0);
        }
        self.asm.push_str(".balign 4\n");
    }

    /// Current pool position in words.
    fn weight_offset(&self) -> usize {
        debug_assert_eq!(self.bytes.len() & 3, 0);
        self.bytes.len() >> 2
    }
}

// ---- arena layout ----

/// Per-layer placement in the two-slot RAM arena (offsets in f32 words;
/// 0/1 are slot indices until [`assign_layer_infos`] rebases slot 1).
#[derive(Debug, Clone)]
pub(crate) struct LayerPlan {
    /// Input shape as seen by the kernel (padded when `raw_input_off` is set).
    pub input_shape: Shape,
    /// Input shape before padding.
    pub raw_input_shape: Shape,
    pub output_shape: Shape,
    pub input_off: usize,
    /// Where the unpadded input lives; `Some` iff the layer needs padding.
    pub raw_input_off: Option<usize>,
    pub output_off: usize,
}

/// Input shape a layer needs after zero padding, given its output shape.
fn padded_input_shape(
    layer: &Layer,
    input: &Shape,
    output: &Shape,
) -> Result<Shape, CompileError> {
    let mut res = input.clone();
    match &layer.kind {
        LayerKind::Conv1D {
            kernel_size,
            stride,
            ..
        } => {
            pad_dim(&mut res, 0, output[0] * stride + kernel_size - stride)?;
        }
        LayerKind::Conv2D {
            kernel_size,
            strides,
            ..
        } => {
            pad_dim(&mut res, 0, output[0] * strides[0] + kernel_size[0] - strides[0])?;
            pad_dim(&mut res, 1, output[1] * strides[1] + kernel_size[1] - strides[1])?;
        }
        LayerKind::MaxPool1D { stride, .. } => {
            let tmp = output[0] * stride;
            if tmp > res[0] {
                res[0] = tmp;
            }
        }
        LayerKind::MaxPool2D { strides, .. } => {
            for i in 0..2 {
                let tmp = output[i] * strides[i];
                if tmp > res[i] {
                    res[i] = tmp;
                }
            }
        }
        _ => {}
    }
    Ok(res)
}

fn pad_dim(res: &mut Shape, i: usize, padded: usize) -> Result<(), CompileError> {
    if padded < res[i] {
        return Err(CompileError::internal(format!(
            "padded dim {} smaller than input ({} < {})",
            i, padded, res[i]
        )));
    }
    res[i] = padded;
    Ok(())
}

pub(crate) struct ArenaLayout {
    pub plans: Vec<LayerPlan>,
    pub output_shape: Shape,
    /// Arena size in f32 words.
    pub arena_size: usize,
    /// Theoretical minimum arena size with perfect allocation.
    pub min_arena_size: usize,
}

/// Assign every layer an input and output region in a two-slot arena.
///
/// Non-in-place layers alternate between the slots; padding forces a slot
/// flip too, since the padded copy must not overlap its source. Slot 1 is
/// rebased to start right after the largest slot-0 resident.
pub(crate) fn assign_layer_infos(model: &Model) -> Result<ArenaLayout, CompileError> {
    let mut max_size = [shape_elts(&model.input_shape), 0];
    let mut curr = 0usize;
    let mut total_max = max_size[0];
    let mut prev_out = model.input_shape.clone();
    let mut plans = Vec::with_capacity(model.layers.len());

    for layer in &model.layers {
        let raw_input_shape = prev_out.clone();
        let out = output_shape(layer, &raw_input_shape)?;
        let padded = padded_input_shape(layer, &raw_input_shape, &out)?;
        let mut input_off = curr;
        let mut input_shape = raw_input_shape.clone();
        let padded_elts = shape_elts(&padded);
        let raw_input_off = if padded_elts != shape_elts(&raw_input_shape) {
            curr ^= 1;
            let raw_off = input_off;
            input_off = curr;
            input_shape = padded;
            max_size[curr] = max_size[curr].max(padded_elts);
            total_max = total_max.max(padded_elts + shape_elts(&raw_input_shape));
            Some(raw_off)
        } else {
            None
        };
        let elts = shape_elts(&out);
        if layer.kind.is_in_place() {
            total_max = total_max.max(shape_elts(&input_shape)).max(elts);
        } else {
            total_max = total_max.max(shape_elts(&input_shape) + elts);
            curr ^= 1;
        }
        let output_off = curr;
        max_size[curr] = max_size[curr].max(elts);
        prev_out = out.clone();
        plans.push(LayerPlan {
            input_shape,
            raw_input_shape,
            output_shape: out,
            input_off,
            raw_input_off,
            output_off,
        });
    }

    let mid_off = max_size[0];
    for plan in &mut plans {
        if plan.input_off != 0 {
            plan.input_off = mid_off;
        }
        if plan.output_off != 0 {
            plan.output_off = mid_off;
        }
        if plan.raw_input_off == Some(1) {
            plan.raw_input_off = Some(mid_off);
        }
    }

    let arena_size = max_size[0] + max_size[1];
    if arena_size as f64 > total_max as f64 * 1.2 {
        log::debug!(
            "possible arena shrink with wiser allocation: {:.3}x",
            arena_size as f64 / total_max as f64
        );
    }
    Ok(ArenaLayout {
        plans,
        output_shape: prev_out,
        arena_size,
        min_arena_size: total_max,
    })
}

// ---- per-layer statistics ----

/// Per-layer (or whole-model) compilation statistics.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LayerStats {
    pub name: String,
    pub input_shape: Shape,
    pub output_shape: Shape,
    pub arena_bytes: usize,
    pub code_bytes: usize,
    pub weight_bytes: usize,
    pub unoptimized_cycles: usize,
    pub optimized_cycles: usize,
    pub has_padding: bool,
}

impl LayerStats {
    fn new(name: impl Into<String>, input_shape: Shape, output_shape: Shape) -> Self {
        LayerStats {
            name: name.into(),
            input_shape,
            output_shape,
            arena_bytes: 0,
            code_bytes: 0,
            weight_bytes: 0,
            unoptimized_cycles: 0,
            optimized_cycles: 0,
            has_padding: false,
        }
    }
}

/// Statistics for a compiled model: one entry per layer plus a total.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ModelStats {
    pub layers: Vec<LayerStats>,
    pub total: LayerStats,
}

// ---- compiler ----

/// Everything the renderer and simulator need to know about a compiled
/// model, independent of the op list itself.
pub(crate) struct ModelInfo {
    pub input_shape: Shape,
    pub output_shape: Shape,
    /// Word offset of the final output within the arena.
    pub output_offset: usize,
    /// Arena size in f32 words.
    pub arena_size: usize,
    pub min_arena_size: usize,
    pub weight_bytes: Vec<u8>,
    pub weight_asm: String,
    /// The `total cycles: ...` line for the file header comment.
    pub stats_comment: String,
    pub include_test: bool,
    pub test_input: Option<Vec<f32>>,
    pub test_output: Option<Vec<f32>>,
}

struct Compiler<'a> {
    pool: WeightPool,
    ids: IdAlloc,
    opts: &'a CompileOptions,
}

impl Compiler<'_> {
    fn compile_layer(&mut self, plan: &LayerPlan, layer: &Layer) -> Result<Vec<Op>, CompileError> {
        match &layer.kind {
            LayerKind::Dense { .. } => self.compile_dense(plan, layer),
            LayerKind::Conv1D { .. } | LayerKind::Conv2D { .. } => self.compile_conv(plan, layer),
            LayerKind::MaxPool1D { .. } | LayerKind::MaxPool2D { .. } => {
                self.compile_max_pooling(plan, layer)
            }
            LayerKind::Flatten
            | LayerKind::Reshape { .. }
            | LayerKind::Dropout
            | LayerKind::Input => Ok(Vec::new()),
        }
    }

    fn add_activation(&mut self, res: &mut Vec<Op>, plan: &LayerPlan, activation: Activation) {
        let numoutp = shape_elts(&plan.output_shape);
        match activation {
            Activation::Linear => {}
            Activation::Relu => {
                res.push(ir::load_data_addr(Reg::OutputPtr, plan.output_off));
                res.push(ir::repeat(&mut self.ids, numoutp, |_| {
                    vec![ir::relu(Reg::OutputPtr)]
                }));
            }
            Activation::Softmax => {
                res.push(ir::load_data_addr(Reg::OutputPtr, plan.output_off));
                res.push(ir::fcall("softmax", Reg::OutputPtr, numoutp));
            }
        }
    }

    /// Dense layer: per unit, a chunked dot product of the input row with
    /// the unit's weight column, software-pipelined so each `vadd`
    /// consumes a `vmul` result from the previous slot.
    fn compile_dense(&mut self, plan: &LayerPlan, layer: &Layer) -> Result<Vec<Op>, CompileError> {
        let LayerKind::Dense {
            units,
            use_bias,
            activation,
            weights,
            bias,
        } = &layer.kind
        else {
            return Err(CompileError::internal("compile_dense on non-dense layer"));
        };
        let (units, use_bias, activation) = (*units, *use_bias, *activation);
        let max_chunk = (NUM_FP_REGS >> 1) - 2;
        let mem_reg0 = 1; // s1
        let flash_reg0 = mem_reg0 + max_chunk; // s15

        let inpsize = plan.input_shape[0];
        let invalid = |detail: String| CompileError::InvalidWeights {
            layer: layer.name.clone(),
            detail,
        };
        if weights.len() != inpsize {
            return Err(invalid(format!(
                "weight rows {} != input size {}",
                weights.len(),
                inpsize
            )));
        }
        if weights.iter().any(|row| row.len() != units) {
            return Err(invalid(format!("weight columns != units {}", units)));
        }
        if use_bias && bias.len() != units {
            return Err(invalid(format!(
                "bias length {} != units {}",
                bias.len(),
                units
            )));
        }

        let weights_idx = self.pool.weight_offset();
        for f in 0..units {
            if use_bias {
                self.pool.add_bias(bias[f]);
            }
            for row in weights {
                self.pool.add_weight(row[f]);
            }
            self.pool.align();
        }

        let float16 = self.opts.float16_weights;
        let input_off = plan.input_off;
        let mut res = vec![
            ir::load_weight_addr(Reg::KernelPtr, weights_idx),
            ir::load_data_addr(Reg::OutputPtr, plan.output_off),
        ];
        res.push(ir::repeat(&mut self.ids, units, |ids| {
            let mut body = Vec::new();
            if use_bias {
                body.push(ir::load(s(0), 1, Reg::KernelPtr, true));
            } else {
                body.push(ir::load0(s(0)));
            }
            body.push(ir::load_data_addr(Reg::InputPtr, input_off));
            let add_chunk = |body: &mut Vec<Op>, len: usize| {
                body.push(ir::load(s(mem_reg0), len, Reg::InputPtr, true));
                body.push(ir::load_weight(float16, s(flash_reg0), len));
                for i in 0..=len {
                    if i < len {
                        body.push(ir::vmul(s(mem_reg0 + i), s(mem_reg0 + i), s(flash_reg0 + i)));
                    }
                    if i >= 1 {
                        body.push(ir::vadd(s(0), s(0), s(mem_reg0 + i - 1)));
                    }
                }
            };
            let num_rep = inpsize / max_chunk;
            if num_rep > 0 {
                body.push(ir::repeat(ids, num_rep, |_| {
                    let mut b = Vec::new();
                    add_chunk(&mut b, max_chunk);
                    b
                }));
            }
            let left = inpsize - num_rep * max_chunk;
            if left > 0 {
                add_chunk(&mut body, left);
            }
            body.push(ir::store(Reg::OutputPtr, s(0), 1, true));
            body.push(ir::relax_weights());
            body
        }));
        self.add_activation(&mut res, plan, activation);
        Ok(res)
    }

    /// Convolution (1-D treated as height-1 2-D). Outputs are initialized
    /// with the bias, then accumulated kernel-row by kernel-row so one
    /// streamed pass over the weights suffices.
    fn compile_conv(&mut self, plan: &LayerPlan, layer: &Layer) -> Result<Vec<Op>, CompileError> {
        let (filters, kernel, strides, use_bias, activation, rows, bias) = match &layer.kind {
            LayerKind::Conv1D {
                filters,
                kernel_size,
                stride,
                use_bias,
                activation,
                weights,
                bias,
                ..
            } => (
                *filters,
                [1, *kernel_size],
                [1, *stride],
                *use_bias,
                *activation,
                std::slice::from_ref(weights),
                bias,
            ),
            LayerKind::Conv2D {
                filters,
                kernel_size,
                strides,
                use_bias,
                activation,
                weights,
                bias,
                ..
            } => (
                *filters,
                *kernel_size,
                *strides,
                *use_bias,
                *activation,
                weights.as_slice(),
                bias,
            ),
            _ => return Err(CompileError::internal("compile_conv on non-conv layer")),
        };
        let mem_regs = NUM_FP_REGS >> 1;
        let flash_regs = NUM_FP_REGS >> 1;
        let [kh, kw] = kernel;
        let [strh, strw] = strides;
        let [inph, inpw, inpch] = fix3(&plan.input_shape)?;
        let [outh, outw, outch] = fix3(&plan.output_shape)?;

        let unsupported = |detail: String| CompileError::UnsupportedLayer {
            layer: layer.name.clone(),
            detail,
        };
        let invalid = |detail: &str| CompileError::InvalidWeights {
            layer: layer.name.clone(),
            detail: detail.to_string(),
        };
        if kh > inph || kw > inpw {
            return Err(unsupported(format!(
                "kernel {}x{} larger than input {}x{}",
                kh, kw, inph, inpw
            )));
        }
        let dims_ok = rows.len() == kh
            && rows.iter().all(|r| {
                r.len() == kw
                    && r.iter().all(|cell| {
                        cell.len() == inpch && cell.iter().all(|chan| chan.len() == filters)
                    })
            });
        if !dims_ok {
            return Err(invalid("weight tensor does not match kernel/channel/filter dims"));
        }
        if outch != filters {
            return Err(CompileError::internal("output channels != filters"));
        }
        if use_bias && bias.len() != filters {
            return Err(invalid("bias length != filters"));
        }

        let weights_idx = self.pool.weight_offset();
        for f in 0..filters {
            if use_bias {
                self.pool.add_bias(bias[f]);
            }
            for row in rows {
                for cell in row {
                    for chan in cell {
                        self.pool.add_weight(chan[f]);
                    }
                }
                self.pool.align();
            }
        }

        let float16 = self.opts.float16_weights;
        let input_off = plan.input_off;
        let output_off = plan.output_off;
        let mut res = vec![ir::load_weight_addr(Reg::KernelPtr, weights_idx)];
        res.push(ir::repeat_idx(&mut self.ids, filters, |ids, filt| {
            let set_output = |r: &mut Vec<Op>| {
                r.push(ir::load_data_addr(Reg::OutputPtr, output_off));
                r.push(ir::add_ptr(Reg::OutputPtr, Some(filt), 1));
            };
            let mut r = Vec::new();
            // initialize this filter's outputs with the bias
            set_output(&mut r);
            if use_bias {
                r.push(ir::load(s(0), 1, Reg::KernelPtr, true));
            } else {
                r.push(ir::load0(s(0)));
            }
            r.push(ir::repeat(ids, outw * outh, |_| {
                vec![
                    ir::store(Reg::OutputPtr, s(0), 1, false),
                    ir::add_ptr(Reg::OutputPtr, None, filters as i64),
                ]
            }));
            r.push(ir::repeat_idx(ids, kh, |ids, kline| {
                let mut rr = Vec::new();
                let kern_sz = kw * inpch;
                let mut kern_off = 0;
                while kern_off < kern_sz {
                    let chunk = (kern_sz - kern_off).min(flash_regs);
                    rr.push(ir::load_weight(float16, s(mem_regs), chunk));
                    rr.push(ir::load_data_addr(Reg::InputPtr, input_off + kern_off));
                    rr.push(ir::add_ptr(Reg::InputPtr, Some(kline), (inpw * inpch) as i64));
                    set_output(&mut rr);
                    let w_skip = (strw * inpch) as i64;
                    let h_skip = (strh * inpw * inpch) as i64;
                    rr.push(ir::repeat(ids, outh, |ids| {
                        vec![
                            ir::repeat(ids, outw, |_| {
                                let mut b = vec![
                                    ir::load(s(0), chunk, Reg::InputPtr, true),
                                    ir::add_ptr(Reg::InputPtr, None, w_skip - chunk as i64),
                                ];
                                for i in 0..=chunk {
                                    if i < chunk {
                                        b.push(ir::vmul(s(i), s(i), s(i + mem_regs)));
                                    }
                                    if i >= 2 {
                                        b.push(ir::vadd(s(0), s(0), s(i - 1)));
                                    }
                                }
                                b.push(ir::load(s(1), 1, Reg::OutputPtr, false));
                                b.push(ir::vadd(s(0), s(0), s(1)));
                                b.push(ir::store(Reg::OutputPtr, s(0), 1, false));
                                b.push(ir::add_ptr(Reg::OutputPtr, None, filters as i64));
                                b
                            }),
                            ir::add_ptr(Reg::InputPtr, None, h_skip - outw as i64 * w_skip),
                        ]
                    }));
                    kern_off += chunk;
                }
                rr.push(ir::relax_weights());
                rr
            }));
            r.push(ir::relax_weights());
            r
        }));
        self.add_activation(&mut res, plan, activation);
        Ok(res)
    }

    /// Max pooling: one pointer register per kernel row, `vmax` folding
    /// the window into s0.
    fn compile_max_pooling(
        &mut self,
        plan: &LayerPlan,
        layer: &Layer,
    ) -> Result<Vec<Op>, CompileError> {
        let (pool, strides) = match &layer.kind {
            LayerKind::MaxPool1D {
                pool_size, stride, ..
            } => ([1, *pool_size], [1, *stride]),
            LayerKind::MaxPool2D {
                pool_size, strides, ..
            } => (*pool_size, *strides),
            _ => return Err(CompileError::internal("compile_max_pooling on non-pool layer")),
        };
        let [kh, kw] = pool;
        let [strh, strw] = strides;
        let [inph, inpw, numch] = fix3(&plan.input_shape)?;
        let [outh, outw, outch] = fix3(&plan.output_shape)?;
        if kh > inph || kw > inpw {
            return Err(CompileError::UnsupportedLayer {
                layer: layer.name.clone(),
                detail: format!("pool {}x{} larger than input {}x{}", kh, kw, inph, inpw),
            });
        }
        if numch != outch {
            return Err(CompileError::internal("pooling changed channel count"));
        }
        if kh - 1 > NUM_TMP_REGS {
            return Err(CompileError::UnsupportedLayer {
                layer: layer.name.clone(),
                detail: "too high pooling area".to_string(),
            });
        }

        let line_w = inpw * numch;
        let input_off = plan.input_off;
        let output_off = plan.output_off;
        Ok(vec![ir::repeat_idx(
            &mut self.ids,
            numch,
            |ids, filt| {
                let mut r = vec![
                    ir::load_data_addr(Reg::OutputPtr, output_off),
                    ir::add_ptr(Reg::OutputPtr, Some(filt), 1),
                    ir::load_data_addr(Reg::InputPtr, input_off),
                    ir::add_ptr(Reg::InputPtr, Some(filt), 1),
                ];
                let mut ptr_regs = vec![Reg::InputPtr];
                for i in 1..kh {
                    ptr_regs.push(Reg::Tmp((i - 1) as u32));
                    r.push(ir::add_ptr_def(
                        ptr_regs[i],
                        (line_w * i) as i64,
                        Reg::InputPtr,
                    ));
                }
                let row_adv = (strh * line_w) as i64 - (outw * strw * numch) as i64;
                r.push(ir::repeat(ids, outh, |ids| {
                    let mut rr = vec![ir::repeat(ids, outw, |_| {
                        let mut b = Vec::new();
                        for (i, &ptr) in ptr_regs.iter().enumerate() {
                            for j in 0..kw {
                                let reg = if i == 0 && j == 0 { s(0) } else { s(1) };
                                b.push(ir::load(reg, 1, ptr, true));
                                b.push(ir::add_ptr(ptr, None, numch as i64 - 1));
                                if reg != s(0) {
                                    b.push(ir::vmax(s(0), s(0), reg));
                                }
                            }
                            b.push(ir::add_ptr(
                                ptr,
                                None,
                                (strw as i64 - kw as i64) * numch as i64,
                            ));
                        }
                        b.push(ir::store(Reg::OutputPtr, s(0), 1, true));
                        b.push(ir::add_ptr(Reg::OutputPtr, None, numch as i64 - 1));
                        b
                    })];
                    for &ptr in &ptr_regs {
                        rr.push(ir::add_ptr(ptr, None, row_adv));
                    }
                    rr
                }));
                r
            },
        )])
    }

    /// Zero-pad the raw input into the padded input region: zero borders,
    /// interior copied row by row. Half the S-registers hold zeros, the
    /// other half stream data, so both walks go 16 words at a time.
    fn compile_padding(&mut self, plan: &LayerPlan) -> Result<Vec<Op>, CompileError> {
        let Some(raw_off) = plan.raw_input_off else {
            return Ok(Vec::new());
        };
        let [inpy, inpx, numch] = fix3(&plan.raw_input_shape)?;
        let [outy, outx, outch] = fix3(&plan.input_shape)?;
        if numch != outch {
            return Err(CompileError::internal("padding changed channel count"));
        }
        let padx = outx - inpx;
        let x0 = padx >> 1;
        let x1 = padx - x0;
        let pady = outy - inpy;
        let y0 = pady >> 1;
        let y1 = pady - y0;

        let num_zero = NUM_FP_REGS >> 1;
        let num_data = NUM_FP_REGS - num_zero;
        let data_reg = num_zero; // s16

        let set_zero = |res: &mut Vec<Op>, ids: &mut IdAlloc, n: usize| {
            let n = n * numch;
            let leftover = n % num_zero;
            let reps = n / num_zero;
            if reps > 0 {
                res.push(ir::repeat(ids, reps, |_| {
                    vec![ir::store(Reg::OutputPtr, s(0), num_zero, true)]
                }));
            }
            if leftover > 0 {
                res.push(ir::store(Reg::OutputPtr, s(0), leftover, true));
            }
        };
        let copy_over = |res: &mut Vec<Op>, ids: &mut IdAlloc, n: usize| {
            let n = n * numch;
            let leftover = n % num_data;
            let reps = n / num_data;
            if reps > 0 {
                res.push(ir::repeat(ids, reps, |_| {
                    vec![
                        ir::load(s(data_reg), num_data, Reg::InputPtr, true),
                        ir::store(Reg::OutputPtr, s(data_reg), num_data, true),
                    ]
                }));
            }
            if leftover > 0 {
                res.push(ir::load(s(data_reg), leftover, Reg::InputPtr, true));
                res.push(ir::store(Reg::OutputPtr, s(data_reg), leftover, true));
            }
        };

        let mut res = vec![ir::load0(s(0))];
        // materializing zeros is cheaper than loading them from memory
        for i in 1..num_zero {
            res.push(ir::vadd(s(i), s(0), s(0)));
        }
        res.push(ir::load_data_addr(Reg::InputPtr, raw_off));
        res.push(ir::load_data_addr(Reg::OutputPtr, plan.input_off));
        let top_pad = y0 * outx + x0;
        let line_pad = x1 + x0;
        let bottom_pad = x1 + y1 * outx;
        set_zero(&mut res, &mut self.ids, top_pad);
        if inpy > 1 {
            res.push(ir::repeat(&mut self.ids, inpy - 1, |ids| {
                let mut b = Vec::new();
                copy_over(&mut b, &mut *ids, inpx);
                set_zero(&mut b, &mut *ids, line_pad);
                b
            }));
        }
        copy_over(&mut res, &mut self.ids, inpx);
        set_zero(&mut res, &mut self.ids, bottom_pad);
        Ok(res)
    }
}

/// Run the f16 fixup and optimizer over one layer's ops, updating the
/// layer's cycle stats and prepending a cycle-count comment.
fn optimize_with_comment(
    opts: &CompileOptions,
    ops: Vec<Op>,
    stats: &mut LayerStats,
) -> Result<(Vec<Op>, String), CompileError> {
    let ops = if opts.float16_weights {
        fixup_and_mark_f16(&ops)?
    } else {
        ops
    };
    let c0 = ir::num_cycles(&ops);
    let mut ops = if opts.optimize { optimize(&ops) } else { ops };
    let c1 = ir::num_cycles(&ops);
    stats.unoptimized_cycles += c0;
    stats.optimized_cycles += c1;
    let optinfo = if c0 > 0 {
        let rate = 100.0 * (c0 - c1) as f64 / c0 as f64;
        format!("{} cycles ({:.1}% opt)", c1, rate)
    } else {
        "(no computation)".to_string()
    };
    if c0 > 0 {
        ops.insert(0, ir::comment(optinfo.clone()));
    }
    Ok((ops, optinfo))
}

/// Result of the core compilation: the flattened op list, the rendered
/// Thumb source, and everything needed to assemble/simulate it.
pub(crate) struct CoreModel {
    pub info: ModelInfo,
    pub ops: Vec<Op>,
    pub thumb: String,
    pub stats: ModelStats,
}

pub(crate) fn compile_model_core(
    model: &Model,
    opts: &CompileOptions,
) -> Result<CoreModel, CompileError> {
    if model.layers.is_empty() {
        return Err(CompileError::internal("model has no layers"));
    }
    let layout = assign_layer_infos(model)?;
    let mut cc = Compiler {
        pool: WeightPool::new(opts.float16_weights),
        ids: IdAlloc::new(),
        opts,
    };
    let mut ops: Vec<Op> = Vec::new();
    let mut layer_stats = Vec::with_capacity(model.layers.len());

    for (i, (layer, plan)) in model.layers.iter().zip(&layout.plans).enumerate() {
        let mut st = LayerStats::new(
            layer.name.clone(),
            plan.raw_input_shape.clone(),
            plan.output_shape.clone(),
        );
        ops.push(ir::label(format!("begin_{}", i)));
        if plan.raw_input_off.is_some() {
            let pad = cc.compile_padding(plan)?;
            let (pad_ops, _) = optimize_with_comment(opts, pad, &mut st)?;
            ops.extend(pad_ops);
            st.arena_bytes =
                (shape_elts(&plan.raw_input_shape) + shape_elts(&plan.input_shape)) << 2;
            st.has_padding = true;
        }
        let size0 = cc.pool.weight_offset();
        let body = cc.compile_layer(plan, layer)?;
        let (mut layer_ops, optinfo) = optimize_with_comment(opts, body, &mut st)?;
        st.weight_bytes = (cc.pool.weight_offset() - size0) << 2;
        let infostr = format!(
            "Layer: {}; data: {}@{} => {}@{}",
            layer.kind.class_name(),
            shape_to_string(&plan.input_shape),
            plan.input_off,
            shape_to_string(&plan.output_shape),
            plan.output_off
        );
        log::debug!("{} {}", infostr, optinfo);
        layer_ops.insert(0, ir::comment(infostr));
        ops.extend(layer_ops);
        if st.unoptimized_cycles > 0 {
            st.arena_bytes = st
                .arena_bytes
                .max((shape_elts(&plan.input_shape) + shape_elts(&plan.output_shape)) << 2);
        }
        ops.push(ir::label(format!("end_{}", i)));
        layer_stats.push(st);
    }

    let cycles = ir::num_cycles(&ops);
    let cycleinfo = format!(
        "total cycles: {} ({:.3}ms at 84MHz)",
        cycles,
        cycles as f64 / 84000.0
    );
    log::debug!("{}", cycleinfo);

    let mut total = LayerStats::new(
        "TOTAL",
        layout.plans[0].raw_input_shape.clone(),
        layout.output_shape.clone(),
    );
    total.arena_bytes = layout.arena_size << 2;
    total.weight_bytes = cc.pool.bytes.len();
    total.unoptimized_cycles = layer_stats.iter().map(|s| s.unoptimized_cycles).sum();
    total.optimized_cycles = cycles;

    let last_plan = layout
        .plans
        .last()
        .ok_or_else(|| CompileError::internal("no layer plans"))?;
    let mut info = ModelInfo {
        input_shape: model.input_shape.clone(),
        output_shape: layout.output_shape.clone(),
        output_offset: last_plan.output_off,
        arena_size: layout.arena_size,
        min_arena_size: layout.min_arena_size,
        weight_bytes: cc.pool.bytes,
        weight_asm: cc.pool.asm,
        stats_comment: cycleinfo,
        include_test: opts.include_test,
        test_input: opts.test_input.clone(),
        test_output: opts.test_output.clone(),
    };

    // With half-precision weights the embedded reference output should come
    // from our own arithmetic, not an external float32 reference.
    if opts.include_test && opts.test_output_from_sim {
        if let Some(inp) = &opts.test_input {
            let sim = Simulator::new(&info, &ops);
            info.test_output = Some(sim.run(inp)?);
        }
    }

    let thumb = render::to_thumb(&info, &ops)?;
    Ok(CoreModel {
        info,
        ops,
        thumb,
        stats: ModelStats {
            layers: layer_stats,
            total,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, Layer, LayerKind, Model, Padding};

    fn dense(name: &str, inp: usize, units: usize, activation: Activation) -> Layer {
        Layer::new(
            name,
            LayerKind::Dense {
                units,
                use_bias: true,
                activation,
                weights: vec![vec![0.5; units]; inp],
                bias: vec![0.1; units],
            },
        )
    }

    #[test]
    fn arena_alternates_between_two_slots() {
        let model = Model::new(
            vec![33],
            vec![
                dense("d1", 33, 20, Activation::Relu),
                dense("d2", 20, 10, Activation::Relu),
                dense("d3", 10, 3, Activation::Softmax),
            ],
        );
        let layout = assign_layer_infos(&model).unwrap();
        // slot 0 holds the 33-word input (and later the 10-word buffer),
        // slot 1 the 20-word buffer; rebased offsets are 0 and 33
        assert_eq!(layout.arena_size, 53);
        assert_eq!(layout.min_arena_size, 53);
        let offs: Vec<(usize, usize)> = layout
            .plans
            .iter()
            .map(|p| (p.input_off, p.output_off))
            .collect();
        assert_eq!(offs, vec![(0, 33), (33, 0), (0, 33)]);
    }

    #[test]
    fn in_place_layers_share_the_buffer() {
        let model = Model::new(
            vec![4, 5],
            vec![
                Layer::new("f", LayerKind::Flatten),
                dense("d", 20, 3, Activation::Linear),
            ],
        );
        let layout = assign_layer_infos(&model).unwrap();
        assert_eq!(layout.plans[0].input_off, layout.plans[0].output_off);
        assert!(layout.plans[0].raw_input_off.is_none());
    }

    #[test]
    fn same_padding_gets_a_raw_region() {
        let model = Model::new(
            vec![8, 3, 1],
            vec![Layer::new(
                "c",
                LayerKind::Conv2D {
                    filters: 2,
                    kernel_size: [3, 3],
                    strides: [1, 1],
                    padding: Padding::Same,
                    use_bias: false,
                    activation: Activation::Linear,
                    weights: vec![vec![vec![vec![1.0; 2]; 1]; 3]; 3],
                    bias: vec![],
                },
            )],
        );
        let layout = assign_layer_infos(&model).unwrap();
        let plan = &layout.plans[0];
        assert_eq!(plan.raw_input_shape, vec![8, 3, 1]);
        assert_eq!(plan.input_shape, vec![10, 5, 1]);
        assert_eq!(plan.raw_input_off, Some(0));
        assert_ne!(plan.input_off, 0);
    }

    #[test]
    fn dense_weight_pool_interleaves_bias_and_weights() {
        let opts = CompileOptions::default();
        let model = Model::new(vec![3], vec![dense("d", 3, 2, Activation::Linear)]);
        let core = compile_model_core(&model, &opts).unwrap();
        // 2 units * (1 bias + 3 weights) * 4 bytes
        assert_eq!(core.info.weight_bytes.len(), 32);
        assert_eq!(core.stats.layers[0].weight_bytes, 32);
        assert!(core.info.weight_asm.contains(".float 0.1"));
        assert!(core.info.weight_asm.contains(".balign 4"));
    }

    #[test]
    fn float16_weights_halve_the_pool() {
        let mut opts = CompileOptions::default();
        opts.float16_weights = true;
        // 4 weights per unit keeps every unit word-aligned
        let model = Model::new(vec![4], vec![dense("d", 4, 2, Activation::Linear)]);
        let core = compile_model_core(&model, &opts).unwrap();
        // per unit: 4-byte bias + 4*2 bytes of halves = 12
        assert_eq!(core.info.weight_bytes.len(), 24);
        assert!(core.info.weight_asm.contains(".float16 0.5"));
    }

    #[test]
    fn layer_comments_and_labels_are_emitted() {
        let opts = CompileOptions::default();
        let model = Model::new(vec![3], vec![dense("d", 3, 2, Activation::Relu)]);
        let core = compile_model_core(&model, &opts).unwrap();
        assert!(matches!(&core.ops[0], Op::Label { name } if name == "begin_0"));
        assert!(core.ops.iter().any(
            |o| matches!(o, Op::Comment { text } if text.starts_with("Layer: Dense; data: [3]@0 => [2]@3"))
        ));
        assert!(matches!(core.ops.last(), Some(Op::Label { name }) if name == "end_0"));
    }

    #[test]
    fn total_stats_accumulate() {
        let opts = CompileOptions::default();
        let model = Model::new(
            vec![8],
            vec![
                dense("d1", 8, 4, Activation::Relu),
                dense("d2", 4, 2, Activation::Softmax),
            ],
        );
        let core = compile_model_core(&model, &opts).unwrap();
        assert_eq!(core.stats.layers.len(), 2);
        let sum: usize = core.stats.layers.iter().map(|s| s.unoptimized_cycles).sum();
        assert_eq!(core.stats.total.unoptimized_cycles, sum);
        assert!(core.stats.total.optimized_cycles > 0);
        assert!(core
            .info
            .stats_comment
            .starts_with(&format!("total cycles: {}", core.stats.total.optimized_cycles)));
    }
}
