//! Top-level driver: render, assemble, size-check and validate a model.
//!
//! The binary image is self-describing: a fixed header of `.word`s (magic,
//! section offsets, arena size, shapes), the model code, runtime helpers,
//! the weight pool and optional embedded test vectors. [`read_stats`]
//! decodes the header back out of the assembled bytes.

use std::collections::HashMap;

use crate::asm::File;
use crate::compile::{self, ModelStats};
use crate::error::{CompileError, Mismatch};
use crate::model::{CompileOptions, Model};
use crate::processor::Processor;
use crate::sim::Simulator;
use crate::thumb::ThumbProcessor;

/// Validation tolerance with float32 weights.
pub const EPS_F32: f32 = 0.00002;
/// Validation tolerance with float16 weights.
pub const EPS_F16: f32 = 0.0045;

const MAGIC0: u32 = 0x3047_0f62;
/// "ML4F" in little-endian ASCII.
const MAGIC1: u32 = 0x4634_4c4d;

/// Assemble `text` with the peephole pass disabled, so label arithmetic in
/// the header stays valid against the emitted code.
pub(crate) fn assemble(
    proc: &dyn Processor,
    text: &str,
) -> Result<(Vec<u8>, HashMap<String, i64>), CompileError> {
    let mut f = File::new(proc);
    f.disable_peephole = true;
    f.emit(text);
    if let Some(err) = f.error() {
        return Err(CompileError::Assembly(err));
    }
    Ok((f.bytes(), f.label_addresses()))
}

/// Section sizes decoded from an assembled image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Whole image, header to `_end`, in bytes.
    pub total_size: u32,
    pub header_size: u32,
    /// Model code and runtime helpers.
    pub code_size: u32,
    pub weight_size: u32,
    /// Embedded test vectors, zero when none.
    pub test_size: u32,
    /// RAM arena requirement in bytes, descriptor words included.
    pub arena_size: u32,
}

fn header_word(bin: &[u8], idx: usize) -> Result<u32, CompileError> {
    let off = idx * 4;
    match bin.get(off..off + 4) {
        Some(b) => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(CompileError::internal("image too short for its header")),
    }
}

/// Decode the section sizes out of an assembled image.
pub fn read_stats(bin: &[u8]) -> Result<MemoryStats, CompileError> {
    if header_word(bin, 0)? != MAGIC0 || header_word(bin, 1)? != MAGIC1 {
        return Err(CompileError::internal("bad magic in image header"));
    }
    let header_size = header_word(bin, 2)?;
    let total_size = header_word(bin, 3)?;
    let weights_off = header_word(bin, 4)?;
    let test_inp_off = header_word(bin, 5)?;
    let arena_size = header_word(bin, 7)?;
    let model_size = if test_inp_off == 0 {
        total_size
    } else {
        test_inp_off
    };
    Ok(MemoryStats {
        total_size,
        header_size,
        code_size: weights_off - header_size,
        weight_size: model_size - weights_off,
        test_size: total_size - model_size,
        arena_size,
    })
}

/// A fully compiled model: assembly text, machine code, statistics, and a
/// simulator that reproduces the generated code's arithmetic.
#[derive(Debug)]
pub struct CompiledModel {
    pub thumb_text: String,
    pub machine_code: Vec<u8>,
    pub stats: ModelStats,
    pub memory: MemoryStats,
    pub simulator: Simulator,
    eps: f32,
}

impl CompiledModel {
    /// Run the model on `input` through the simulator.
    pub fn run(&self, input: &[f32]) -> Result<Vec<f32>, CompileError> {
        self.simulator.run(input)
    }

    /// Tolerance appropriate for this model's weight precision.
    #[must_use]
    pub fn eps(&self) -> f32 {
        self.eps
    }
}

/// Compile `model` down to a Thumb binary image.
pub fn compile_model(
    model: &Model,
    opts: &CompileOptions,
) -> Result<CompiledModel, CompileError> {
    let core = compile::compile_model_core(model, opts)?;
    let proc = ThumbProcessor::new();
    let (machine_code, labels) = assemble(&proc, &core.thumb)?;
    let memory = read_stats(&machine_code)?;
    log::info!(
        "compiled: {} bytes total, {} code, {} weights, {} arena",
        memory.total_size,
        memory.code_size,
        memory.weight_size,
        memory.arena_size
    );

    if let Some(limit) = opts.flash_size {
        if memory.total_size > limit {
            return Err(CompileError::ProgramTooBig {
                size: memory.total_size,
                limit,
            });
        }
    }

    let mut stats = core.stats;
    for (i, st) in stats.layers.iter_mut().enumerate() {
        let begin = labels.get(&format!("begin_{}", i));
        let end = labels.get(&format!("end_{}", i));
        if let (Some(&b), Some(&e)) = (begin, end) {
            st.code_bytes = (e - b) as usize;
        }
    }
    stats.total.code_bytes = memory.code_size as usize;

    let simulator = Simulator::new(&core.info, &core.ops);
    let eps = if opts.float16_weights { EPS_F16 } else { EPS_F32 };
    Ok(CompiledModel {
        thumb_text: core.thumb,
        machine_code,
        stats,
        memory,
        simulator,
        eps,
    })
}

/// Absolute-or-relative closeness test used for output validation.
#[must_use]
pub fn is_near(a: f32, b: f32, eps: f32) -> bool {
    let diff = (a - b).abs();
    if diff < eps {
        return true;
    }
    diff / (a.abs() + b.abs()) < eps
}

/// Run `input` through the compiled model and compare against `expected`.
pub fn validate(
    compiled: &CompiledModel,
    input: &[f32],
    expected: &[f32],
) -> Result<(), CompileError> {
    let actual = compiled.run(input)?;
    let mut mismatches = Vec::new();
    for (i, (&e, &a)) in expected.iter().zip(&actual).enumerate() {
        if !is_near(e, a, compiled.eps) {
            log::debug!("at {} {} - {} = {}", i, e, a, e - a);
            mismatches.push(Mismatch {
                index: i,
                expected: e,
                actual: a,
            });
            if mismatches.len() > 5 {
                break;
            }
        }
    }
    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(CompileError::ValidationMismatch {
            mismatches,
            eps: compiled.eps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Activation, Layer, LayerKind};

    fn tiny_dense() -> Model {
        // 3 inputs -> 2 units, explicit weights and bias
        Model::new(
            vec![3],
            vec![Layer::new(
                "d0",
                LayerKind::Dense {
                    units: 2,
                    use_bias: true,
                    activation: Activation::Linear,
                    weights: vec![
                        vec![1.0, -1.0],
                        vec![0.5, 0.25],
                        vec![2.0, 0.0],
                    ],
                    bias: vec![0.125, -0.5],
                },
            )],
        )
    }

    fn reference(input: &[f32]) -> Vec<f32> {
        let w = [[1.0f32, -1.0], [0.5, 0.25], [2.0, 0.0]];
        let b = [0.125f32, -0.5];
        (0..2)
            .map(|u| {
                let mut acc = b[u];
                for (i, &x) in input.iter().enumerate() {
                    acc += x * w[i][u];
                }
                acc
            })
            .collect()
    }

    #[test]
    fn image_header_round_trips() {
        let c = compile_model(&tiny_dense(), &CompileOptions::default()).unwrap();
        let m = read_stats(&c.machine_code).unwrap();
        assert_eq!(m, c.memory);
        assert_eq!(m.total_size as usize, c.machine_code.len());
        // 5 weight words (bias0, w00, w10, w20, bias1) + 3 more + padding
        assert_eq!(m.weight_size, 8 * 4);
        assert!(m.code_size > 0);
        assert_eq!(m.test_size, 0);
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(read_stats(&[0u8; 64]).is_err());
        assert!(read_stats(&[0u8; 3]).is_err());
    }

    #[test]
    fn simulator_matches_the_float_reference() {
        let c = compile_model(&tiny_dense(), &CompileOptions::default()).unwrap();
        let input = [0.5f32, -1.5, 3.0];
        let out = c.run(&input).unwrap();
        assert_eq!(out, reference(&input));
    }

    #[test]
    fn validate_reports_mismatches() {
        let c = compile_model(&tiny_dense(), &CompileOptions::default()).unwrap();
        let input = [1.0f32, 1.0, 1.0];
        validate(&c, &input, &reference(&input)).unwrap();
        let err = validate(&c, &input, &[100.0, 100.0]).unwrap_err();
        match err {
            CompileError::ValidationMismatch { mismatches, eps } => {
                assert_eq!(mismatches.len(), 2);
                assert_eq!(eps, EPS_F32);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn flash_budget_is_enforced() {
        let mut opts = CompileOptions::default();
        opts.flash_size = Some(16);
        let err = compile_model(&tiny_dense(), &opts).unwrap_err();
        assert!(matches!(err, CompileError::ProgramTooBig { limit: 16, .. }));
    }

    #[test]
    fn embedded_test_vectors_grow_the_image() {
        let input = vec![1.0f32, 2.0, 3.0];
        let mut opts = CompileOptions::default();
        opts.include_test = true;
        opts.test_input = Some(input.clone());
        opts.test_output_from_sim = true;
        let c = compile_model(&tiny_dense(), &opts).unwrap();
        // input + output vectors, one f32 each element
        assert_eq!(c.memory.test_size, (3 + 2) * 4);
        let plain = compile_model(&tiny_dense(), &CompileOptions::default()).unwrap();
        assert_eq!(
            c.memory.total_size - c.memory.test_size,
            plain.memory.total_size
        );
    }

    #[test]
    fn near_comparison_is_absolute_or_relative() {
        assert!(is_near(1.0, 1.0, EPS_F32));
        // absolute: tiny values near zero
        assert!(is_near(0.0, 0.00001, EPS_F32));
        // relative: large values differing by a small fraction
        assert!(is_near(100000.0, 100000.5, EPS_F32));
        assert!(!is_near(1.0, 1.1, EPS_F32));
    }
}
