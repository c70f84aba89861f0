//! Bit-accurate interpreter for the compiled op list.
//!
//! Runs the same ops the renderer turns into Thumb code, over an arena laid
//! out exactly like the target's: data words first, weight pool appended at
//! the end. Arithmetic is done in f32 so rounding matches the FPU, and
//! memory holds raw bit patterns so half-precision conversions see the same
//! packed words the hardware would.

use std::collections::HashMap;

use crate::compile::ModelInfo;
use crate::error::CompileError;
use crate::float16::from_half;
use crate::ir::{F16Mode, Op, Reg, VcvtMode};
use crate::model::shape_elts;

/// Arena fill pattern; makes reads of unwritten words visible in outputs.
const FILL: f32 = 1000.2342;

#[derive(Debug)]
pub struct Simulator {
    ops: Vec<Op>,
    weights: Vec<u8>,
    arena_words: usize,
    input_elts: usize,
    output_off: usize,
    output_elts: usize,
}

struct State {
    mem: Vec<u32>,
    s: [u32; 32],
    regs: HashMap<Reg, i64>,
}

impl State {
    fn value(&self, r: Reg) -> Result<i64, CompileError> {
        match r {
            Reg::Const(n) => Ok(n),
            other => self
                .regs
                .get(&other)
                .copied()
                .ok_or_else(|| CompileError::internal(format!("read of undefined {:?}", other))),
        }
    }

    fn ptr(&self, r: Reg) -> Result<usize, CompileError> {
        let v = self.value(r)?;
        usize::try_from(v)
            .map_err(|_| CompileError::internal(format!("negative address in {:?}", r)))
    }

    fn s_reg(r: Reg) -> Result<usize, CompileError> {
        match r {
            Reg::S(n) if (n as usize) < 32 => Ok(n as usize),
            other => Err(CompileError::internal(format!(
                "not an s-register: {:?}",
                other
            ))),
        }
    }

    fn s_f32(&self, r: Reg) -> Result<f32, CompileError> {
        Ok(f32::from_bits(self.s[Self::s_reg(r)?]))
    }

    fn set_s_f32(&mut self, r: Reg, v: f32) -> Result<(), CompileError> {
        self.s[Self::s_reg(r)?] = v.to_bits();
        Ok(())
    }

    fn read(&self, addr: usize) -> Result<u32, CompileError> {
        self.mem
            .get(addr)
            .copied()
            .ok_or_else(|| CompileError::internal(format!("read past arena at word {}", addr)))
    }

    fn write(&mut self, addr: usize, bits: u32) -> Result<(), CompileError> {
        match self.mem.get_mut(addr) {
            Some(slot) => {
                *slot = bits;
                Ok(())
            }
            None => Err(CompileError::internal(format!(
                "write past arena at word {}",
                addr
            ))),
        }
    }
}

impl Simulator {
    pub(crate) fn new(info: &ModelInfo, ops: &[Op]) -> Simulator {
        Simulator {
            ops: ops.to_vec(),
            weights: info.weight_bytes.clone(),
            arena_words: info.arena_size,
            input_elts: shape_elts(&info.input_shape),
            output_off: info.output_offset,
            output_elts: shape_elts(&info.output_shape),
        }
    }

    /// Run the model over `input`, returning the output vector.
    pub fn run(&self, input: &[f32]) -> Result<Vec<f32>, CompileError> {
        if input.len() != self.input_elts {
            return Err(CompileError::InvalidInputSize {
                got: input.len(),
                expected: self.input_elts,
            });
        }
        let weight_words = self.weights.len() / 4;
        let mut st = State {
            mem: vec![FILL.to_bits(); self.arena_words + weight_words],
            s: [0; 32],
            regs: HashMap::new(),
        };
        for (i, chunk) in self.weights.chunks_exact(4).enumerate() {
            let bits = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            st.write(self.arena_words + i, bits)?;
        }
        for (i, v) in input.iter().enumerate() {
            st.write(i, v.to_bits())?;
        }
        self.eval(&mut st, &self.ops)?;
        let mut out = Vec::with_capacity(self.output_elts);
        for i in 0..self.output_elts {
            out.push(f32::from_bits(st.read(self.output_off + i)?));
        }
        Ok(out)
    }

    fn eval(&self, st: &mut State, ops: &[Op]) -> Result<(), CompileError> {
        for op in ops {
            self.op(st, op)?;
        }
        Ok(())
    }

    fn op(&self, st: &mut State, op: &Op) -> Result<(), CompileError> {
        match op {
            Op::Comment { .. } | Op::Label { .. } => Ok(()),
            Op::Repeat { idx, num, body, .. } => {
                for i in 0..*num {
                    st.regs.insert(*idx, i as i64);
                    self.eval(st, body)?;
                }
                st.regs.remove(idx);
                Ok(())
            }
            Op::LoadWeightAddr { dst, idx } => {
                st.regs.insert(*dst, (self.arena_words + idx) as i64);
                Ok(())
            }
            Op::LoadDataAddr { dst, idx } => {
                st.regs.insert(*dst, *idx as i64);
                Ok(())
            }
            Op::AddPtr {
                dst,
                src,
                mult,
                base,
                ..
            } => {
                let step = match src {
                    None => *mult,
                    Some(s) => mult * st.value(*s)?,
                };
                let v = st.value(*base)? + step;
                st.regs.insert(*dst, v);
                Ok(())
            }
            Op::LoadFConst { dst, num } => st.set_s_f32(*dst, *num),
            Op::Load {
                dst,
                src,
                num,
                increment,
                f16_mode,
                ..
            } => {
                if *f16_mode == F16Mode::On {
                    return Err(CompileError::internal("unexpanded half-precision load"));
                }
                let mut addr = st.ptr(*src)?;
                for k in 0..*num {
                    let bits = st.read(addr)?;
                    st.s[State::s_reg(dst.s_offset(k))?] = bits;
                    addr += 1;
                }
                if *increment {
                    st.regs.insert(*src, addr as i64);
                }
                Ok(())
            }
            Op::Store {
                dst,
                src,
                num,
                increment,
            } => {
                let mut addr = st.ptr(*dst)?;
                for k in 0..*num {
                    let bits = st.s[State::s_reg(src.s_offset(k))?];
                    st.write(addr, bits)?;
                    addr += 1;
                }
                if *increment {
                    st.regs.insert(*dst, addr as i64);
                }
                Ok(())
            }
            Op::Relu { dst } => {
                let addr = st.ptr(*dst)?;
                let bits = st.read(addr)?;
                // sign-bit test on the raw word, like the generated code
                if (bits as i32) < 0 {
                    st.write(addr, 0)?;
                }
                st.regs.insert(*dst, (addr + 1) as i64);
                Ok(())
            }
            Op::Vmul { dst, a, b } => {
                let v = st.s_f32(*a)? * st.s_f32(*b)?;
                st.set_s_f32(*dst, v)
            }
            Op::Vadd { dst, a, b } => {
                let v = st.s_f32(*a)? + st.s_f32(*b)?;
                st.set_s_f32(*dst, v)
            }
            Op::Vmax { dst, a, b } => {
                if a != dst {
                    let v = st.s_f32(*a)?;
                    st.set_s_f32(*dst, v)?;
                }
                if st.s_f32(*dst)? < st.s_f32(*b)? {
                    let v = st.s_f32(*b)?;
                    st.set_s_f32(*dst, v)?;
                }
                Ok(())
            }
            Op::Vcvt { mode, dst, src } => {
                let bits = st.s[State::s_reg(*src)?];
                let half = match mode {
                    VcvtMode::F32FromF16Bottom => bits as u16,
                    VcvtMode::F32FromF16Top => (bits >> 16) as u16,
                };
                st.set_s_f32(*dst, from_half(half))
            }
            Op::Fcall { name, dst, num } => match *name {
                "softmax" => self.softmax(st, *dst, *num),
                other => Err(CompileError::internal(format!(
                    "unknown runtime routine: {}",
                    other
                ))),
            },
        }
    }

    fn softmax(&self, st: &mut State, dst: Reg, num: usize) -> Result<(), CompileError> {
        let base = st.ptr(dst)?;
        let mut vals = Vec::with_capacity(num);
        for i in 0..num {
            vals.push(f32::from_bits(st.read(base + i)?));
        }
        let mut max = vals.first().copied().unwrap_or(0.0);
        for &v in &vals[1..] {
            if v > max {
                max = v;
            }
        }
        let mut sum = 0.0f32;
        for v in &mut vals {
            *v = (f64::from(*v - max)).exp() as f32;
            sum += *v;
        }
        for (i, v) in vals.iter().enumerate() {
            st.write(base + i, (v / sum).to_bits())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::ModelInfo;
    use crate::ir::{self, Reg};

    fn mk_info(input: usize, output: usize, arena: usize, out_off: usize) -> ModelInfo {
        ModelInfo {
            input_shape: vec![input],
            output_shape: vec![output],
            output_offset: out_off,
            arena_size: arena,
            min_arena_size: arena,
            weight_bytes: Vec::new(),
            weight_asm: String::new(),
            stats_comment: String::new(),
            include_test: false,
            test_input: None,
            test_output: None,
        }
    }

    fn weights(vals: &[f32]) -> Vec<u8> {
        let mut b = Vec::new();
        for v in vals {
            b.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        b
    }

    #[test]
    fn rejects_wrong_input_size() {
        let info = mk_info(3, 1, 4, 3);
        let sim = Simulator::new(&info, &[]);
        let err = sim.run(&[1.0]).unwrap_err();
        assert!(matches!(
            err,
            CompileError::InvalidInputSize {
                got: 1,
                expected: 3
            }
        ));
    }

    #[test]
    fn dot_product_of_input_and_weights() {
        // out[0] = sum(in[i] * w[i]) over 3 elements
        let mut info = mk_info(3, 1, 4, 3);
        info.weight_bytes = weights(&[2.0, 3.0, 4.0]);
        let mut ids = ir::IdAlloc::new();
        let ops = vec![
            ir::load_data_addr(Reg::InputPtr, 0),
            ir::load_weight_addr(Reg::KernelPtr, 0),
            ir::load0(Reg::S(0)),
            ir::repeat(&mut ids, 3, |_| {
                vec![
                    ir::load(Reg::S(1), 1, Reg::InputPtr, true),
                    ir::load(Reg::S(2), 1, Reg::KernelPtr, true),
                    ir::vmul(Reg::S(1), Reg::S(1), Reg::S(2)),
                    ir::vadd(Reg::S(0), Reg::S(0), Reg::S(1)),
                ]
            }),
            ir::load_data_addr(Reg::OutputPtr, 3),
            ir::store(Reg::OutputPtr, Reg::S(0), 1, false),
        ];
        let sim = Simulator::new(&info, &ops);
        let out = sim.run(&[1.0, 10.0, 100.0]).unwrap();
        assert_eq!(out, vec![1.0 * 2.0 + 10.0 * 3.0 + 100.0 * 4.0]);
    }

    #[test]
    fn relu_clears_the_sign_bit() {
        let info = mk_info(2, 2, 4, 0);
        let ops = vec![
            ir::load_data_addr(Reg::OutputPtr, 0),
            ir::relu(Reg::OutputPtr),
            ir::relu(Reg::OutputPtr),
        ];
        let sim = Simulator::new(&info, &ops);
        let out = sim.run(&[-1.5, 2.5]).unwrap();
        assert_eq!(out, vec![0.0, 2.5]);
    }

    #[test]
    fn half_precision_pairs_unpack_in_order() {
        use crate::float16::to_half;
        // one packed word holding (0.5, -2.0) in (bottom, top) lanes
        let lo = to_half(0.5) as u32;
        let hi = to_half(-2.0) as u32;
        let mut info = mk_info(1, 2, 3, 1);
        info.weight_bytes = ((hi << 16) | lo).to_le_bytes().to_vec();
        let raw_load = crate::ir::Op::Load {
            dst: Reg::S(4),
            src: Reg::KernelPtr,
            num: 1,
            increment: true,
            f16_mode: crate::ir::F16Mode::Off,
            raw: true,
        };
        let ops = vec![
            ir::load_weight_addr(Reg::KernelPtr, 0),
            raw_load,
            ir::vcvt(crate::ir::VcvtMode::F32FromF16Top, Reg::S(1), Reg::S(4)),
            ir::vcvt(crate::ir::VcvtMode::F32FromF16Bottom, Reg::S(0), Reg::S(4)),
            ir::load_data_addr(Reg::OutputPtr, 1),
            ir::store(Reg::OutputPtr, Reg::S(0), 2, false),
        ];
        let sim = Simulator::new(&info, &ops);
        let out = sim.run(&[0.0]).unwrap();
        assert_eq!(out, vec![0.5, -2.0]);
    }

    #[test]
    fn softmax_normalizes_in_place() {
        let info = mk_info(3, 3, 3, 0);
        let ops = vec![
            ir::load_data_addr(Reg::OutputPtr, 0),
            ir::fcall("softmax", Reg::OutputPtr, 3),
        ];
        let sim = Simulator::new(&info, &ops);
        let out = sim.run(&[1.0, 2.0, 3.0]).unwrap();
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(out[2] > out[1] && out[1] > out[0]);
    }

    #[test]
    fn max_pooling_window() {
        let mut ids = ir::IdAlloc::new();
        let info = mk_info(4, 1, 5, 4);
        let ops = vec![
            ir::load_data_addr(Reg::InputPtr, 0),
            ir::load(Reg::S(0), 1, Reg::InputPtr, true),
            ir::repeat(&mut ids, 3, |_| {
                vec![
                    ir::load(Reg::S(1), 1, Reg::InputPtr, true),
                    ir::vmax(Reg::S(0), Reg::S(0), Reg::S(1)),
                ]
            }),
            ir::load_data_addr(Reg::OutputPtr, 4),
            ir::store(Reg::OutputPtr, Reg::S(0), 1, false),
        ];
        let sim = Simulator::new(&info, &ops);
        let out = sim.run(&[-3.0, 7.0, 2.0, 5.0]).unwrap();
        assert_eq!(out, vec![7.0]);
    }
}
