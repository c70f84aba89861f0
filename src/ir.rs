//! Intermediate representation for compiled layer graphs.
//!
//! Layers lower to a small vector-style op list over virtual registers:
//! the 32 VFP single-precision registers, a handful of pointer registers,
//! loop index registers, and small integer constants. The op list is
//! optimized ([`crate::optimize`]) and then rendered to Thumb assembly
//! ([`crate::render`]) or interpreted directly ([`crate::sim`]).

/// Virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    /// VFP single-precision register s0..s31.
    S(u8),
    /// Current input pointer of the layer being executed.
    InputPtr,
    /// Current output pointer.
    OutputPtr,
    /// Pointer into the weight pool.
    KernelPtr,
    /// Pointer to the data descriptor at the start of the RAM arena.
    DataDescPtr,
    /// Loop index, numbered by [`IdAlloc`].
    Index(u32),
    /// Scratch integer register.
    Tmp(u32),
    /// Small integer constant.
    Const(i64),
}

impl Reg {
    pub const ZERO: Reg = Reg::Const(0);
    pub const ONE: Reg = Reg::Const(1);

    /// Shift an S-register by `k` positions; identity for other registers.
    #[must_use]
    pub(crate) fn s_offset(self, k: usize) -> Reg {
        match self {
            Reg::S(n) => Reg::S(n + k as u8),
            other => other,
        }
    }
}

/// Lane assignment for packed half-precision loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum F16Mode {
    /// Not a half-precision load.
    Off,
    /// Half-precision, lane not yet assigned.
    On,
    /// Load starts on an even half-word.
    Even,
    /// Load starts on an odd half-word.
    Odd,
}

/// Half-to-single conversion flavor (which half-word of the source).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcvtMode {
    /// `vcvtb.f32.f16` — bottom (even) half-word.
    F32FromF16Bottom,
    /// `vcvtt.f32.f16` — top (odd) half-word.
    F32FromF16Top,
}

impl VcvtMode {
    #[must_use]
    pub fn asm_name(self) -> &'static str {
        match self {
            VcvtMode::F32FromF16Bottom => "vcvtb.f32.f16",
            VcvtMode::F32FromF16Top => "vcvtt.f32.f16",
        }
    }
}

/// One IR operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Comment {
        text: String,
    },
    Label {
        name: String,
    },
    /// Execute `body` `num` times. With `is_def` the index counts up and
    /// `idx` is observable in the body; otherwise it is a plain down-counter.
    Repeat {
        idx: Reg,
        num: usize,
        body: Vec<Op>,
        is_def: bool,
    },
    /// `dst = weight pool base + idx` (in words).
    LoadWeightAddr {
        dst: Reg,
        idx: usize,
    },
    /// `dst = arena data base + idx` (in words).
    LoadDataAddr {
        dst: Reg,
        idx: usize,
    },
    /// `dst = base + src * mult` (in words); `src == None` means
    /// `dst = base + mult`. `relax` marks a no-op used as an alignment
    /// barrier for half-precision weight streams. `is_def` marks the op
    /// as the defining write of a scratch pointer register.
    AddPtr {
        dst: Reg,
        src: Option<Reg>,
        mult: i64,
        base: Reg,
        relax: bool,
        is_def: bool,
    },
    LoadFConst {
        dst: Reg,
        num: f32,
    },
    /// Load `num` consecutive values at `src` into S-registers starting at
    /// `dst`. `raw` reads packed 32-bit words (half-precision pairs) rather
    /// than f32 values.
    Load {
        dst: Reg,
        src: Reg,
        num: usize,
        increment: bool,
        f16_mode: F16Mode,
        raw: bool,
    },
    /// Store `num` S-registers starting at `src` to memory at `dst`.
    Store {
        dst: Reg,
        src: Reg,
        num: usize,
        increment: bool,
    },
    Vmul {
        dst: Reg,
        a: Reg,
        b: Reg,
    },
    Vadd {
        dst: Reg,
        a: Reg,
        b: Reg,
    },
    Vmax {
        dst: Reg,
        a: Reg,
        b: Reg,
    },
    Vcvt {
        mode: VcvtMode,
        dst: Reg,
        src: Reg,
    },
    /// Clamp the f32 at `dst` to >= 0 in place, then advance `dst` by one.
    Relu {
        dst: Reg,
    },
    /// Call a runtime assembly routine with `dst` as data pointer and `num`
    /// as element count.
    Fcall {
        name: &'static str,
        dst: Reg,
        num: usize,
    },
}

impl Op {
    pub(crate) fn is_relax(&self) -> bool {
        matches!(self, Op::AddPtr { relax: true, .. })
    }
}

/// Allocator for loop index registers.
#[derive(Debug, Default)]
pub struct IdAlloc {
    next: u32,
}

impl IdAlloc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_index(&mut self) -> Reg {
        let r = Reg::Index(self.next);
        self.next += 1;
        r
    }
}

// ---- builders ----

pub fn comment(text: impl Into<String>) -> Op {
    Op::Comment { text: text.into() }
}

pub fn label(name: impl Into<String>) -> Op {
    Op::Label { name: name.into() }
}

/// Counted loop whose index register is visible to the body. The allocator
/// is passed back into the body builder so loops can nest.
pub fn repeat_idx(
    ids: &mut IdAlloc,
    num: usize,
    f: impl FnOnce(&mut IdAlloc, Reg) -> Vec<Op>,
) -> Op {
    let idx = ids.next_index();
    Op::Repeat {
        idx,
        num,
        body: f(ids, idx),
        is_def: true,
    }
}

/// Counted loop; the body must not observe the index.
pub fn repeat(ids: &mut IdAlloc, num: usize, f: impl FnOnce(&mut IdAlloc) -> Vec<Op>) -> Op {
    match repeat_idx(ids, num, |ids, _| f(ids)) {
        Op::Repeat {
            idx, num, body, ..
        } => Op::Repeat {
            idx,
            num,
            body,
            is_def: false,
        },
        _ => unreachable!(),
    }
}

pub fn load_weight_addr(dst: Reg, idx: usize) -> Op {
    Op::LoadWeightAddr { dst, idx }
}

pub fn load_data_addr(dst: Reg, idx: usize) -> Op {
    Op::LoadDataAddr { dst, idx }
}

pub fn add_ptr(dst: Reg, src: Option<Reg>, mult: i64) -> Op {
    Op::AddPtr {
        dst,
        src,
        mult,
        base: dst,
        relax: false,
        is_def: false,
    }
}

pub fn add_ptr_base(dst: Reg, src: Option<Reg>, mult: i64, base: Reg) -> Op {
    Op::AddPtr {
        dst,
        src,
        mult,
        base,
        relax: false,
        is_def: false,
    }
}

/// Defining write of a scratch pointer: `dst = base + mult`.
pub fn add_ptr_def(dst: Reg, mult: i64, base: Reg) -> Op {
    Op::AddPtr {
        dst,
        src: None,
        mult,
        base,
        relax: false,
        is_def: true,
    }
}

/// Alignment barrier: after it the half-precision weight stream is rounded
/// up to a full word.
pub fn relax_weights() -> Op {
    Op::AddPtr {
        dst: Reg::KernelPtr,
        src: None,
        mult: 0,
        base: Reg::KernelPtr,
        relax: true,
        is_def: false,
    }
}

pub fn load0(dst: Reg) -> Op {
    Op::LoadFConst { dst, num: 0.0 }
}

pub fn load(dst: Reg, num: usize, src: Reg, increment: bool) -> Op {
    Op::Load {
        dst,
        src,
        num,
        increment,
        f16_mode: F16Mode::Off,
        raw: false,
    }
}

pub fn load16(dst: Reg, num: usize, src: Reg) -> Op {
    Op::Load {
        dst,
        src,
        num,
        increment: true,
        f16_mode: F16Mode::On,
        raw: false,
    }
}

/// Weight-pool load honoring the configured weight precision.
pub fn load_weight(float16_weights: bool, dst: Reg, num: usize) -> Op {
    let src = Reg::KernelPtr;
    if float16_weights {
        load16(dst, num, src)
    } else {
        load(dst, num, src, true)
    }
}

pub fn store(dst: Reg, src: Reg, num: usize, increment: bool) -> Op {
    Op::Store {
        dst,
        src,
        num,
        increment,
    }
}

pub fn relu(dst: Reg) -> Op {
    Op::Relu { dst }
}

pub fn vmul(dst: Reg, a: Reg, b: Reg) -> Op {
    Op::Vmul { dst, a, b }
}

pub fn vadd(dst: Reg, a: Reg, b: Reg) -> Op {
    Op::Vadd { dst, a, b }
}

/// `dst = max(a, b)`; operands are swapped so `b != dst`.
pub fn vmax(dst: Reg, a: Reg, b: Reg) -> Op {
    let (a, b) = if b == dst { (b, a) } else { (a, b) };
    Op::Vmax { dst, a, b }
}

pub fn vcvt(mode: VcvtMode, dst: Reg, src: Reg) -> Op {
    Op::Vcvt { mode, dst, src }
}

pub fn fcall(name: &'static str, dst: Reg, num: usize) -> Op {
    Op::Fcall { name, dst, num }
}

// ---- cycle estimation ----

/// Rough Cortex-M4 cycle count of an op list, used for optimizer stats.
#[must_use]
pub fn num_cycles(ops: &[Op]) -> usize {
    let mut cycles = 0usize;
    let mut prev_dst: Option<Reg> = None;
    let add_const = |k: i64| if k < (1 << 12) { 1 } else { 2 };
    for op in ops {
        match op {
            Op::Comment { .. } | Op::Label { .. } => {}
            Op::Repeat {
                num, body, is_def, ..
            } => {
                cycles += (num_cycles(body) + 4 + usize::from(*is_def)) * num + 1;
            }
            Op::LoadWeightAddr { idx, .. } => cycles += 2 + add_const(*idx as i64 * 4),
            Op::LoadDataAddr { idx, .. } => cycles += add_const(*idx as i64 * 4 + 8),
            Op::AddPtr { src, mult, .. } => {
                match src {
                    None => cycles += add_const(mult * 4),
                    Some(src) => {
                        if *mult != 1 {
                            match src {
                                Reg::Const(n) if *n > 0 => match n {
                                    1 => {}
                                    2 => cycles += 1,
                                    _ => cycles += 2,
                                },
                                _ => cycles += 1,
                            }
                        }
                        cycles += 2;
                    }
                }
                if *mult == 1 {
                    cycles += 1;
                } else {
                    cycles += 3;
                }
            }
            Op::LoadFConst { num, .. } => {
                if *num == 0.0 {
                    cycles += 2;
                } else if *num == 1.0 {
                    cycles += 1;
                } else {
                    cycles += 4;
                }
            }
            Op::Load { num, .. } | Op::Store { num, .. } => cycles += 1 + num,
            Op::Relu { .. } => cycles += 6,
            Op::Vmax { dst, a, .. } => {
                cycles += 4;
                if a != dst {
                    cycles += 1;
                }
            }
            Op::Vmul { dst, a, b } | Op::Vadd { dst, a, b } => {
                if prev_dst == Some(*a) || prev_dst == Some(*b) {
                    cycles += 2;
                } else {
                    cycles += 1;
                }
                prev_dst = Some(*dst);
            }
            Op::Vcvt { .. } => cycles += 1,
            Op::Fcall { name, num, .. } => {
                // estimates
                if *name == "softmax" {
                    cycles += 200 + num * 150;
                } else {
                    cycles += 500 + num * 500;
                }
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_allocation_is_sequential() {
        let mut ids = IdAlloc::new();
        assert_eq!(ids.next_index(), Reg::Index(0));
        assert_eq!(ids.next_index(), Reg::Index(1));
        let r = repeat_idx(&mut ids, 3, |_, i| vec![add_ptr(Reg::InputPtr, Some(i), 1)]);
        match r {
            Op::Repeat { idx, is_def, .. } => {
                assert_eq!(idx, Reg::Index(2));
                assert!(is_def);
            }
            other => panic!("expected repeat, got {:?}", other),
        }
    }

    #[test]
    fn vmax_never_aliases_second_operand() {
        let op = vmax(Reg::S(0), Reg::S(1), Reg::S(0));
        match op {
            Op::Vmax { dst, a, b } => {
                assert_eq!(dst, Reg::S(0));
                assert_eq!(a, Reg::S(0));
                assert_eq!(b, Reg::S(1));
            }
            other => panic!("expected vmax, got {:?}", other),
        }
    }

    #[test]
    fn cycle_estimate_scales_with_loops() {
        let mut ids = IdAlloc::new();
        let body_cost = num_cycles(&[vmul(Reg::S(0), Reg::S(1), Reg::S(2))]);
        let loop5 = repeat(&mut ids, 5, |_| {
            vec![vmul(Reg::S(0), Reg::S(1), Reg::S(2))]
        });
        assert_eq!(num_cycles(&[loop5]), (body_cost + 4) * 5 + 1);
        let loop5_def = repeat_idx(&mut ids, 5, |_, _| {
            vec![vmul(Reg::S(0), Reg::S(1), Reg::S(2))]
        });
        assert_eq!(num_cycles(&[loop5_def]), (body_cost + 5) * 5 + 1);
    }

    #[test]
    fn back_to_back_mul_add_costs_extra() {
        let ops = vec![
            vmul(Reg::S(4), Reg::S(0), Reg::S(1)),
            vadd(Reg::S(2), Reg::S(2), Reg::S(4)),
        ];
        // the add reads the mul result while it is still in the pipeline
        assert_eq!(num_cycles(&ops), 3);
    }
}
