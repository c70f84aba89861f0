//! IR optimization passes.
//!
//! [`optimize`] strip-mines short loops, unrolls hot ones, propagates loop
//! indices that become constants, and drops no-op pointer arithmetic.
//! [`fixup_and_mark_f16`] assigns even/odd lanes to packed half-precision
//! weight loads and expands them into raw word loads plus `vcvt` pairs.

use std::collections::HashMap;

use crate::error::CompileError;
use crate::ir::{add_ptr_base, load, vcvt, F16Mode, Op, Reg, VcvtMode};

const UNROLL_LIMIT: usize = 10;

/// Optimize an op list. Replacements discovered while rewriting (loop
/// indices that collapse to constants) are applied on cloned ops, never in
/// place.
#[must_use]
pub fn optimize(ops: &[Op]) -> Vec<Op> {
    let mut repl_map = HashMap::new();
    optimize_with(ops, &mut repl_map)
}

fn optimize_with(ops: &[Op], repl_map: &mut HashMap<Reg, Reg>) -> Vec<Op> {
    let mut res = Vec::new();
    for op in ops {
        let mut op = op.clone();
        substitute(&mut op, repl_map);
        match op {
            Op::Repeat {
                idx,
                num,
                body,
                is_def,
            } => {
                if num == 0 {
                    continue;
                }
                if num == 1 {
                    repl_map.insert(idx, Reg::ZERO);
                    res.extend(optimize_with(&body, repl_map));
                    continue;
                }
                let body = optimize_with(&body, repl_map);
                let strip_loop = num * body.len() < UNROLL_LIMIT * 2;
                let can_unroll = !is_def && 2 * body.len() < UNROLL_LIMIT;
                if strip_loop {
                    for i in 0..num {
                        repl_map.insert(idx, Reg::Const(i as i64));
                        // run again, the new replacement may enable more
                        res.extend(optimize_with(&body, repl_map));
                    }
                } else if can_unroll {
                    let unroll_cnt = UNROLL_LIMIT / body.len();
                    let mut unrolled = Vec::with_capacity(body.len() * unroll_cnt);
                    for _ in 0..unroll_cnt {
                        unrolled.extend(body.iter().cloned());
                    }
                    let newnum = num / unroll_cnt;
                    let left = num - newnum * unroll_cnt;
                    res.push(Op::Repeat {
                        idx,
                        num: newnum,
                        body: unrolled,
                        is_def,
                    });
                    for _ in 0..left {
                        res.extend(body.iter().cloned());
                    }
                } else {
                    res.push(Op::Repeat {
                        idx,
                        num,
                        body,
                        is_def,
                    });
                }
            }
            Op::AddPtr {
                dst,
                src,
                mult,
                base,
                ..
            } if dst == base && (mult == 0 || src == Some(Reg::ZERO)) => {
                // no-op pointer arithmetic
            }
            other => res.push(other),
        }
    }
    res
}

fn substitute(op: &mut Op, map: &HashMap<Reg, Reg>) {
    let repl = |r: &mut Reg| {
        if let Some(&n) = map.get(r) {
            *r = n;
        }
    };
    match op {
        Op::Comment { .. } | Op::Label { .. } => {}
        Op::Repeat { idx, .. } => repl(idx),
        Op::LoadWeightAddr { dst, .. }
        | Op::LoadDataAddr { dst, .. }
        | Op::LoadFConst { dst, .. }
        | Op::Relu { dst }
        | Op::Fcall { dst, .. } => repl(dst),
        Op::AddPtr { dst, src, base, .. } => {
            repl(dst);
            if let Some(s) = src {
                repl(s);
            }
            repl(base);
        }
        Op::Load { dst, src, .. } | Op::Store { dst, src, .. } | Op::Vcvt { dst, src, .. } => {
            repl(dst);
            repl(src);
        }
        Op::Vmul { dst, a, b } | Op::Vadd { dst, a, b } | Op::Vmax { dst, a, b } => {
            repl(dst);
            repl(a);
            repl(b);
        }
    }
}

fn is_odd_f16(ops: &[Op]) -> bool {
    let mut cnt = 0usize;
    for op in ops {
        if let Op::Load {
            num, f16_mode, ..
        } = op
        {
            if *f16_mode != F16Mode::Off {
                cnt += num;
            }
        }
        if op.is_relax() {
            cnt = (cnt + 1) & !1;
        }
    }
    cnt & 1 != 0
}

/// Assign even/odd half-word lanes to packed half-precision loads, then
/// expand them into raw 32-bit loads followed by `vcvtb`/`vcvtt` pairs.
///
/// A loop body that flips lane parity is handled by halving the trip count
/// and pairing two differently-laned bodies; a parity flip across a loop
/// whose index is observable cannot be split that way and is reported as
/// [`CompileError::HalfLaneParity`].
pub fn fixup_and_mark_f16(ops: &[Op]) -> Result<Vec<Op>, CompileError> {
    let (marked, _odd) = mark_lanes(ops, false)?;
    expand(&marked)
}

fn mark_lanes(ops: &[Op], odd: bool) -> Result<(Vec<Op>, bool), CompileError> {
    let mut cnt = usize::from(odd);
    let mut res: Vec<Op> = Vec::new();
    for op in ops {
        if let Op::Repeat {
            idx,
            num,
            body,
            is_def,
        } = op
        {
            if *num == 0 {
                continue;
            }
            let odd0 = cnt & 1 != 0;
            let (marked, out_odd) = mark_lanes(body, odd0)?;
            if out_odd == odd0 {
                res.push(Op::Repeat {
                    idx: *idx,
                    num: *num,
                    body: marked,
                    is_def: *is_def,
                });
                continue;
            }
            if *is_def {
                return Err(CompileError::HalfLaneParity { trip_count: *num });
            }
            if *num == 1 {
                res.extend(marked);
                cnt += 1; // swap parity
                continue;
            }
            // pair an even-lane body with an odd-lane one; an odd trip
            // count leaves one body over
            let leftover = num & 1;
            let (second, back_odd) = mark_lanes(body, out_odd)?;
            if back_odd != odd0 {
                return Err(CompileError::internal("lane parity did not roundtrip"));
            }
            let mut paired = marked;
            paired.extend(second);
            res.push(Op::Repeat {
                idx: *idx,
                num: num >> 1,
                body: paired,
                is_def: false,
            });
            if leftover != 0 {
                let (third, _) = mark_lanes(body, odd0)?;
                res.extend(third);
                cnt += 1;
            }
            continue;
        }
        let mut op = op.clone();
        if let Op::Load {
            num, f16_mode, ..
        } = &mut op
        {
            if *f16_mode != F16Mode::Off {
                if *f16_mode != F16Mode::On {
                    return Err(CompileError::internal("lane already assigned"));
                }
                *f16_mode = if cnt & 1 != 0 {
                    F16Mode::Odd
                } else {
                    F16Mode::Even
                };
                cnt += *num;
            }
        }
        if op.is_relax() {
            cnt = (cnt + 1) & !1;
        }
        res.push(op);
    }
    Ok((res, cnt & 1 != 0))
}

fn expand(ops: &[Op]) -> Result<Vec<Op>, CompileError> {
    let mut res = Vec::new();
    for op in ops {
        match op {
            Op::Repeat {
                idx,
                num,
                body,
                is_def,
            } => {
                if is_odd_f16(body) {
                    return Err(CompileError::internal("odd-parity loop body after fixup"));
                }
                res.push(Op::Repeat {
                    idx: *idx,
                    num: *num,
                    body: expand(body)?,
                    is_def: *is_def,
                });
            }
            Op::Load {
                dst,
                src,
                num,
                f16_mode,
                ..
            } if *f16_mode != F16Mode::Off => {
                let num_load;
                let mut is_bottom = false;
                match f16_mode {
                    F16Mode::Odd => {
                        num_load = (num >> 1) + 1;
                        // back the pointer up to the word the odd lane
                        // lives in
                        res.push(add_ptr_base(*src, Some(Reg::ONE), -1, *src));
                        if num & 1 == 0 {
                            is_bottom = true;
                        }
                    }
                    F16Mode::Even => {
                        num_load = (num + 1) >> 1;
                        if num & 1 != 0 {
                            is_bottom = true;
                        }
                    }
                    _ => return Err(CompileError::internal("unassigned f16 lane in expand")),
                }
                let mut ld = load(*dst, num_load, *src, true);
                if let Op::Load { raw, .. } = &mut ld {
                    *raw = true;
                }
                res.push(ld);
                let mut srcreg = dst.s_offset(num_load - 1);
                for i in (0..*num).rev() {
                    let mode = if is_bottom {
                        VcvtMode::F32FromF16Bottom
                    } else {
                        VcvtMode::F32FromF16Top
                    };
                    res.push(vcvt(mode, dst.s_offset(i), srcreg));
                    if is_bottom {
                        srcreg = match srcreg {
                            Reg::S(n) => Reg::S(n - 1),
                            other => other,
                        };
                    }
                    is_bottom = !is_bottom;
                }
            }
            other => res.push(other.clone()),
        }
    }
    Ok(res)
}
