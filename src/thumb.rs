//! ARMv7-M Thumb-2 instruction set: encoders, templates, wide branches,
//! literal pools, and peephole rewrites.
//!
//! References:
//!   ARMv7-M Architecture Reference Manual (Thumb instruction encodings),
//!   ARM-Thumb Procedure Call Standard.

use crate::asm::{File, Line, LineKind, PeepStats};
use crate::processor::{
    emit_err, inrange, inrange_signed, EmitResult, Emitted, Encoder, Instruction, InstructionSet,
    Processor,
};

const ARM_CONDITIONS: [(&str, i64); 18] = [
    ("eq", 0),
    ("ne", 1),
    ("cs", 2),
    ("hs", 2),
    ("cc", 3),
    ("lo", 3),
    ("mi", 4),
    ("pl", 5),
    ("vs", 6),
    ("vc", 7),
    ("hi", 8),
    ("ls", 9),
    ("ge", 10),
    ("lt", 11),
    ("gt", 12),
    ("le", 13),
    ("", 14),
    ("al", 14),
];

fn arm_condition(name: &str) -> Option<i64> {
    ARM_CONDITIONS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, v)| v)
}

fn thumb_reg_no(name: &str) -> Option<i64> {
    match name {
        "sp" => Some(13),
        "lr" => Some(14),
        "pc" => Some(15),
        _ => {
            let n: i64 = name.strip_prefix('r')?.parse().ok()?;
            if (0..=15).contains(&n) {
                Some(n)
            } else {
                None
            }
        }
    }
}

fn fp_reg_no(name: &str) -> Option<i64> {
    let n: i64 = name.strip_prefix('s')?.parse().ok()?;
    if (0..=31).contains(&n) {
        Some(n)
    } else {
        None
    }
}

/// The Cortex-M4F target: 16-bit core set, selected wide (32-bit)
/// encodings, and the single-precision VFP extension.
pub struct ThumbProcessor {
    iset: InstructionSet,
}

impl Default for ThumbProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThumbProcessor {
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn new() -> Self {
        let mut t = InstructionSet::default();
        // Registers
        // $r0 - bits 2:1:0
        // $r1 - bits 5:4:3
        // $r2 - bits 7:2:1:0
        // $r3 - bits 6:5:4:3
        // $r4 - bits 8:7:6
        // $r5 - bits 10:9:8
        t.add_enc("$r0", "R0-7", |v| inrange(7, v, v));
        t.add_enc("$r1", "R0-7", |v| inrange(7, v, v << 3));
        t.add_enc("$r2", "R0-15", |v| inrange(15, v, (v & 7) | ((v & 8) << 4)));
        t.add_enc("$r3", "R0-15", |v| inrange(15, v, v << 3));
        t.add_enc("$r4", "R0-7", |v| inrange(7, v, v << 6));
        t.add_enc("$r5", "R0-7", |v| inrange(7, v, v << 8));
        // sets both $r0 and $r1 (two-argument adds and subs)
        t.add_enc("$r01", "R0-7", |v| inrange(7, v, v | (v << 3)));
        // Immediates:
        // $i0 - bits 7-0
        // $i1 - bits 7-0 * 4
        // $i2 - bits 6-0 * 4
        // $i3 - bits 8-6
        // $i4 - bits 10-6
        // $i5 - bits 10-6 * 4
        // $i6 - bits 10-6, 0 is 32
        // $i7 - bits 10-6 * 2
        t.add_enc("$i0", "#0-255", |v| inrange(255, v, v));
        t.add_enc("$i1", "#0-1020", |v| {
            if v & 3 != 0 {
                return None;
            }
            inrange(255, v >> 2, v >> 2)
        });
        t.add_enc("$i2", "#0-510", |v| {
            if v & 3 != 0 {
                return None;
            }
            inrange(127, v >> 2, v >> 2)
        });
        t.add_enc("$i3", "#0-7", |v| inrange(7, v, v << 6));
        t.add_enc("$i4", "#0-31", |v| inrange(31, v, v << 6));
        t.add_enc("$i5", "#0-124", |v| {
            if v & 3 != 0 {
                return None;
            }
            inrange(31, v >> 2, (v >> 2) << 6)
        });
        t.add_enc("$i6", "#1-32", |v| {
            if v == 0 {
                None
            } else if v == 32 {
                Some(0)
            } else {
                inrange(31, v, v << 6)
            }
        });
        t.add_enc("$i7", "#0-62", |v| {
            if v & 1 != 0 {
                return None;
            }
            inrange(31, v >> 1, (v >> 1) << 6)
        });
        t.add_enc("$i32", "#0-2^32", |_| Some(1));
        t.add_enc("$rl0", "{R0-7,...}", |v| inrange(255, v, v));
        t.add_enc("$rl1", "{LR,R0-7,...}", |v| {
            if v & 0x4000 != 0 {
                inrange(255, v & !0x4000, 0x100 | (v & 0xff))
            } else {
                inrange(255, v, v)
            }
        });
        t.add_enc("$rl2", "{PC,R0-7,...}", |v| {
            if v & 0x8000 != 0 {
                inrange(255, v & !0x8000, 0x100 | (v & 0xff))
            } else {
                inrange(255, v, v)
            }
        });
        t.add_enc("$la", "LABEL", |v| {
            if v & 3 != 0 {
                return None;
            }
            inrange(255, v >> 2, v >> 2)
        })
        .is_word_aligned = true;
        t.add_enc("$lb", "LABEL", |v| {
            if v & 1 != 0 {
                return None;
            }
            inrange_signed(127, v >> 1, v >> 1)
        });
        t.add_enc("$lb11", "LABEL", |v| {
            if v & 1 != 0 {
                return None;
            }
            inrange_signed(1023, v >> 1, v >> 1)
        });
        t.add_inst("adcs  $r0, $r1", 0x4140, 0xffc0);
        t.add_inst("add   $r2, $r3", 0x4400, 0xff00);
        t.add_inst("add   $r5, pc, $i1", 0xa000, 0xf800);
        t.add_inst("add   $r5, sp, $i1", 0xa800, 0xf800);
        t.add_inst("add   sp, $i2", 0xb000, 0xff80);
        t.add_inst("adds  $r0, $r1, $i3", 0x1c00, 0xfe00);
        t.add_inst("adds  $r0, $r1, $r4", 0x1800, 0xfe00);
        t.add_inst("adds  $r01, $r4", 0x1800, 0xfe00);
        t.add_inst("adds  $r5, $i0", 0x3000, 0xf800);
        t.add_inst("adr   $r5, $la", 0xa000, 0xf800);
        t.add_inst("ands  $r0, $r1", 0x4000, 0xffc0);
        t.add_inst("asrs  $r0, $r1", 0x4100, 0xffc0);
        t.add_inst("asrs  $r0, $r1, $i6", 0x1000, 0xf800);
        t.add_inst("bics  $r0, $r1", 0x4380, 0xffc0);
        t.add_inst("bkpt  $i0", 0xbe00, 0xff00);
        t.add_inst("blx   $r3", 0x4780, 0xff87);
        t.add_inst("bx    $r3", 0x4700, 0xff80);
        t.add_inst("cmn   $r0, $r1", 0x42c0, 0xffc0);
        t.add_inst("cmp   $r0, $r1", 0x4280, 0xffc0);
        t.add_inst("cmp   $r2, $r3", 0x4500, 0xff00);
        t.add_inst("cmp   $r5, $i0", 0x2800, 0xf800);
        t.add_inst("eors  $r0, $r1", 0x4040, 0xffc0);
        t.add_inst("ldmia $r5!, $rl0", 0xc800, 0xf800);
        t.add_inst("ldmia $r5, $rl0", 0xc800, 0xf800);
        t.add_inst("ldr   $r0, [$r1, $i5]", 0x6800, 0xf800);
        t.add_inst("ldr   $r0, [$r1, $r4]", 0x5800, 0xfe00);
        t.add_inst("ldr   $r5, [pc, $i1]", 0x4800, 0xf800);
        t.add_inst("ldr   $r5, $la", 0x4800, 0xf800);
        t.add_inst("ldr   $r5, [sp, $i1]", 0x9800, 0xf800);
        t.add_inst("ldr   $r5, [sp]", 0x9800, 0xf800);
        t.add_inst("ldrb  $r0, [$r1, $i4]", 0x7800, 0xf800);
        t.add_inst("ldrb  $r0, [$r1, $r4]", 0x5c00, 0xfe00);
        t.add_inst("ldrh  $r0, [$r1, $i7]", 0x8800, 0xf800);
        t.add_inst("ldrh  $r0, [$r1, $r4]", 0x5a00, 0xfe00);
        t.add_inst("ldrsb $r0, [$r1, $r4]", 0x5600, 0xfe00);
        t.add_inst("ldrsh $r0, [$r1, $r4]", 0x5e00, 0xfe00);
        t.add_inst("lsls  $r0, $r1", 0x4080, 0xffc0);
        t.add_inst("lsls  $r0, $r1, $i4", 0x0000, 0xf800);
        t.add_inst("lsrs  $r0, $r1", 0x40c0, 0xffc0);
        t.add_inst("lsrs  $r0, $r1, $i6", 0x0800, 0xf800);
        t.add_inst("mov   $r2, $r3", 0x4600, 0xff00);
        t.add_inst("movs  $r0, $r1", 0x0000, 0xffc0);
        t.add_inst("movs  $r5, $i0", 0x2000, 0xf800);
        t.add_inst("muls  $r0, $r1", 0x4340, 0xffc0);
        t.add_inst("mvns  $r0, $r1", 0x43c0, 0xffc0);
        t.add_inst("negs  $r0, $r1", 0x4240, 0xffc0);
        t.add_inst("nop", 0x46c0, 0xffff); // mov r8, r8
        t.add_inst("orrs  $r0, $r1", 0x4300, 0xffc0);
        t.add_inst("pop   $rl2", 0xbc00, 0xfe00);
        t.add_inst("push  $rl1", 0xb400, 0xfe00);
        t.add_inst("rev   $r0, $r1", 0xba00, 0xffc0);
        t.add_inst("rev16 $r0, $r1", 0xba40, 0xffc0);
        t.add_inst("revsh $r0, $r1", 0xbac0, 0xffc0);
        t.add_inst("rors  $r0, $r1", 0x41c0, 0xffc0);
        t.add_inst("sbcs  $r0, $r1", 0x4180, 0xffc0);
        t.add_inst("sev", 0xbf40, 0xffff);
        t.add_inst("stm   $r5!, $rl0", 0xc000, 0xf800);
        t.add_inst("stmia $r5!, $rl0", 0xc000, 0xf800);
        t.add_inst("stmea $r5!, $rl0", 0xc000, 0xf800);
        t.add_inst("str   $r0, [$r1, $i5]", 0x6000, 0xf800);
        t.add_inst("str   $r0, [$r1]", 0x6000, 0xf800);
        t.add_inst("str   $r0, [$r1, $r4]", 0x5000, 0xfe00);
        t.add_inst("str   $r5, [sp, $i1]", 0x9000, 0xf800);
        t.add_inst("str   $r5, [sp]", 0x9000, 0xf800);
        t.add_inst("strb  $r0, [$r1, $i4]", 0x7000, 0xf800);
        t.add_inst("strb  $r0, [$r1, $r4]", 0x5400, 0xfe00);
        t.add_inst("strh  $r0, [$r1, $i7]", 0x8000, 0xf800);
        t.add_inst("strh  $r0, [$r1, $r4]", 0x5200, 0xfe00);
        t.add_inst("sub   sp, $i2", 0xb080, 0xff80);
        t.add_inst("subs  $r0, $r1, $i3", 0x1e00, 0xfe00);
        t.add_inst("subs  $r0, $r1, $r4", 0x1a00, 0xfe00);
        t.add_inst("subs  $r01, $r4", 0x1a00, 0xfe00);
        t.add_inst("subs  $r5, $i0", 0x3800, 0xf800);
        t.add_inst("svc   $i0", 0xdf00, 0xff00);
        t.add_inst("sxtb  $r0, $r1", 0xb240, 0xffc0);
        t.add_inst("sxth  $r0, $r1", 0xb200, 0xffc0);
        t.add_inst("tst   $r0, $r1", 0x4200, 0xffc0);
        t.add_inst("udf   $i0", 0xde00, 0xff00);
        t.add_inst("uxtb  $r0, $r1", 0xb2c0, 0xffc0);
        t.add_inst("uxth  $r0, $r1", 0xb280, 0xffc0);
        t.add_inst("wfe", 0xbf20, 0xffff);
        t.add_inst("wfi", 0xbf30, 0xffff);
        t.add_inst("yield", 0xbf10, 0xffff);
        t.add_inst("cpsid i", 0xb672, 0xffff);
        t.add_inst("cpsie i", 0xb662, 0xffff);
        for &(cond, id) in &ARM_CONDITIONS {
            if id != 14 {
                t.add_inst(&format!("b{} $lb", cond), 0xd000 | (id << 8), 0xff00);
            }
        }
        t.add_inst("b     $lb11", 0xe000, 0xf800);
        t.add_inst("bal   $lb11", 0xe000, 0xf800);
        // handled specially - 32 bit instruction
        t.add_inst("bl    $lb", 0xf000, 0xf800);
        // normally emitted as 'b' but emitted as 'bl' if out of range
        t.add_inst("bb    $lb", 0xe000, 0xf800);
        // emitted as PC-relative LDR against a literal pool
        t.add_inst("ldlit   $r5, $i32", 0x4800, 0xf800);
        // 32 bit encodings
        t.add_enc("$RL0", "{R0-15,...}", |v| inrange(0xffff, v, v));
        t.add_enc("$R0", "R0-15", |v| inrange(15, v, v << 8)); // 8-11
        t.add_enc("$R1", "R0-15", |v| inrange(15, v, v << 16)); // 16-19
        t.add_enc("$R2", "R0-15", |v| inrange(15, v, v << 12)); // 12-15
        t.add_enc("$R3", "R0-15", |v| inrange(15, v, v)); // 0-3
        t.add_enc("$I0", "#0-4095", |v| {
            inrange(4095, v, (v & 0xff) | ((v & 0x700) << 4) | ((v & 0x800) << 15))
        });
        t.add_enc("$I1", "#0-4095", |v| inrange(4095, v, v));
        t.add_enc("$I2", "#0-65535", |v| {
            inrange(
                0xffff,
                v,
                (v & 0xff) | ((v & 0x700) << 4) | ((v & 0x800) << 15) | ((v & 0xf000) << 4),
            )
        });
        t.add_enc("$I3", "#0-31", |v| inrange(31, v, ((v & 3) << 6) | ((v >> 2) << 12)));
        t.add_enc("$LB", "LABEL", |v| {
            if v & 1 != 0 {
                return None;
            }
            let q = ((v >> 1) & 0x7ff)
                | (((v >> 12) & 0x3f) << 16)
                | (((v >> 18) & 0x1) << 13)
                | (((v >> 19) & 0x1) << 11)
                | (((v >> 20) & 0x1) << 26);
            inrange_signed((1 << 20) - 1, v >> 1, 0)?;
            Some(q)
        });
        t.add_enc("$S0", "S0-31", |v| inrange(31, v, (v >> 1) | ((v & 1) << 5)));
        t.add_enc("$S1", "S0-31", |v| {
            inrange(31, v, ((v >> 1) << 12) | ((v & 1) << 22))
        });
        t.add_enc("$S2", "S0-31", |v| {
            inrange(31, v, ((v >> 1) << 16) | ((v & 1) << 7))
        });
        t.add_enc("$SL0", "{S0-S31}", |v| {
            // consecutive single-precision register range
            if v <= 0 {
                return None;
            }
            let reg0 = i64::from(v.trailing_zeros());
            let rest = v >> reg0;
            let num = i64::from(rest.trailing_ones());
            if rest >> num != 0 {
                return None; // non-consecutive
            }
            Some(((reg0 >> 1) << 12) | ((reg0 & 1) << 22) | num)
        });
        t.add_inst32("push  $RL0", 0xe92d_0000, 0xffff_0000);
        t.add_inst32("pop   $RL0", 0xe8bd_0000, 0xffff_0000);
        t.add_inst32("addw  $R0, $R1, $I0", 0xf200_0000, 0xfbf0_8000);
        t.add_inst32("subw  $R0, $R1, $I0", 0xf2a0_0000, 0xfbf0_8000);
        t.add_inst32("ldr   $R2, [$R1, $I1]", 0xf8d0_0000, 0xfff0_0000);
        t.add_inst32("str   $R2, [$R1, $I1]", 0xf8c0_0000, 0xfff0_0000);
        t.add_inst32("movw  $R0, $I2", 0xf240_0000, 0xfbf0_8000);
        t.add_inst32("add   $R0, $R1, $R3, lsl $I3", 0xeb00_0000, 0xfff0_8000);
        // $i0 covers only a subset of the allowed constants
        t.add_inst32("subs  $R0, $R1, $i0", 0xf1b0_0000, 0xfff0_8000);
        t.add_inst32("sub   $R0, $R1, $i0", 0xf1a0_0000, 0xfff0_8000);
        t.add_inst32("adds  $R0, $R1, $i0", 0xf110_0000, 0xfff0_8000);
        t.add_inst32("add   $R0, $R1, $i0", 0xf100_0000, 0xfff0_8000);
        for &(cond, id) in &ARM_CONDITIONS {
            t.add_inst32(
                &format!("b{} $LB", cond),
                0xf000_8000 | (id << 22),
                0xfbc0_d000,
            );
            t.add_inst(&format!("it {}", cond), 0xbf08 | (id << 4), 0xffff);
        }
        t.add_inst32("vabs.f32     $S1, $S0", 0xeeb0_0ac0, 0xffbf_0fd0);
        t.add_inst32("vadd.f32     $S1, $S2, $S0", 0xee30_0a00, 0xffb0_0f50);
        t.add_inst32("vmul.f32     $S1, $S2, $S0", 0xee20_0a00, 0xffb0_0f50);
        t.add_inst32("vcmpe.f32    $S1, #0.0", 0xeeb5_0ac0, 0xffbf_0ff0);
        t.add_inst32("vcmpe.f32    $S1, $S0", 0xeeb4_0ac0, 0xffbf_0fd0);
        t.add_inst32("vcmp.f32     $S1, #0.0", 0xeeb5_0a40, 0xffbf_0ff0);
        t.add_inst32("vcmp.f32     $S1, $S0", 0xeeb4_0a40, 0xffbf_0fd0);
        t.add_inst32("vdiv.f32     $S1, $S2, $S0", 0xee80_0a00, 0xffb0_0f50);
        t.add_inst32("vfma.f32     $S1, $S2, $S0", 0xeea0_0a00, 0xffb0_0f50);
        t.add_inst32("vfms.f32     $S1, $S2, $S0", 0xeea0_0a40, 0xffb0_0f50);
        t.add_inst32("vfnma.f32    $S1, $S2, $S0", 0xee90_0a40, 0xffb0_0f50);
        t.add_inst32("vfnms.f32    $S1, $S2, $S0", 0xee90_0a00, 0xffb0_0f50);
        t.add_inst32("vneg.f32     $S1, $S0", 0xeeb1_0a40, 0xffbf_0fd0);
        t.add_inst32("vsqrt.f32    $S1, $S0", 0xeeb1_0ac0, 0xffbf_0fd0);
        t.add_inst32("vsub.f32     $S1, $S2, $S0", 0xee30_0a40, 0xffb0_0f50);
        t.add_inst32("vstmdb       $R1!, $SL0", 0xed20_0a00, 0xffb0_0f00);
        t.add_inst32("vstmia       $R1!, $SL0", 0xeca0_0a00, 0xffb0_0f00);
        t.add_inst32("vstmia       $R1, $SL0", 0xec80_0a00, 0xffb0_0f00);
        t.add_inst32("vstm         $R1!, $SL0", 0xeca0_0a00, 0xffb0_0f00);
        t.add_inst32("vstm         $R1, $SL0", 0xec80_0a00, 0xffb0_0f00);
        t.add_inst32("vldmdb       $R1!, $SL0", 0xed30_0a00, 0xffb0_0f00);
        t.add_inst32("vldmia       $R1!, $SL0", 0xecb0_0a00, 0xffb0_0f00);
        t.add_inst32("vldmia       $R1, $SL0", 0xec90_0a00, 0xffb0_0f00);
        t.add_inst32("vldm         $R1!, $SL0", 0xecb0_0a00, 0xffb0_0f00);
        t.add_inst32("vldm         $R1, $SL0", 0xec90_0a00, 0xffb0_0f00);
        t.add_inst32("vldr         $S1, [$R1, $i1]", 0xed90_0a00, 0xffb0_0f00);
        t.add_inst32("vstr         $S1, [$R1, $i1]", 0xed80_0a00, 0xffb0_0f00);
        t.add_inst32("vldr         $S1, [$R1]", 0xed90_0a00, 0xffb0_0f00);
        t.add_inst32("vmrs         APSR_nzcv, fpscr", 0xeef1_fa10, 0xffff_ffff);
        t.add_inst32("vmrs         APSR_nzcv, FPSCR", 0xeef1_fa10, 0xffff_ffff);
        t.add_inst32("vmov.f32     $S1, $S0", 0xeeb0_0a40, 0xffbf_0fd0);
        t.add_inst32("vmov         $S2, $R2", 0xee00_0a10, 0xfff0_0f7f);
        t.add_inst32("vmov         $R2, $S2", 0xee10_0a10, 0xfff0_0f7f);
        t.add_inst32("vldr         $S1, $la", 0xed9f_0a00, 0xffbf_0f00);
        t.add_inst32("vmov.f32     $S1, #1.0", 0xeeb7_0a00, 0xffbf_0ff0);
        t.add_inst32("vcvt.s32.f32 $S1, $S0", 0xeebd_0ac0, 0xffbf_0fd0);
        t.add_inst32("vcvtb.f32.f16 $S1, $S0", 0xeeb2_0a40, 0xffbf_0fd0);
        t.add_inst32("vcvtt.f32.f16 $S1, $S0", 0xeeb2_0ac0, 0xffbf_0fd0);
        t.add_inst32("vcvtb.f16.f32 $S1, $S0", 0xeeb3_0a40, 0xffbf_0fd0);
        t.add_inst32("vcvtt.f16.f32 $S1, $S0", 0xeeb3_0ac0, 0xffbf_0fd0);
        ThumbProcessor { iset: t }
    }
}

impl Processor for ThumbProcessor {
    fn iset(&self) -> &InstructionSet {
        &self.iset
    }

    fn register_no(&self, actual: &str, enc: &Encoder) -> Option<i64> {
        if actual.is_empty() {
            return None;
        }
        let lower = actual.to_ascii_lowercase();
        if enc.name.as_bytes()[1] == b'S' {
            fp_reg_no(&lower)
        } else {
            thumb_reg_no(&lower)
        }
    }

    fn is32bit(&self, ins: &Instruction) -> bool {
        ins.name == "bl" || ins.name == "bb" || ins.is32bit
    }

    fn emit32(&self, _partial: i64, v: i64, actual: &str) -> EmitResult {
        let mut v = v;
        // an odd target means a BL/BLX-style pointer into ARM state
        let is_blx = v % 2 != 0;
        if is_blx {
            v = (v + 1) & !3;
        }
        let off = v >> 1;
        // range is +-4M (2M instructions)
        if off <= -(2 * 1024 * 1024) || off >= 2 * 1024 * 1024 {
            return Err(emit_err("jump out of range", actual));
        }
        // off is in instructions, not bytes
        let imm11 = off & 0x7ff;
        let imm10 = (off >> 11) & 0x3ff;
        let opcode = if off & 0xf000_0000 != 0 {
            0xf400 | imm10
        } else {
            0xf000 | imm10
        };
        let opcode2 = if is_blx { 0xe800 | imm11 } else { 0xf800 | imm11 };
        Ok(Emitted {
            opcode: (opcode & 0xffff) as u16,
            opcode2: Some((opcode2 & 0xffff) as u16),
            stack: 0,
            num_args: vec![v],
        })
    }

    fn to_fn_ptr(&self, v: i64, base_off: i64) -> i64 {
        (v + base_off) | 1
    }

    fn get_address_from_label(
        &self,
        f: &File<'_>,
        _ins: &Instruction,
        s: &str,
        word_aligned: bool,
    ) -> Option<i64> {
        let l = f.lookup_label(s)?;
        let mut pc = f.location() + 4;
        if word_aligned {
            pc &= !3;
        }
        Some(l - pc)
    }

    fn is_pop(&self, opcode: i64) -> bool {
        opcode == 0xbc00
    }

    fn is_push(&self, opcode: i64) -> bool {
        opcode == 0xb400
    }

    fn is_add_sp(&self, opcode: i64) -> bool {
        opcode == 0xb000
    }

    fn is_sub_sp(&self, opcode: i64) -> bool {
        opcode == 0xb080
    }

    fn strip_condition(&self, name: &str) -> Option<String> {
        if name.len() < 5 {
            return None;
        }
        let (base, mut suff) = match name.find('.') {
            Some(dot) if dot > 0 => (&name[..dot], &name[dot..]),
            _ => (name, ""),
        };
        let mut force = false;
        if suff == ".32" {
            force = true;
            suff = "";
        }
        if base.len() >= 2 {
            let tail = &base[base.len() - 2..];
            // "eq" maps to condition 0 and deliberately does not strip
            if matches!(arm_condition(tail), Some(c) if c != 0) {
                return Some(format!("{}{}", &base[..base.len() - 2], suff));
            }
        }
        if force {
            return Some(base.to_string());
        }
        None
    }

    fn expand_ldlit(&self, f: &mut File<'_>) {
        struct LineMeta {
            location: Option<i64>,
            op: String,
            word2: Option<String>,
            kind: LineKind,
        }
        let lines = std::mem::take(&mut f.lines);
        let metas: Vec<LineMeta> = lines
            .iter()
            .map(|l| LineMeta {
                location: l.location,
                op: l.op().to_string(),
                word2: l.words.get(2).cloned(),
                kind: l.kind,
            })
            .collect();
        let n = lines.len();
        let mut outlines = Vec::with_capacity(n);
        let mut next_good: Option<usize> = None;
        let mut needs_jump_over = false;
        // value text -> pool label, in insertion order
        let mut values: Vec<(String, String)> = Vec::new();
        let mut seq = 1u32;
        let mut stats = PeepStats::default();
        for (i, mut line) in lines.into_iter().enumerate() {
            if line.kind == LineKind::Instruction && line.op() == "ldlit" {
                if next_good.is_none() {
                    // leave some slack - the real limit is 1020
                    let limit = line.location.unwrap_or(0) + 900;
                    let mut j = i + 1;
                    while j < n {
                        if metas[j].location.is_some_and(|loc| loc > limit) {
                            break;
                        }
                        let op = metas[j].op.as_str();
                        if op == "b"
                            || op == "bb"
                            || (op == "pop" && metas[j].word2.as_deref() == Some("pc"))
                        {
                            next_good = Some(j);
                        }
                        j += 1;
                    }
                    if next_good.is_some() {
                        needs_jump_over = false;
                    } else {
                        needs_jump_over = true;
                        while j > i + 1 {
                            j -= 1;
                            if metas[j].kind == LineKind::Instruction {
                                next_good = Some(j);
                                break;
                            }
                        }
                    }
                }
                let reg = line.words.get(1).cloned().unwrap_or_default();
                let v = format!("#{}", line.words.get(3).map_or("", String::as_str));
                let lbl = match values.iter().find(|(key, _)| *key == v) {
                    Some((_, l)) => l.clone(),
                    None => {
                        seq += 1;
                        let l = format!("_ldlit_{}", seq);
                        values.push((v, l.clone()));
                        l
                    }
                };
                line.update(&format!("ldr {}, {}", reg, lbl), &mut stats);
            }
            let scope = line.scope.clone();
            let line_no = line.line_no;
            let flush = next_good == Some(i);
            outlines.push(line);
            if flush {
                next_good = None;
                seq += 1;
                let jmplbl = format!("_jmpwords_{}", seq);
                let mut txt_lines: Vec<String> = Vec::new();
                if needs_jump_over {
                    txt_lines.push(format!("bb {}", jmplbl));
                }
                txt_lines.push(".balign 4".to_string());
                for (v, lbl) in &values {
                    txt_lines.push(format!("{}: .word {}", lbl, &v[1..]));
                }
                if needs_jump_over {
                    txt_lines.push(format!("{}:", jmplbl));
                }
                for tx in &txt_lines {
                    let start = outlines.len();
                    f.build_line(tx, &mut outlines);
                    for ll in &mut outlines[start..] {
                        ll.scope = scope.clone();
                        ll.line_no = line_no;
                    }
                }
                values.clear();
            }
        }
        f.lines = outlines;
    }

    #[allow(clippy::too_many_lines)]
    fn peephole(
        &self,
        lines: &mut [Line<'_>],
        i: usize,
        j: usize,
        k: Option<usize>,
        stats: &mut PeepStats,
    ) {
        let (Some(lb11), Some(lb)) = (self.encoder("$lb11"), self.encoder("$lb")) else {
            return;
        };
        // +-8 bytes of slack: code size can shift slightly when .balign
        // directives are inserted by literal pool generation
        let fits = |enc: &Encoder, ln: &Line<'_>| -> bool {
            let Some(&v) = ln.num_args.first() else {
                return false;
            };
            enc.encode(v + 8).is_some() && enc.encode(v - 8).is_some() && enc.encode(v).is_some()
        };
        let lnop = lines[i].op().to_string();
        let next_op = lines[j].op().to_string();
        let arg0 = |ln: &Line<'_>| ln.num_args.first().copied();
        let mut is_skip_branch = false;
        if lnop == "bne" || lnop == "beq" {
            if next_op == "b" && arg0(&lines[i]) == Some(0) {
                is_skip_branch = true;
            }
            if next_op == "bb" && arg0(&lines[i]) == Some(2) {
                is_skip_branch = true;
            }
        }
        if lnop == "bb" && fits(lb11, &lines[i]) {
            // RULE: bb .somewhere -> b .somewhere (if it fits)
            let t = format!("b {}", lines[i].words[1]);
            lines[i].update(&t, stats);
        } else if lnop == "b" && arg0(&lines[i]) == Some(-2) {
            // RULE: b .somewhere; .somewhere: -> .somewhere:
            lines[i].update("", stats);
        } else if lnop == "bne" && is_skip_branch && fits(lb, &lines[j]) {
            // RULE: bne .next; b .somewhere; .next: -> beq .somewhere
            let t = format!("beq {}", lines[j].words[1]);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "beq" && is_skip_branch && fits(lb, &lines[j]) {
            // RULE: beq .next; b .somewhere; .next: -> bne .somewhere
            let t = format!("bne {}", lines[j].words[1]);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "push"
            && arg0(&lines[i]) == Some(0x4000)
            && next_op == "push"
            && arg0(&lines[j]).is_some_and(|a| a & 0x4000 == 0)
        {
            // RULE: push {lr}; push {X, ...} -> push {lr, X, ...}
            let t = lines[j].text.replacen('{', "{lr, ", 1);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "pop" && next_op == "pop" && arg0(&lines[j]) == Some(0x8000) {
            // RULE: pop {X, ...}; pop {pc} -> pop {X, ..., pc}
            let t = lines[i].text.replacen('}', ", pc}", 1);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "push"
            && next_op == "pop"
            && arg0(&lines[i]).is_some()
            && arg0(&lines[i]) == arg0(&lines[j])
        {
            // RULE: push {X}; pop {X} -> nothing
            lines[i].update("", stats);
            lines[j].update("", stats);
        } else if lnop == "push"
            && next_op == "pop"
            && lines[i].words.len() == 4
            && lines[j].words.len() == 4
        {
            // RULE: push {rX}; pop {rY} -> mov rY, rX
            let t = format!("mov {}, {}", lines[j].words[2], lines[i].words[2]);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if k.is_some()
            && lines[i].op_ext() == "movs $r5, $i0"
            && lines[j].op_ext() == "mov $r2, $r3"
            && arg0(&lines[i]).is_some()
            && arg0(&lines[i]) == lines[j].num_args.get(1).copied()
            // the rewrite targets the short movs form, low registers only
            && lines[j].num_args.first().is_some_and(|&r| r < 8)
            && clobbers_reg(&lines[k.unwrap_or(0)], lines[i].num_args[0])
        {
            // RULE: movs rX, #V; mov rY, rX; clobber rX -> movs rY, #V
            let t = format!("movs r{}, #{}", lines[j].num_args[0], lines[i].num_args[1]);
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "pop"
            && single_reg(&lines[i]) >= 0
            && next_op == "push"
            && single_reg(&lines[i]) == single_reg(&lines[j])
        {
            // RULE: pop {rX}; push {rX} -> ldr rX, [sp, #0]
            let t = format!("ldr r{}, [sp, #0]", single_reg(&lines[i]));
            lines[i].update(&t, stats);
            lines[j].update("", stats);
        } else if lnop == "push"
            && lines[j].op_ext() == "ldr $r5, [sp, $i1]"
            && Some(single_reg(&lines[i])) == arg0(&lines[j])
            && lines[j].num_args.get(1) == Some(&0)
        {
            // RULE: push {rX}; ldr rX, [sp, #0] -> push {rX}
            lines[j].update("", stats);
        } else if let Some(k) = k {
            if lnop == "push"
                && single_reg(&lines[i]) >= 0
                && preserves_reg(&lines[j], single_reg(&lines[i]))
                && lines[k].op() == "pop"
                && single_reg(&lines[i]) == single_reg(&lines[k])
            {
                // RULE: push {rX}; movs rY, #V; pop {rX} -> movs rY, #V
                lines[i].update("", stats);
                lines[k].update("", stats);
            }
        }
    }
}

/// True when the instruction neither writes `r<n>` nor touches memory.
fn preserves_reg(ln: &Line<'_>, n: i64) -> bool {
    ln.op_ext() == "movs $r5, $i0" && ln.num_args.first() != Some(&n)
}

fn clobbers_reg(ln: &Line<'_>, n: i64) -> bool {
    ln.op() == "pop" && ln.num_args.first().is_some_and(|&a| a & (1 << n) != 0)
}

/// Index of the single register in a push/pop list, or -1.
fn single_reg(ln: &Line<'_>) -> i64 {
    let mut v = ln.num_args.first().copied().unwrap_or(0);
    let mut ret = -1i64;
    let mut k = 0i64;
    while v > 0 {
        if v & 1 != 0 {
            ret = if ret == -1 { k } else { -2 };
        }
        v >>= 1;
        k += 1;
    }
    if ret >= 0 {
        ret
    } else {
        -1
    }
}
