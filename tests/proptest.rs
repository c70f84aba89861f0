//! Property-based tests using proptest.
//!
//! These verify codec and assembler invariants across large, randomly
//! generated input spaces, complementing the targeted unit and integration
//! tests.

use proptest::prelude::*;
use thumbnet::asm::File;
use thumbnet::float16::{from_half, to_half};
use thumbnet::thumb::ThumbProcessor;

// ── Strategies ───────────────────────────────────────────────────────

/// Valid Thumb instruction strings from a curated pool (no branches, so any
/// sequence forms a valid file).
fn valid_thumb_insn() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "nop",
        "movs r0, #100",
        "movs r7, #0",
        "movw r9, #1234",
        "adds r1, #1",
        "adds r0, r0, r1",
        "subs r2, #1",
        "cmp r0, #0",
        "cmp r1, r2",
        "lsls r0, r1, #2",
        "muls r0, r1",
        "mov r8, r1",
        "ldr r0, [r5, #48]",
        "str r0, [sp, #12]",
        "bx lr",
        "vadd.f32 s0, s1, s2",
        "vmul.f32 s4, s4, s20",
        "vldm r1, {s0,s1,s2}",
        "vstm r2!, {s8,s9}",
        "vmov.f32 s1, s0",
        "vmrs APSR_nzcv, FPSCR",
        "vcvtb.f32.f16 s0, s16",
        "vcvtt.f32.f16 s1, s16",
    ])
}

fn assemble(src: &str) -> Option<Vec<u8>> {
    let proc = ThumbProcessor::new();
    let mut f = File::new(&proc);
    f.emit(src);
    if f.error().is_some() {
        None
    } else {
        Some(f.bytes())
    }
}

// ── Half-precision codec ─────────────────────────────────────────────

proptest! {
    /// Every binary16 bit pattern survives widening to f32 and narrowing
    /// back, including subnormals, infinities, and NaN payloads.
    #[test]
    fn half_bits_roundtrip_exactly(h: u16) {
        prop_assert_eq!(to_half(from_half(h)), h);
    }

    /// Narrowing an in-range f32 loses at most one part in 2^10 (the
    /// conversion truncates the mantissa).
    #[test]
    fn narrowing_error_is_bounded(v in -30000.0f32..30000.0) {
        let v2 = from_half(to_half(v));
        let d = (10000.0 * (v - v2).abs()).min(((v - v2) / v).abs());
        prop_assert!(d <= 0.002, "{} -> {} (d={})", v, v2, d);
    }

    /// The sign bit is always preserved.
    #[test]
    fn narrowing_preserves_sign(v in -65000.0f32..65000.0) {
        prop_assert_eq!(from_half(to_half(v)).is_sign_negative(), v.is_sign_negative());
    }
}

// ── Assembler ────────────────────────────────────────────────────────

proptest! {
    /// 8-bit immediate moves into low registers use the short encoding.
    #[test]
    fn movs_immediate_encoding(r in 0u16..8, imm in 0u16..256) {
        let bytes = assemble(&format!("movs r{}, #{}", r, imm)).unwrap();
        prop_assert_eq!(bytes.len(), 2);
        let word = u16::from_le_bytes([bytes[0], bytes[1]]);
        prop_assert_eq!(word, 0x2000 | (r << 8) | imm);
    }

    /// Any sequence from the instruction pool assembles, and does so
    /// deterministically.
    #[test]
    fn pool_sequences_assemble_deterministically(
        insns in prop::collection::vec(valid_thumb_insn(), 1..40)
    ) {
        let src = format!("@nostackcheck\n{}\n", insns.join("\n"));
        let a = assemble(&src).expect("pool instruction failed to assemble");
        let b = assemble(&src).expect("pool instruction failed to assemble");
        prop_assert_eq!(a, b);
    }

    /// Arbitrary printable input never panics: it either assembles or
    /// produces diagnostics.
    #[test]
    fn arbitrary_input_never_panics(src in "[ -~\n]{0,200}") {
        let proc = ThumbProcessor::new();
        let mut f = File::new(&proc);
        f.emit(&src);
        let _ = f.error();
        let _ = f.bytes();
    }
}
