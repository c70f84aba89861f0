//! Rendering the flattened op list to Thumb assembly text.
//!
//! Register convention: r0 is scratch, r1/r2/r3 hold the input, output and
//! kernel pointers, r7 points to the two-word data descriptor at the start
//! of the RAM arena (weight base address, then a zero word used to
//! materialize 0.0f). r4-r12 are dynamically assigned to loop counters and
//! scratch pointers, scoped to the loop that owns them.

use std::collections::HashMap;

use crate::compile::ModelInfo;
use crate::error::CompileError;
use crate::ir::{Op, Reg};

/// Descriptor slot holding the weight base address (byte offset).
const WEIGHT_ADDR_OFFSET: usize = 0;
/// Descriptor slot holding a zero word (byte offset).
const ZERO_OFFSET: usize = 4;
/// Words in the descriptor prefix before arena data.
const DESC_WORDS: usize = 2;

/// Byte offset of arena word `n`, past the descriptor prefix.
fn byte_offset(n: usize) -> usize {
    4 * (n + DESC_WORDS)
}

fn comment_text(msg: &str) -> String {
    format!("// {}", msg.replace('\n', "\n// "))
}

fn is_low_reg(r: &str) -> bool {
    matches!(
        r,
        "r0" | "r1" | "r2" | "r3" | "r4" | "r5" | "r6" | "r7"
    )
}

fn asm_deps(name: &str) -> &'static [&'static str] {
    match name {
        "softmax" => &["expf_asm"],
        _ => &[],
    }
}

fn asm_fn(name: &str) -> Option<&'static str> {
    match name {
        "expf_asm" => Some(EXPF_ASM),
        "softmax" => Some(SOFTMAX_ASM),
        _ => None,
    }
}

struct Renderer {
    text: String,
    ind: String,
    alloc: HashMap<Reg, u8>,
    lblid: usize,
    used_fns: Vec<&'static str>,
}

impl Renderer {
    fn write(&mut self, asm: &str) -> Result<(), CompileError> {
        if asm.contains("<fake") {
            return Err(CompileError::internal(format!(
                "unallocated register in: {}",
                asm.trim()
            )));
        }
        self.text.push_str(&self.ind);
        self.text.push_str(asm);
        self.text.push('\n');
        Ok(())
    }

    fn reg(&self, r: Reg) -> String {
        match r {
            Reg::S(n) => format!("s{}", n),
            Reg::Const(n) => format!("#{}", n),
            other => match self.alloc.get(&other) {
                Some(id) => format!("r{}", id),
                None => format!("<fake:{:?}>", other),
            },
        }
    }

    /// Grab the lowest free register in r4-r12.
    fn alloc_new(&mut self, r: Reg) -> Result<(), CompileError> {
        if self.alloc.contains_key(&r) {
            return Err(CompileError::internal(format!(
                "register already allocated: {:?}",
                r
            )));
        }
        for i in 4..=12u8 {
            if !self.alloc.values().any(|&v| v == i) {
                self.alloc.insert(r, i);
                return Ok(());
            }
        }
        Err(CompileError::internal(format!("can't alloc {:?}", r)))
    }

    /// Allocate `r` for the duration of `f`, restoring the register file
    /// (including any nested permanent allocations) afterwards.
    fn scoped(
        &mut self,
        r: Reg,
        f: impl FnOnce(&mut Self) -> Result<(), CompileError>,
    ) -> Result<(), CompileError> {
        let saved = self.alloc.clone();
        self.alloc_new(r)?;
        self.ind.push_str("    ");
        let res = f(self);
        let len = self.ind.len();
        self.ind.truncate(len - 4);
        self.alloc = saved;
        res
    }

    fn load_const(&mut self, dst: &str, num: i64) -> Result<(), CompileError> {
        if num <= 0xff && is_low_reg(dst) {
            self.write(&format!("movs {}, #{}", dst, num))
        } else {
            self.write(&format!("movw {}, #{}", dst, num))
        }
    }

    fn add_const(&mut self, dst: &str, src: &str, num: i64) -> Result<(), CompileError> {
        if num.abs() < (1 << 12) {
            if num < 0 {
                self.write(&format!("subw {}, {}, #{}", dst, src, -num))
            } else {
                self.write(&format!("addw {}, {}, #{}", dst, src, num))
            }
        } else {
            if dst == src {
                return Err(CompileError::internal(
                    "large pointer advance needs distinct registers",
                ));
            }
            self.load_const(dst, num)?;
            self.write(&format!("adds {}, {}, {}", dst, src, dst))
        }
    }

    fn s_range(&self, dst: Reg, num: usize) -> String {
        let parts: Vec<String> = (0..num).map(|k| self.reg(dst.s_offset(k))).collect();
        format!("{{{}}}", parts.join(","))
    }

    fn ops(&mut self, ops: &[Op]) -> Result<(), CompileError> {
        for op in ops {
            self.op(op)?;
        }
        Ok(())
    }

    fn op(&mut self, op: &Op) -> Result<(), CompileError> {
        match op {
            Op::Label { name } => self.write(&format!("{}:", name)),
            Op::Comment { text } => self.write(&comment_text(text)),
            Op::Repeat {
                idx,
                num,
                body,
                is_def,
            } => {
                if *num < 1 {
                    return Err(CompileError::internal("repeat with zero trip count"));
                }
                self.scoped(*idx, |r| {
                    let dst = r.reg(*idx);
                    let lbl = format!(".l.{}", r.lblid);
                    r.lblid += 1;
                    r.load_const(&dst, if *is_def { 0 } else { *num as i64 })?;
                    r.write(&format!("{}:  // rep {}", lbl, num))?;
                    r.ops(body)?;
                    if *is_def {
                        r.write(&format!("adds {}, #1", dst))?;
                        r.write(&format!("cmp {}, #{}", dst, num))?;
                        r.write(&format!("blt {}", lbl))
                    } else {
                        if is_low_reg(&dst) {
                            r.write(&format!("subs {}, #1", dst))?;
                        } else {
                            r.write(&format!("subs {}, {}, #1", dst, dst))?;
                        }
                        r.write(&format!("bne {}", lbl))
                    }
                })
            }
            Op::LoadWeightAddr { dst, idx } => {
                let dst = self.reg(*dst);
                let ddp = self.reg(Reg::DataDescPtr);
                self.write(&format!("ldr r0, [{}, #{}]", ddp, WEIGHT_ADDR_OFFSET))?;
                self.add_const(&dst, "r0", *idx as i64 * 4)
            }
            Op::LoadDataAddr { dst, idx } => {
                let dst = self.reg(*dst);
                let ddp = self.reg(Reg::DataDescPtr);
                self.add_const(&dst, &ddp, byte_offset(*idx) as i64)
            }
            Op::AddPtr {
                dst,
                src,
                mult,
                base,
                is_def,
                ..
            } => {
                let mut dstr = self.reg(*dst);
                if dstr.contains("<fake") && *is_def {
                    self.alloc_new(*dst)?;
                    dstr = self.reg(*dst);
                }
                let baser = self.reg(*base);
                match src {
                    None => self.add_const(&dstr, &baser, mult * 4),
                    Some(srcreg) => {
                        if *mult != 1 {
                            self.load_const("r0", mult * 4)?;
                            if let Reg::Const(n) = srcreg {
                                match n {
                                    0 => self.load_const("r0", 0)?,
                                    1 => {}
                                    2 => self.write("adds r0,r0")?,
                                    _ => {
                                        if dstr == baser {
                                            return Err(CompileError::internal(
                                                "scaled pointer advance aliases its base",
                                            ));
                                        }
                                        self.load_const(&dstr, *n)?;
                                        self.write(&format!("muls r0, {}", dstr))?;
                                    }
                                }
                            } else {
                                let srcr = self.reg(*srcreg);
                                self.write(&format!("muls r0, {}", srcr))?;
                            }
                        } else if let Reg::Const(n) = srcreg {
                            self.load_const("r0", n << 2)?;
                        } else {
                            let srcr = self.reg(*srcreg);
                            self.write(&format!("lsls r0, {}, #2", srcr))?;
                        }
                        self.write(&format!("adds {}, {}, r0", dstr, baser))
                    }
                }
            }
            Op::LoadFConst { dst, num } => {
                let dst = self.reg(*dst);
                if *num == 0.0 {
                    let ddp = self.reg(Reg::DataDescPtr);
                    self.write(&format!("vldr {}, [{}, #{}]", dst, ddp, ZERO_OFFSET))
                } else {
                    self.write(&format!("vmov.f32 {}, #{:?}", dst, num))
                }
            }
            Op::Load {
                dst,
                src,
                num,
                increment,
                f16_mode,
                ..
            } => {
                if *f16_mode == crate::ir::F16Mode::On {
                    return Err(CompileError::internal("unexpanded half-precision load"));
                }
                let srcr = self.reg(*src);
                let incr = if *increment { "!" } else { "" };
                let list = self.s_range(*dst, *num);
                self.write(&format!("vldm {}{}, {}", srcr, incr, list))
            }
            Op::Store {
                dst,
                src,
                num,
                increment,
            } => {
                let dstr = self.reg(*dst);
                let incr = if *increment { "!" } else { "" };
                let list = self.s_range(*src, *num);
                self.write(&format!("vstm {}{}, {}", dstr, incr, list))
            }
            Op::Relu { dst } => {
                let dst = self.reg(*dst);
                self.write(&format!("ldr r0, [{}, #0]", dst))?;
                // sign check on the float bits and the integer is the same
                self.write("cmp r0, #0")?;
                self.write("it lt")?;
                // integer 0 is 0.0f; GAS always widens movslt to movw, so we
                // emit movw for bit-exactness
                self.write("movwlt r0, #0")?;
                self.write(&format!("stm {}!, {{r0}}", dst))
            }
            Op::Vmul { dst, a, b } => {
                let (dst, a, b) = (self.reg(*dst), self.reg(*a), self.reg(*b));
                self.write(&format!("vmul.f32 {}, {}, {}", dst, a, b))
            }
            Op::Vadd { dst, a, b } => {
                let (dst, a, b) = (self.reg(*dst), self.reg(*a), self.reg(*b));
                self.write(&format!("vadd.f32 {}, {}, {}", dst, a, b))
            }
            Op::Vcvt { mode, dst, src } => {
                let (dst, src) = (self.reg(*dst), self.reg(*src));
                self.write(&format!("{} {}, {}", mode.asm_name(), dst, src))
            }
            Op::Vmax { dst, a, b } => {
                let (dstr, ar, br) = (self.reg(*dst), self.reg(*a), self.reg(*b));
                if dstr == br {
                    return Err(CompileError::internal("vmax aliases its second operand"));
                }
                if ar != dstr {
                    self.write(&format!("vmov.f32 {}, {}", dstr, ar))?;
                }
                self.write(&format!("vcmp.f32 {}, {}", dstr, br))?;
                self.write("vmrs APSR_nzcv, FPSCR")?;
                self.write("it mi")?;
                self.write(&format!("vmovmi.f32 {}, {}", dstr, br))
            }
            Op::Fcall { name, dst, num } => {
                let dst = self.reg(*dst);
                self.write(&format!("mov r0, {}", dst))?;
                self.load_const("r1", *num as i64)?;
                self.write(&format!("bl {}", name))?;
                if !self.used_fns.contains(name) {
                    self.used_fns.push(*name);
                }
                Ok(())
            }
        }
    }

    fn write_array(&mut self, lbl: &str, vals: &[f32]) -> Result<(), CompileError> {
        self.write(&format!("{}:", lbl))?;
        for v in vals {
            self.write(&format!(".float {}", v))?;
        }
        Ok(())
    }
}

fn add_shape(header: &mut Vec<String>, shape: &[usize], lbl: &str) {
    for s in shape {
        header.push(format!("{} // {} shape", s, lbl));
    }
    header.push(format!("0 // end of {} shape", lbl));
}

/// Render the compiled op list as a complete self-describing Thumb file:
/// header words, model code, runtime helpers, weight pool, optional test
/// vectors.
pub(crate) fn to_thumb(info: &ModelInfo, ops: &[Op]) -> Result<String, CompileError> {
    let has_test = info.include_test && info.test_input.is_some();
    let mut header = vec![
        "0x30470f62  // magic".to_string(),
        "0x46344c4d  // more magic; ML4F".to_string(),
        "_start_model-_header // header size".to_string(),
        "_end-_header // total size of compiled object".to_string(),
        "_weights-_header // offset of weights".to_string(),
        if has_test {
            "_testInput-_header".to_string()
        } else {
            "0 // no tests".to_string()
        },
        if has_test {
            "_testOutput-_header".to_string()
        } else {
            "0 // no tests".to_string()
        },
        format!("{} // arena size", byte_offset(info.arena_size)),
        format!("{}  // offset of input data", byte_offset(0)),
        "1 // input type - float32".to_string(),
        format!("{}  // offset of output data", byte_offset(info.output_offset)),
        "1 // output type - float32".to_string(),
    ];
    for _ in 0..4 {
        header.push("0 // padding".to_string());
    }
    add_shape(&mut header, &info.input_shape, "input");
    add_shape(&mut header, &info.output_shape, "output");

    let mut r = Renderer {
        text: String::new(),
        ind: String::new(),
        alloc: HashMap::new(),
        lblid: 0,
        used_fns: Vec::new(),
    };
    r.text.push_str(&comment_text(&info.stats_comment));
    r.text.push_str(
        "\n    .cpu cortex-m4\n    .text\n    .arch armv7e-m\n    .syntax unified\n    .thumb\n    .thumb_func\n    .fpu fpv4-sp-d16\n// ABI: r0 -> points to magic, r1 -> points to RAM arena\n_header:\n",
    );
    for h in &header {
        r.write(&format!(".word {}", h))?;
    }

    r.alloc.insert(Reg::InputPtr, 1);
    r.alloc.insert(Reg::OutputPtr, 2);
    r.alloc.insert(Reg::KernelPtr, 3);
    r.alloc.insert(Reg::DataDescPtr, 7);

    r.write("_start_model:")?;
    r.write("push {r4,r5,r6,r7,r8,r9,r10,r11,r12,lr}")?;
    let ddp = r.reg(Reg::DataDescPtr);
    r.write(&format!("mov {}, r1", ddp))?;
    r.write("ldr r1, [r0, #4*4] // weight offset")?;
    r.write("adds r1, r0 // weight addr")?;
    r.write(&format!("str r1, [{}, #{}]", ddp, WEIGHT_ADDR_OFFSET))?;
    r.write("movs r1, #0")?;
    r.write(&format!("str r1, [{}, #{}]", ddp, ZERO_OFFSET))?;

    // leading comments are already covered by the file header comment
    let mut body = ops;
    while let Some((Op::Comment { .. }, rest)) = body.split_first() {
        body = rest;
    }
    r.ops(body)?;
    r.write("pop {r4,r5,r6,r7,r8,r9,r10,r11,r12,pc}")?;

    let mut fns = r.used_fns.clone();
    let mut i = 0;
    while i < fns.len() {
        for d in asm_deps(fns[i]) {
            if !fns.contains(d) {
                fns.push(d);
            }
        }
        i += 1;
    }
    for name in &fns {
        let text = asm_fn(name)
            .ok_or_else(|| CompileError::internal(format!("unknown runtime routine: {}", name)))?;
        r.write(text)?;
    }

    r.write(".balign 4")?;
    r.write(&format!("_weights:\n{}", info.weight_asm))?;
    if has_test {
        let test_input = info
            .test_input
            .as_deref()
            .ok_or_else(|| CompileError::internal("test input missing"))?;
        let test_output = info
            .test_output
            .as_deref()
            .ok_or_else(|| CompileError::internal("test output missing"))?;
        r.write_array("_testInput", test_input)?;
        r.write_array("_testOutput", test_output)?;
    }
    r.write("_end:")?;
    Ok(r.text)
}

// Runtime helper routines, pulled in on demand by `fcall` ops.

// based on https://stackoverflow.com/questions/29381117
const EXPF_ASM: &str = "
expf_asm:
	vldr.32	s15, .L10
	vcmpe.f32	s0, s15
	vmrs	APSR_nzcv, FPSCR
	bmi	.L5
	vldr.32	s15, .L10+4
	vcmpe.f32	s0, s15
	vmrs	APSR_nzcv, FPSCR
	bgt	.L9
	vldr.32	s15, .L10+8
	vldr.32	s9, .L10+12
	vldr.32	s6, .L10+16
	vldr.32	s7, .L10+20
	vldr.32	s10, .L10+24
	vldr.32	s8, .L10+28
	vldr.32	s11, .L10+32
	vldr.32	s12, .L10+36
	vldr.32	s13, .L10+40
	vmul.f32	s15, s0, s15
	vmov.f32	s14, #1.0
	vadd.f32	s15, s15, s9
	vsub.f32	s15, s15, s9
	vfma.f32	s0, s15, s6
	vcvt.s32.f32	s9, s15
	vfma.f32	s0, s15, s7
	vmov.f32	s15, s10
	vfma.f32	s15, s8, s0
	vmov	r3, s9	// int
	vfma.f32	s11, s15, s0
	vfma.f32	s12, s11, s0
	vfma.f32	s13, s12, s0
	vmov.f32	s15, s13
	vmov.f32	s13, s14
	vfma.f32	s13, s15, s0
	vfma.f32	s14, s13, s0
	vmov	r2, s14	// int
	add	r3, r2, r3, lsl #23
	vmov	s0, r3	// int
	bx	lr
.L9:
	vldr.32	s15, .L10+44
	vmov.f32	s14, #1.0
	vdiv.f32	s0, s14, s15
	bx	lr
.L5:
	vldr.32	s0, .L10+44
	bx	lr
.L11:
	.align	2
.L10:
	.word	3265921024
	.word	1118699520
	.word	1069066811
	.word	1262485504
	.word	3207688704
	.word	3049242254
	.word	1007234926
	.word	984915968
	.word	1026207149
	.word	1042983464
	.word	1056964603
	.word	0
";

const SOFTMAX_ASM: &str = "
softmax:
	cmp	r1, #1
	push	{r3, r4, r5, lr}
	vldr.32	s5, [r0]
	bls	.L13
	adds	r3, r0, #4
	add	r2, r0, r1, lsl #2
.L16:
	vldmia.32	r3!, {s15}
	vcmp.f32	s15, s5
	vmrs	APSR_nzcv, FPSCR
	it	gt
	vmovgt.f32	s5, s15
	cmp	r2, r3
	bne	.L16
.L17:
	movs	r4, #0
	vmov	s4, r4
	mov	r5, r0
.L19:
	vldr.32	s0, [r5]
	vsub.f32	s0, s0, s5
	bl	expf_asm
	adds	r4, #1
	cmp	r1, r4
	vadd.f32	s4, s4, s0
	vstmia.32	r5!, {s0}
	bhi	.L19
	movs	r3, #0
.L20:
	vldr.32	s14, [r0]
	vdiv.f32	s15, s14, s4
	adds	r3, #1
	cmp	r1, r3
	vstmia.32	r0!, {s15}
	bhi	.L20
	pop	{r3, r4, r5, pc}
.L13:
	cmp	r1, #0
	bne	.L17
	pop	{r3, r4, r5, pc}
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::ModelInfo;
    use crate::ir;

    fn mk_info() -> ModelInfo {
        ModelInfo {
            input_shape: vec![3],
            output_shape: vec![2],
            output_offset: 3,
            arena_size: 5,
            min_arena_size: 5,
            weight_bytes: vec![0; 8],
            weight_asm: ".float 1\n.float 2\n".to_string(),
            stats_comment: "total cycles: 42 (0.001ms at 84MHz)".to_string(),
            include_test: false,
            test_input: None,
            test_output: None,
        }
    }

    #[test]
    fn header_and_frame_are_emitted() {
        let info = mk_info();
        let text = to_thumb(&info, &[]).unwrap();
        assert!(text.starts_with("// total cycles: 42"));
        assert!(text.contains(".word 0x30470f62  // magic"));
        assert!(text.contains(".word 28 // arena size")); // 4*(5+2)
        assert!(text.contains(".word 20  // offset of output data")); // 4*(3+2)
        assert!(text.contains("push {r4,r5,r6,r7,r8,r9,r10,r11,r12,lr}"));
        assert!(text.contains("pop {r4,r5,r6,r7,r8,r9,r10,r11,r12,pc}"));
        assert!(text.contains("_weights:\n.float 1"));
        assert!(text.ends_with("_end:\n"));
        assert!(!text.contains("_testInput"));
    }

    #[test]
    fn repeats_use_scoped_counters() {
        let info = mk_info();
        let mut ids = ir::IdAlloc::new();
        let ops = vec![ir::repeat(&mut ids, 3, |_| {
            vec![ir::add_ptr(Reg::InputPtr, None, 1)]
        })];
        let text = to_thumb(&info, &ops).unwrap();
        assert!(text.contains("movs r4, #3"));
        assert!(text.contains(".l.0:  // rep 3"));
        assert!(text.contains("subs r4, #1"));
        assert!(text.contains("bne .l.0"));
        assert!(text.contains("addw r1, r1, #4"));
    }

    #[test]
    fn defined_counter_counts_up() {
        let info = mk_info();
        let mut ids = ir::IdAlloc::new();
        let ops = vec![ir::repeat_idx(&mut ids, 4, |_, i| {
            vec![ir::add_ptr_base(Reg::OutputPtr, Some(i), 2, Reg::DataDescPtr)]
        })];
        let text = to_thumb(&info, &ops).unwrap();
        assert!(text.contains("movs r4, #0"));
        assert!(text.contains("adds r4, #1"));
        assert!(text.contains("cmp r4, #4"));
        assert!(text.contains("blt .l.0"));
        // scaled index: mult*4 into r0, then multiply by the index register
        assert!(text.contains("movs r0, #8"));
        assert!(text.contains("muls r0, r4"));
        assert!(text.contains("adds r2, r7, r0"));
    }

    #[test]
    fn fcall_pulls_in_helper_routines() {
        let info = mk_info();
        let ops = vec![
            ir::load_data_addr(Reg::OutputPtr, 3),
            ir::fcall("softmax", Reg::OutputPtr, 2),
        ];
        let text = to_thumb(&info, &ops).unwrap();
        assert!(text.contains("bl softmax"));
        assert!(text.contains("\nsoftmax:"));
        assert!(text.contains("\nexpf_asm:"));
    }

    #[test]
    fn test_vectors_are_embedded_when_requested() {
        let mut info = mk_info();
        info.include_test = true;
        info.test_input = Some(vec![1.0, 2.0, 3.0]);
        info.test_output = Some(vec![0.5, 0.5]);
        let text = to_thumb(&info, &[]).unwrap();
        assert!(text.contains(".word _testInput-_header"));
        assert!(text.contains("_testInput:\n.float 1\n.float 2\n.float 3"));
        assert!(text.contains("_testOutput:\n.float 0.5"));
    }

    #[test]
    fn undefined_scratch_pointer_is_an_internal_error() {
        let info = mk_info();
        // Tmp0 is read without a defining add_ptr
        let ops = vec![ir::add_ptr(Reg::Tmp(0), None, 1)];
        let err = to_thumb(&info, &ops).unwrap_err();
        assert!(matches!(err, CompileError::Internal { .. }));
    }

    #[test]
    fn defining_add_ptr_allocates_its_register() {
        let info = mk_info();
        let mut ids = ir::IdAlloc::new();
        let ops = vec![ir::repeat(&mut ids, 2, |_| {
            vec![
                ir::add_ptr_def(Reg::Tmp(0), 6, Reg::InputPtr),
                ir::add_ptr(Reg::Tmp(0), None, 1),
            ]
        })];
        let text = to_thumb(&info, &ops).unwrap();
        // r4 is the loop counter, r5 the scratch pointer
        assert!(text.contains("addw r5, r1, #24"));
        assert!(text.contains("addw r5, r5, #4"));
    }
}
