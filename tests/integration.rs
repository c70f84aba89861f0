//! Assembler integration tests against known-good Thumb encodings.
//!
//! The `expect` helper takes a listing where each line carries its expected
//! machine words as a leading hex column, assembles the instruction column
//! and compares word for word. `expect_error` asserts a source fragment is
//! rejected with a diagnostic rather than silently mis-assembled.

use thumbnet::asm::File;
use thumbnet::thumb::ThumbProcessor;

// ── Helpers ──────────────────────────────────────────────────────────

fn leading_hex_len(line: &str) -> usize {
    line.bytes().take_while(u8::is_ascii_hexdigit).count()
}

/// Assemble the instruction column of `disasm` and compare against the
/// leading hex words.
fn expect(disasm: &str) {
    let mut exp: Vec<u16> = Vec::new();
    let mut asm = String::new();
    for line in disasm.lines() {
        let mut rest = line;
        let n = leading_hex_len(line);
        let followed_by_space = line.as_bytes().get(n).map_or(true, u8::is_ascii_whitespace);
        if (n == 4 || n == 8) && followed_by_space {
            exp.push(u16::from_str_radix(&line[..4], 16).unwrap());
            if n == 8 {
                exp.push(u16::from_str_radix(&line[4..8], 16).unwrap());
            }
            rest = &line[n..];
        }
        asm.push_str(rest);
        asm.push('\n');
    }

    let proc = ThumbProcessor::new();
    let mut f = File::new(&proc);
    f.disable_peephole = true;
    f.emit(&asm);
    assert!(f.error().is_none(), "unexpected errors: {:?}", f.error());
    let words: Vec<u16> = f
        .bytes()
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(words, exp, "assembled:\n{}", asm);
}

fn expect_error(src: &str) {
    let proc = ThumbProcessor::new();
    let mut f = File::new(&proc);
    f.disable_peephole = true;
    f.emit(&format!("@nostackcheck\n{}", src));
    assert!(f.error().is_some(), "expected an error for `{}`", src);
}

// ── Rejected fragments ───────────────────────────────────────────────

#[test]
fn rejects_malformed_source() {
    expect_error("lsl r0, r0, #8"); // flag-setting form required
    expect_error("push {r17}");
    expect_error("mov r0, r1 foo");
    expect_error("movs r14, #100"); // high register with 8-bit immediate
    expect_error("push {r0");
    expect_error("push lr,r0}");
    expect_error("b #+11"); // unaligned branch target
    expect_error("b #+10240000"); // out of range
    expect_error("bne undefined_label");
    expect_error(".foobar");
}

// ── Golden encodings ─────────────────────────────────────────────────

#[test]
fn basic_block_with_literals() {
    expect(
        "0200      lsls    r0, r0, #8\n\
         b500      push    {lr}\n\
         2064      movs    r0, #100        ; 0x64\n\
         b401      push    {r0}\n\
         bc08      pop     {r3}\n\
         b501      push    {r0, lr}\n\
         bd20      pop {r5, pc}\n\
         bc01      pop {r0}\n\
         4770      bx      lr\n\
         0000      .balign 4\n\
         e6c0      .word   -72000\n\
         fffe\n",
    );
}

#[test]
fn label_resolution() {
    expect(
        "4291      cmp     r1, r2\n\
         d100      bne     l6\n\
         e000      b       l8\n\
         1840  l6: adds    r0, r0, r1\n\
         4718  l8: bx      r3\n",
    );
}

#[test]
fn stack_tracking_directives() {
    expect(
        "          @stackmark base\n\
         b403      push    {r0, r1}\n\
                   @stackmark locals\n\
         9801      ldr     r0, [sp, locals@1]\n\
         b401      push    {r0}\n\
         9802      ldr     r0, [sp, locals@1]\n\
         bc01      pop     {r0}\n\
                   @stackempty locals\n\
         9901      ldr     r1, [sp, locals@1]\n\
         9102      str     r1, [sp, base@0]\n\
                   @stackempty locals\n\
         b002      add     sp, #8\n\
                   @stackempty base\n",
    );
}

#[test]
fn sp_adjustment_with_expressions() {
    expect(
        "b090      sub sp, #4*16\n\
         b010      add sp, #4*16\n",
    );
}

#[test]
fn string_directives() {
    expect(
        "6261      .string \"abc\"\n\
         0063      \n",
    );
    expect(
        "6261      .string \"abcde\"\n\
         6463      \n\
         0065      \n",
    );
}

#[test]
fn single_instruction_encodings() {
    expect(
        "3042      adds r0, 0x42\n\
         1c0d      adds r5, r1, #0\n\
         d100      bne #0\n\
         2800      cmp r0, #0\n\
         6b28      ldr r0, [r5, #48]\n\
         0200      lsls r0, r0, #8\n\
         2063      movs r0, 0x63\n\
         4240      negs r0, r0\n\
         46c0      nop\n\
         b500      push {lr}\n\
         b401      push {r0}\n\
         b402      push {r1}\n\
         b404      push {r2}\n\
         b408      push {r3}\n\
         b520      push {r5, lr}\n\
         bd00      pop {pc}\n\
         bc01      pop {r0}\n\
         bc02      pop {r1}\n\
         bc04      pop {r2}\n\
         bc08      pop {r3}\n\
         bd20      pop {r5, pc}\n\
         9003      str r0, [sp, #4*3]\n",
    );
}

// ── Whole-file behavior ──────────────────────────────────────────────

fn assemble_ok(src: &str, peephole: bool) -> Vec<u8> {
    let proc = ThumbProcessor::new();
    let mut f = File::new(&proc);
    f.disable_peephole = !peephole;
    f.emit(src);
    assert!(f.error().is_none(), "unexpected errors: {:?}", f.error());
    f.bytes()
}

#[test]
fn literal_loads_get_a_pool() {
    let src = "@nostackcheck\nldr r0, =0x12345678\nbx lr\n";
    let bytes = assemble_ok(src, false);
    let words: Vec<u16> = bytes
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    // the constant lands in a pool after the code
    let pos = words
        .windows(2)
        .position(|w| w == [0x5678, 0x1234])
        .expect("literal not found in pool");
    assert!(pos > 0);
    // the load itself is a pc-relative ldr (short form 0x48xx)
    assert_eq!(words[0] & 0xf800, 0x4800);
}

#[test]
fn unbalanced_stack_is_reported() {
    let proc = ThumbProcessor::new();
    let mut f = File::new(&proc);
    f.emit("push {r0}\n");
    assert!(f.error().is_some());

    let balanced = "push {r0}\npop {r0}\n";
    let proc2 = ThumbProcessor::new();
    let mut f2 = File::new(&proc2);
    f2.emit(balanced);
    assert!(f2.error().is_none());
}

#[test]
fn peephole_merges_pushes_and_pops() {
    let src = "push {lr}\npush {r0}\npop {r0}\npop {pc}\n";
    let plain = assemble_ok(src, false);
    let peeped = assemble_ok(src, true);
    assert_eq!(plain.len(), 8);
    // push {lr}; push {r0} -> push {r0, lr} and pop {r0}; pop {pc} -> pop {r0, pc}
    let words: Vec<u16> = peeped
        .chunks(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    assert_eq!(words, vec![0xb501, 0xbd01]);
}

#[test]
fn peephole_is_idempotent() {
    let src = "push {lr}\npush {r0}\npop {r0}\npop {pc}\n";
    assert_eq!(assemble_ok(src, true), assemble_ok(src, true));
}

#[test]
fn assembly_is_deterministic() {
    let src = "@nostackcheck\n\
               movs r0, #0\n\
               l0: adds r0, #1\n\
               cmp r0, #10\n\
               blt l0\n\
               bx lr\n";
    assert_eq!(assemble_ok(src, true), assemble_ok(src, true));
    assert_eq!(assemble_ok(src, false), assemble_ok(src, false));
}
