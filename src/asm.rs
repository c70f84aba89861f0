//! Generic multi-pass assembler engine.
//!
//! [`File`] parses a source text into [`Line`]s and emits the binary into a
//! halfword buffer. Assembly runs in passes: a first pass collects label
//! addresses (branch operands get placeholders), literal pools are expanded,
//! labels are re-collected, and a final pass re-emits with every label
//! required to land on the address recorded for it. Optional peephole passes
//! then rewrite instruction pairs and re-run the label fixpoint, up to a
//! bounded number of times.
//!
//! The engine is architecture-agnostic; everything instruction-specific
//! comes in through [`Processor`](crate::processor::Processor).

use std::collections::HashMap;

use crate::error::{AsmDiagnostic, AsmError};
use crate::float16;
use crate::processor::{Instruction, Processor};

const MAX_ERRORS: usize = 10;
const MAX_PEEP_PASSES: u32 = 5;

/// Counters for one peephole pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct PeepStats {
    /// Lines rewritten (including deletions).
    pub ops: u32,
    /// Lines rewritten to nothing.
    pub dels: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Empty,
    Label,
    Directive,
    Instruction,
}

/// One line of assembly source, plus what assembly learned about it.
pub struct Line<'p> {
    pub text: String,
    pub words: Vec<String>,
    pub kind: LineKind,
    pub scope: String,
    pub line_no: u32,
    /// Buffer offset the line was emitted at, once known.
    pub location: Option<i64>,
    /// The template that matched, cached across passes.
    pub instruction: Option<&'p Instruction>,
    /// Raw operand values from the last successful emit.
    pub num_args: Vec<i64>,
}

impl<'p> Line<'p> {
    fn new(text: String, scope: String, line_no: u32) -> Self {
        Line {
            text,
            words: Vec::new(),
            kind: LineKind::Empty,
            scope,
            line_no,
            location: None,
            instruction: None,
            num_args: Vec::new(),
        }
    }

    /// Mnemonic of the matched template, or `""`.
    #[must_use]
    pub fn op(&self) -> &str {
        self.instruction.map_or("", |i| i.name.as_str())
    }

    /// Canonical format of the matched template, or `""`.
    #[must_use]
    pub fn op_ext(&self) -> &str {
        self.instruction.map_or("", |i| i.code.as_str())
    }

    /// Replace the line with new text (peephole rewriting). The old text is
    /// kept as a `; WAS:` comment for the listing.
    pub fn update(&mut self, s: &str, stats: &mut PeepStats) {
        stats.ops += 1;
        let s = s.trim_start();
        if s.is_empty() {
            stats.dels += 1;
        }
        let mut t = String::from("    ");
        if !s.is_empty() {
            t.push_str(s);
            t.push_str("      ");
        }
        self.text = format!("{}; WAS: {}", t, self.text.trim());
        self.instruction = None;
        self.num_args.clear();
        self.words = tokenize(&t).unwrap_or_default();
        if self.words.is_empty() {
            self.kind = LineKind::Empty;
        } else if self.words[0].starts_with('@') {
            self.kind = LineKind::Directive;
        }
    }
}

/// An assembly unit: source lines, label tables, and the output buffer.
pub struct File<'p> {
    ei: &'p dyn Processor,
    pub lines: Vec<Line<'p>>,
    pub base_offset: i64,
    pub check_stack: bool,
    /// Reject labels starting with `_` (reserved when assembling inline
    /// user fragments).
    pub inline_mode: bool,
    pub disable_peephole: bool,
    pub errors: Vec<AsmDiagnostic>,
    labels: HashMap<String, i64>,
    equs: HashMap<String, i64>,
    stackpointers: HashMap<String, i64>,
    stack: i64,
    buf: Vec<u16>,
    scope: String,
    scope_id: u32,
    curr_line_no: u32,
    real_curr_line_no: u32,
    err_line_no: u32,
    err_line_text: String,
    final_emit: bool,
    peep: PeepStats,
    stats: String,
    emitted: bool,
}

impl<'p> File<'p> {
    #[must_use]
    pub fn new(ei: &'p dyn Processor) -> Self {
        File {
            ei,
            lines: Vec::new(),
            base_offset: 0,
            check_stack: true,
            inline_mode: false,
            disable_peephole: false,
            errors: Vec::new(),
            labels: HashMap::new(),
            equs: HashMap::new(),
            stackpointers: HashMap::new(),
            stack: 0,
            buf: Vec::new(),
            scope: String::new(),
            scope_id: 0,
            curr_line_no: 0,
            real_curr_line_no: 0,
            err_line_no: 0,
            err_line_text: "<start>".to_string(),
            final_emit: false,
            peep: PeepStats::default(),
            stats: String::new(),
            emitted: false,
        }
    }

    /// Assemble `text`. Check [`File::error`] afterwards; on success the
    /// machine code is available through [`File::bytes`].
    pub fn emit(&mut self, text: &str) {
        debug_assert!(!self.emitted);
        self.emitted = true;
        self.prep_lines(text);
        if !self.errors.is_empty() {
            return;
        }
        self.clear_labels();
        self.iter_lines();
        if self.check_stack && self.stack != 0 {
            self.directive_error("stack misaligned at the end of the file".to_string());
        }
        if !self.errors.is_empty() {
            return;
        }
        let ei = self.ei;
        ei.expand_ldlit(self);
        self.clear_labels();
        self.iter_lines();
        self.final_emit = true;
        self.iter_lines();
        if !self.errors.is_empty() {
            return;
        }
        if !self.disable_peephole {
            for i in 0..MAX_PEEP_PASSES {
                log::debug!("peephole pass {}", i);
                self.peep_pass();
                if self.peep.ops == 0 {
                    break;
                }
            }
        }
    }

    /// The accumulated diagnostics, if any.
    #[must_use]
    pub fn error(&self) -> Option<AsmError> {
        if self.errors.is_empty() {
            None
        } else {
            Some(AsmError {
                diagnostics: self.errors.clone(),
            })
        }
    }

    /// Emitted machine code, little-endian.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.buf.len() * 2);
        for w in &self.buf {
            out.extend_from_slice(&w.to_le_bytes());
        }
        out
    }

    /// Label addresses including the base offset.
    #[must_use]
    pub fn label_addresses(&self) -> HashMap<String, i64> {
        self.labels
            .iter()
            .map(|(k, v)| (k.clone(), v + self.base_offset))
            .collect()
    }

    #[must_use]
    pub fn label_address(&self, name: &str) -> Option<i64> {
        self.labels.get(name).map(|v| v + self.base_offset)
    }

    /// Source listing, with `; WAS:` rewrite markers stripped when `clean`.
    #[must_use]
    pub fn listing(&self, clean: bool) -> String {
        let mut res = String::new();
        res.push_str(&self.stats);
        for ln in &self.lines {
            let mut text = ln.text.clone();
            if clean {
                if let Some(pos) = text.find("; WAS: ") {
                    text.truncate(pos);
                }
                if text.trim().is_empty() {
                    continue;
                }
            }
            res.push_str(text.trim_end());
            res.push('\n');
        }
        res
    }

    pub(crate) fn final_emit(&self) -> bool {
        self.final_emit
    }

    pub(crate) fn emit_short(&mut self, op: u16) {
        self.buf.push(op);
    }

    /// Current emit position in bytes (one halfword per buffer slot).
    #[must_use]
    pub fn location(&self) -> i64 {
        self.buf.len() as i64 * 2
    }

    fn align(&mut self, n: i64) {
        debug_assert!(n == 2 || n == 4 || n == 8 || n == 16);
        while self.location() % n != 0 {
            self.emit_short(0);
        }
    }

    fn push_error(&mut self, message: String, hints: String) {
        log::debug!(
            "line {} ('{}'): {}",
            self.err_line_no,
            self.err_line_text.trim(),
            message
        );
        self.errors.push(AsmDiagnostic {
            line_no: self.err_line_no,
            line: self.err_line_text.clone(),
            message,
            hints,
        });
    }

    fn directive_error(&mut self, message: String) {
        self.push_error(message, String::new());
    }

    // ---- expression parsing ----

    /// Parse an "integer": decimal, hex, binary, products, differences,
    /// `|1`/`+1`/`-1` suffixes, `>>`, saved-stack slots (`name@n`),
    /// `label@hi/lo/fn`, and plain label references.
    pub fn parse_one_int(&mut self, s: &str) -> Option<i64> {
        if s.is_empty() {
            return None;
        }
        // fast path
        if s.bytes().all(|c| c.is_ascii_digit()) {
            return s.parse().ok();
        }
        if let Some(min_p) = s.find('-') {
            if min_p > 0 {
                let a = self.parse_one_int(&s[..min_p])?;
                let b = self.parse_one_int(&s[min_p + 1..])?;
                return Some(a - b);
            }
        }
        let mut mul = 1i64;
        let mut s = s;
        while let Some(star) = s.find('*') {
            mul *= self.parse_one_int(&s[..star])?;
            s = &s[star + 1..];
        }
        if let Some(rest) = s.strip_prefix('-') {
            mul = -mul;
            s = rest;
        } else if let Some(rest) = s.strip_prefix('+') {
            s = rest;
        }
        if s.bytes().all(|c| c.is_ascii_digit()) && !s.is_empty() {
            return Some(mul * s.parse::<i64>().ok()?);
        }
        if let Some(rest) = s.strip_suffix("|1") {
            return Some(self.parse_one_int(rest)? | 1);
        }
        if let Some(rest) = s.strip_suffix("-1") {
            return Some(self.parse_one_int(rest)? - 1);
        }
        if let Some(rest) = s.strip_suffix("+1") {
            return Some(self.parse_one_int(rest)? + 1);
        }
        if let Some(pos) = s.rfind(">>") {
            let sh = &s[pos + 2..];
            if !sh.is_empty() && sh.bytes().all(|c| c.is_ascii_digit()) {
                let mut left = self.parse_one_int(&s[..pos])?;
                let mask = self.base_offset & !0xff_ffff;
                left &= !mask;
                return Some(left >> sh.parse::<u32>().ok()?.min(63));
            }
        }
        let mut v: Option<i64> = None;
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if !hex.is_empty() && hex.bytes().all(|c| c.is_ascii_hexdigit()) {
                v = i64::from_str_radix(hex, 16).ok();
            }
        } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
            if !bin.is_empty() && bin.bytes().all(|c| c == b'0' || c == b'1') {
                v = i64::from_str_radix(bin, 2).ok();
            }
        }
        if let Some(at) = s.rfind('@') {
            let (base, suffix) = (&s[..at], &s[at + 1..]);
            if !base.is_empty()
                && base.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
                && is_plain_signed_int(suffix)
            {
                if mul != 1 {
                    self.directive_error(
                        "multiplication not supported with saved stacks".to_string(),
                    );
                }
                if let Some(&sp) = self.stackpointers.get(base) {
                    let n: i64 = suffix.parse().ok()?;
                    v = Some(self.ei.word_size() * (self.stack - sp + n));
                } else {
                    self.directive_error("saved stack not found".to_string());
                }
            } else if matches!(suffix, "hi" | "lo" | "fn") && self.looks_like_label(base) {
                let base = base.to_string();
                if let Some(mut lv) = self.lookup_label_direct(&base) {
                    if suffix == "fn" {
                        v = Some(self.ei.to_fn_ptr(lv, self.base_offset));
                    } else {
                        lv >>= 1;
                        if (0..=0xffff).contains(&lv) {
                            v = Some(if suffix == "hi" { (lv >> 8) & 0xff } else { lv & 0xff });
                        } else {
                            self.directive_error("@hi/lo out of range".to_string());
                            v = None;
                        }
                    }
                }
            }
        }
        if v.is_none() && self.looks_like_label(s) {
            let name = s.to_string();
            v = self.lookup_label_direct(&name);
            if let Some(val) = v {
                if self.ei.post_process_rel_address(self, 1) == 1 {
                    v = Some(val + self.base_offset);
                }
            }
        }
        v.map(|x| x * mul)
    }

    fn looks_like_label(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        if matches!(lower.as_str(), "pc" | "sp" | "lr") {
            return false;
        }
        let b = lower.as_bytes();
        if b.len() == 2 && b[0] == b'r' && b[1].is_ascii_digit() {
            return false;
        }
        let mut chars = name.bytes();
        match chars.next() {
            Some(c) if c == b'.' || c == b'_' || c.is_ascii_alphabetic() => {}
            _ => return false,
        }
        chars.all(|c| c == b'.' || c == b':' || c == b'+' || c == b'_' || c.is_ascii_alphanumeric())
    }

    fn scoped_name(&self, name: &str) -> String {
        if name.starts_with('.') && !self.scope.is_empty() {
            format!("{}${}", self.scope, name)
        } else {
            name.to_string()
        }
    }

    /// Look a label (or `.equ` constant) up in scope.
    #[must_use]
    pub fn lookup_label(&self, name: &str) -> Option<i64> {
        let scoped = self.scoped_name(name);
        self.labels
            .get(&scoped)
            .copied()
            .map(|x| self.ei.post_process_rel_address(self, x))
            .or_else(|| self.equs.get(&scoped).copied())
    }

    /// Like [`File::lookup_label`], but unknown labels get a placeholder
    /// value on non-final passes and an error on the final one.
    fn lookup_label_direct(&mut self, name: &str) -> Option<i64> {
        match self.lookup_label(name) {
            Some(v) => Some(v),
            None => {
                if self.final_emit {
                    self.directive_error(format!("unknown label: {}", name));
                    None
                } else {
                    // use a number over 1 byte
                    Some(11111)
                }
            }
        }
    }

    // ---- directives ----

    fn parse_numbers(&mut self, args: &[String]) -> Vec<i64> {
        let mut nums = Vec::new();
        let mut i = 0usize;
        loop {
            let n = match args.get(i).cloned() {
                Some(w) => self.parse_one_int(&w),
                None => None,
            };
            match n {
                Some(n) => {
                    nums.push(n);
                    i += 1;
                }
                None => {
                    self.directive_error(format!(
                        "cannot parse number at '{}'",
                        args.get(i).map_or("", String::as_str)
                    ));
                    break;
                }
            }
            match args.get(i).map(String::as_str) {
                Some(",") => {
                    i += 1;
                    if args.get(i).is_none() {
                        break;
                    }
                }
                None => break,
                Some(w) => {
                    self.directive_error(format!("expecting number, got '{}'", w));
                    break;
                }
            }
        }
        nums
    }

    fn emit_string(&mut self, text: &str, utf16: bool) {
        let parsed = text
            .find('"')
            .zip(text.rfind('"'))
            .filter(|(a, b)| b > a && text[b + 1..].trim().is_empty())
            .and_then(|(a, b)| parse_string(&text[a..=b]));
        let s = match parsed {
            Some(s) => s,
            None => {
                self.directive_error("expecting string".to_string());
                return;
            }
        };
        self.align(2);
        if utf16 {
            for u in s.encode_utf16() {
                self.emit_short(u);
            }
        } else {
            let bytes = s.as_bytes();
            let at = |i: usize| -> u16 { bytes.get(i).copied().unwrap_or(0) as u16 };
            // length + 1 to NUL terminate
            let mut i = 0;
            while i < bytes.len() + 1 {
                self.emit_short((at(i + 1) << 8) | at(i));
                i += 2;
            }
        }
    }

    fn emit_space(&mut self, args: &[String]) {
        let mut nums = self.parse_numbers(args);
        if nums.len() == 1 {
            nums.push(0);
        }
        if nums.len() != 2 {
            self.directive_error("expecting one or two numbers".to_string());
        } else if nums[0] % 2 != 0 {
            self.directive_error("only even space supported".to_string());
        } else {
            let f = (nums[1] & 0xff) as u16;
            let f = f | (f << 8);
            let mut i = 0;
            while i < nums[0] {
                self.emit_short(f);
                i += 2;
            }
        }
    }

    fn emit_bytes(&mut self, args: &[String]) {
        let mut nums = self.parse_numbers(args);
        if nums.len() % 2 != 0 {
            self.directive_error(".bytes needs an even number of arguments".to_string());
            nums.push(0);
        }
        for pair in nums.chunks(2) {
            let (n0, n1) = (pair[0], pair[1]);
            if (0..=0xff).contains(&n0) && (0..=0xff).contains(&n1) {
                self.emit_short(((n0 & 0xff) | ((n1 & 0xff) << 8)) as u16);
            } else {
                self.directive_error("expecting uint8".to_string());
            }
        }
    }

    fn emit_hex(&mut self, args: &[String]) {
        for w in args {
            if w == "," {
                continue;
            }
            if w.len() % 4 != 0 {
                self.directive_error(".hex needs an even number of bytes".to_string());
            } else if !w.bytes().all(|c| c.is_ascii_hexdigit()) {
                self.directive_error(".hex needs a hex number".to_string());
            } else {
                for i in (0..w.len()).step_by(4) {
                    if let Ok(n) = u16::from_str_radix(&w[i..i + 4], 16) {
                        self.emit_short(((n & 0xff) << 8) | ((n >> 8) & 0xff));
                    }
                }
            }
        }
    }

    fn emit_floats(&mut self, args: &[String], half: bool) {
        for w in args {
            if w == "," {
                continue;
            }
            match w.parse::<f32>() {
                Ok(v) => {
                    if half {
                        self.emit_short(float16::to_half(v));
                    } else {
                        let n = v.to_bits();
                        self.emit_short((n & 0xffff) as u16);
                        self.emit_short((n >> 16) as u16);
                    }
                }
                Err(_) => {
                    self.directive_error(if half {
                        "invalid .float16".to_string()
                    } else {
                        "invalid .float".to_string()
                    });
                }
            }
        }
    }

    fn expect_one(&mut self, words: &[String]) {
        if words.len() != 2 {
            self.directive_error("expecting one argument".to_string());
        }
    }

    fn handle_directive(&mut self, l: &Line<'p>) {
        let words = l.words.clone();
        match words[0].as_str() {
            ".ascii" | ".asciz" | ".string" => self.emit_string(&l.text, false),
            ".utf16" => self.emit_string(&l.text, true),
            ".align" => {
                self.expect_one(&words);
                match words.get(1).and_then(|w| self.parse_one_int(w)) {
                    Some(0) => {}
                    Some(n) if (1..=4).contains(&n) => self.align(1 << n),
                    Some(_) => self.directive_error(
                        "expecting 1, 2, 3 or 4 (for 2, 4, 8, or 16 byte alignment)".to_string(),
                    ),
                    None => self.directive_error("expecting number".to_string()),
                }
            }
            ".balign" => {
                self.expect_one(&words);
                match words.get(1).and_then(|w| self.parse_one_int(w)) {
                    Some(1) => {}
                    Some(n) if n == 2 || n == 4 || n == 8 || n == 16 => self.align(n),
                    Some(_) => self.directive_error("expecting 2, 4, 8, or 16".to_string()),
                    None => self.directive_error("expecting number".to_string()),
                }
            }
            ".p2align" => {
                self.expect_one(&words);
                match words.get(1).and_then(|w| self.parse_one_int(w)) {
                    Some(0) => {}
                    Some(n) if (1..=4).contains(&n) => self.align(1 << n),
                    _ => self.directive_error("expecting number".to_string()),
                }
            }
            ".byte" => self.emit_bytes(&words[1..]),
            ".hex" => self.emit_hex(&words[1..]),
            ".float" => self.emit_floats(&words[1..], false),
            ".float16" => self.emit_floats(&words[1..], true),
            ".hword" | ".short" | ".2bytes" => {
                for n in self.parse_numbers(&words[1..]) {
                    // negative numbers allowed
                    if (-0x8000..=0xffff).contains(&n) {
                        self.emit_short((n & 0xffff) as u16);
                    } else {
                        self.directive_error("expecting int16".to_string());
                    }
                }
            }
            ".word" | ".4bytes" | ".long" => {
                for n in self.parse_numbers(&words[1..]) {
                    if (-0x8000_0000..=0xffff_ffff).contains(&n) {
                        self.emit_short((n & 0xffff) as u16);
                        self.emit_short(((n >> 16) & 0xffff) as u16);
                    } else {
                        self.directive_error("expecting int32".to_string());
                    }
                }
            }
            ".skip" | ".space" => self.emit_space(&words[1..]),
            ".set" | ".equ" => {
                let name = words.get(1).cloned().unwrap_or_default();
                if name.is_empty() || !name.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_')
                {
                    self.directive_error("expecting name".to_string());
                    return;
                }
                let skip = if matches!(words.get(2).map(String::as_str), Some(",") | Some("=")) {
                    3
                } else {
                    2
                };
                let nums = self.parse_numbers(&words[skip..]);
                if nums.len() != 1 {
                    self.directive_error("expecting one value".to_string());
                    return;
                }
                if let Some(&old) = self.equs.get(&name) {
                    if old != nums[0] {
                        self.directive_error(format!("redefinition of {}", name));
                    }
                }
                self.equs.insert(name, nums[0]);
            }
            ".startaddr" => {
                if self.location() != 0 {
                    self.directive_error(
                        ".startaddr can be only be specified at the beginning of the file"
                            .to_string(),
                    );
                }
                self.expect_one(&words);
                match words.get(1).and_then(|w| self.parse_one_int(w)) {
                    Some(n) => self.base_offset = n,
                    None => self.directive_error("expecting number".to_string()),
                }
            }
            // Usage:
            //   push {...}
            //   @stackmark locals   ; locals := sp
            //   ldr r0, [sp, locals@3] ; load local number 3
            //   @stackempty locals  ; expect an empty stack here
            "@stackmark" => {
                self.expect_one(&words);
                if let Some(name) = words.get(1) {
                    self.stackpointers.insert(name.clone(), self.stack);
                }
            }
            "@stackempty" => {
                if self.check_stack {
                    match words.get(1).and_then(|n| self.stackpointers.get(n)) {
                        None => self.directive_error("no such saved stack".to_string()),
                        Some(&sp) if sp != self.stack => {
                            self.directive_error("stack mismatch".to_string());
                        }
                        Some(_) => {}
                    }
                }
            }
            "@scope" => {
                self.scope = words.get(1).cloned().unwrap_or_default();
                self.curr_line_no = if self.scope.is_empty() {
                    self.real_curr_line_no
                } else {
                    0
                };
            }
            ".syntax" | "@nostackcheck" => self.check_stack = false,
            "@dummystack" => {
                self.expect_one(&words);
                if let Some(n) = words.get(1).and_then(|w| self.parse_one_int(w)) {
                    self.stack += n;
                }
            }
            ".section" | ".global" => {
                self.stackpointers.clear();
                self.stack = 0;
                self.scope = format!("$S{}", self.scope_id);
                self.scope_id += 1;
            }
            ".arch" | ".thumb" | ".file" | ".text" | ".cpu" | ".fpu" | ".eabi_attribute"
            | ".code" | ".thumb_func" | ".type" | ".fnstart" | ".save" | ".size" | ".fnend"
            | ".pad" | ".globl" | ".local" | "@" => {}
            other => {
                if !other.starts_with(".cfi_") {
                    self.directive_error("unknown directive".to_string());
                }
            }
        }
    }

    // ---- instructions ----

    fn handle_one_instruction(&mut self, ln: &mut Line<'p>, instr: &'p Instruction) -> bool {
        let ei = self.ei;
        match instr.emit(ei, self, &ln.words) {
            Ok(op) => {
                self.stack += op.stack;
                if self.check_stack && self.stack < 0 {
                    self.push_error("stack underflow".to_string(), String::new());
                }
                ln.location = Some(self.location());
                self.emit_short(op.opcode);
                if let Some(op2) = op.opcode2 {
                    self.emit_short(op2);
                }
                ln.instruction = Some(instr);
                ln.num_args = op.num_args;
                true
            }
            Err(_) => false,
        }
    }

    fn handle_instruction(&mut self, ln: &mut Line<'p>) {
        let ei = self.ei;
        if let Some(instr) = ln.instruction {
            if self.handle_one_instruction(ln, instr) {
                return;
            }
        }
        for instr in ei.instructions_for(&ln.words[0]) {
            if self.handle_one_instruction(ln, instr) {
                return;
            }
        }
        if let Some(condless) = ei.strip_condition(&ln.words[0]) {
            let ins = ei.instructions_for(&condless);
            if !ins.is_empty() {
                ln.words[0] = condless;
                for instr in ins {
                    if self.handle_one_instruction(ln, instr) {
                        return;
                    }
                }
            }
        }
        let mut w0: String = ln.words[0]
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase())
            .collect();
        if w0.ends_with('s') {
            w0.pop();
        }
        w0 = ei.strip_condition(&w0).unwrap_or(w0);
        let mut hints = String::new();
        let with_s = format!("{}s", w0);
        let possibilities: Vec<&Instruction> = ei
            .instructions_for(&w0)
            .iter()
            .chain(ei.instructions_for(&with_s).iter())
            .collect();
        for i in possibilities {
            if let Err(e) = i.emit(ei, self, &ln.words) {
                hints.push_str(&format!(
                    "   Maybe: {} ({} at '{}')\n",
                    i.friendly_fmt, e.error, e.error_at
                ));
            }
        }
        self.push_error("assembly error".to_string(), hints);
    }

    // ---- line building and passes ----

    /// Parse one source line into `out` (a label prefix becomes its own
    /// line). Exposed for processors that synthesize lines (literal pools).
    pub fn build_line(&mut self, tx: &str, out: &mut Vec<Line<'p>>) {
        let mut l = Line::new(tx.to_string(), self.scope.clone(), self.curr_line_no);
        l.words = tokenize(&l.text).unwrap_or_default();
        let mut w0 = l.words.first().cloned().unwrap_or_default();
        if let Some(name) = w0.strip_suffix(':') {
            if !name.is_empty()
                && name.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
            {
                let name = name.to_string();
                let rest_words = l.words[1..].to_vec();
                l.kind = LineKind::Label;
                l.text = format!("{}:", name);
                l.words = vec![name];
                out.push(l);
                if rest_words.is_empty() {
                    return;
                }
                let rest_text = tx.splitn(2, ':').nth(1).unwrap_or("").to_string();
                l = Line::new(rest_text, self.scope.clone(), self.curr_line_no);
                l.words = rest_words;
                w0 = l.words.first().cloned().unwrap_or_default();
            }
        }
        let c0 = w0.chars().next();
        if c0 == Some('.') || c0 == Some('@') {
            l.kind = LineKind::Directive;
            if l.words[0] == "@scope" {
                self.handle_directive(&l);
            }
        } else if l.words.is_empty() {
            l.kind = LineKind::Empty;
        } else {
            l.kind = LineKind::Instruction;
        }
        out.push(l);
    }

    fn prep_lines(&mut self, text: &str) {
        self.curr_line_no = 0;
        self.real_curr_line_no = 0;
        let mut out = Vec::new();
        for tx in text.split('\n') {
            if self.errors.len() > MAX_ERRORS {
                break;
            }
            let tx = tx.strip_suffix('\r').unwrap_or(tx);
            self.curr_line_no += 1;
            self.real_curr_line_no += 1;
            self.err_line_no = self.curr_line_no;
            self.err_line_text = tx.to_string();
            self.build_line(tx, &mut out);
        }
        self.lines = out;
    }

    fn iter_lines(&mut self) {
        self.stack = 0;
        self.buf.clear();
        self.scope_id = 0;
        let mut lines = std::mem::take(&mut self.lines);
        for l in &mut lines {
            if self.errors.len() > MAX_ERRORS {
                break;
            }
            self.err_line_no = l.line_no;
            self.err_line_text = l.text.clone();
            if l.words.is_empty() {
                continue;
            }
            match l.kind {
                LineKind::Label => {
                    let lblname = self.scoped_name(&l.words[0]);
                    if self.final_emit {
                        if self.equs.contains_key(&lblname) {
                            self.directive_error(".equ redefined as label".to_string());
                        }
                        match self.labels.get(&lblname).copied() {
                            Some(curr) => {
                                // every label must land where the previous
                                // pass put it
                                if self.errors.is_empty() && curr != self.location() {
                                    self.push_error(
                                        format!(
                                            "invalid location: {} != {} at {}",
                                            self.location(),
                                            curr,
                                            lblname
                                        ),
                                        String::new(),
                                    );
                                }
                            }
                            None => {
                                self.push_error(
                                    format!("internal: label {} lost between passes", lblname),
                                    String::new(),
                                );
                            }
                        }
                    } else if self.labels.contains_key(&lblname) {
                        self.directive_error("label redefinition".to_string());
                    } else if self.inline_mode && lblname.starts_with('_') {
                        self.directive_error(
                            "labels starting with '_' are reserved for the compiler".to_string(),
                        );
                    } else {
                        self.labels.insert(lblname, self.location());
                    }
                    l.location = Some(self.location());
                }
                LineKind::Directive => self.handle_directive(l),
                LineKind::Instruction => self.handle_instruction(l),
                LineKind::Empty => {}
            }
        }
        self.lines = lines;
    }

    fn peep_hole(&mut self) {
        let ei = self.ei;
        let mut lines = std::mem::take(&mut self.lines);
        let idx: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.kind != LineKind::Empty)
            .map(|(i, _)| i)
            .collect();
        for w in 0..idx.len() {
            let i = idx[w];
            // skip optimization for user-supplied assembly
            if lines[i].scope.starts_with("user") {
                continue;
            }
            let Some(&j) = idx.get(w + 1) else { continue };
            let k = idx.get(w + 2).copied();
            if lines[i].kind == LineKind::Instruction {
                ei.peephole(&mut lines, i, j, k, &mut self.peep);
            }
        }
        self.lines = lines;
    }

    fn clear_labels(&mut self) {
        self.labels.clear();
    }

    fn peep_pass(&mut self) {
        self.peep = PeepStats::default();
        self.peep_hole();
        self.final_emit = false;
        self.clear_labels();
        self.iter_lines();
        if self.check_stack && self.stack != 0 {
            self.push_error(
                "stack misaligned after peephole pass".to_string(),
                String::new(),
            );
        }
        self.final_emit = true;
        self.iter_lines();
        self.stats.push_str(&format!(
            "; peep hole pass: {} instructions removed and {} updated\n",
            self.peep.dels,
            self.peep.ops - self.peep.dels
        ));
    }
}

fn is_plain_signed_int(s: &str) -> bool {
    let t = s.strip_prefix('-').unwrap_or(s);
    !t.is_empty() && t.bytes().all(|c| c.is_ascii_digit())
}

/// Split a line into tokens. `[ ] ! { } ,` are tokens of their own; `//`
/// and `;` start a comment. Returns `None` for a blank line.
pub(crate) fn tokenize(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut w = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '[' | ']' | '!' | '{' | '}' | ',' => {
                if !w.is_empty() {
                    words.push(std::mem::take(&mut w));
                }
                words.push(c.to_string());
            }
            ' ' | '\t' | '\r' | '\n' => {
                if !w.is_empty() {
                    words.push(std::mem::take(&mut w));
                }
            }
            '/' => {
                if chars.peek() == Some(&'/') {
                    break;
                }
            }
            ';' => break,
            _ => w.push(c),
        }
    }
    if !w.is_empty() {
        words.push(w);
    }
    if words.is_empty() {
        None
    } else {
        Some(words)
    }
}

fn parse_string(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::new();
    let mut it = inner.chars();
    while let Some(c) = it.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match it.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            '\\' => out.push('\\'),
            '"' => out.push('"'),
            '\'' => out.push('\''),
            '?' => out.push('?'),
            '0' | 'z' => out.push('\0'),
            'x' => {
                let hi = it.next()?.to_digit(16)?;
                let lo = it.next()?.to_digit(16)?;
                out.push(char::from_u32(hi * 16 + lo)?);
            }
            'u' => {
                let mut v = 0u32;
                for _ in 0..4 {
                    v = v * 16 + it.next()?.to_digit(16)?;
                }
                out.push(char::from_u32(v)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::InstructionSet;

    struct NullProcessor {
        iset: InstructionSet,
    }

    impl Processor for NullProcessor {
        fn iset(&self) -> &InstructionSet {
            &self.iset
        }
        fn register_no(
            &self,
            _actual: &str,
            _enc: &crate::processor::Encoder,
        ) -> Option<i64> {
            None
        }
        fn get_address_from_label(
            &self,
            _f: &File<'_>,
            _ins: &Instruction,
            _s: &str,
            _word_aligned: bool,
        ) -> Option<i64> {
            None
        }
    }

    fn null_proc() -> NullProcessor {
        NullProcessor {
            iset: InstructionSet::default(),
        }
    }

    #[test]
    fn tokenize_separators_and_comments() {
        assert_eq!(
            tokenize("ldr r0, [sp, #4] ; load").unwrap(),
            vec!["ldr", "r0", ",", "[", "sp", ",", "#4", "]"]
        );
        assert_eq!(
            tokenize("push {r0, lr} // x").unwrap(),
            vec!["push", "{", "r0", ",", "lr", "}"]
        );
        assert!(tokenize("   ").is_none());
        assert!(tokenize("; only a comment").is_none());
    }

    #[test]
    fn parse_ints() {
        let p = null_proc();
        let mut f = File::new(&p);
        assert_eq!(f.parse_one_int("42"), Some(42));
        assert_eq!(f.parse_one_int("-42"), Some(-42));
        assert_eq!(f.parse_one_int("0x10"), Some(16));
        assert_eq!(f.parse_one_int("0b101"), Some(5));
        assert_eq!(f.parse_one_int("4*16"), Some(64));
        assert_eq!(f.parse_one_int("2*3*4"), Some(24));
        assert_eq!(f.parse_one_int("10-3"), Some(7));
        assert_eq!(f.parse_one_int("0x10|1"), Some(17));
        assert_eq!(f.parse_one_int("8+1"), Some(9));
        assert_eq!(f.parse_one_int("8-1"), Some(7));
        assert_eq!(f.parse_one_int("0x100>>4"), Some(16));
        assert_eq!(f.parse_one_int(""), None);
        assert_eq!(f.parse_one_int("zzz!"), None);
        assert!(f.errors.is_empty());
    }

    #[test]
    fn label_placeholder_on_early_pass() {
        let p = null_proc();
        let mut f = File::new(&p);
        // unknown labels resolve to a placeholder before the final pass
        assert_eq!(f.parse_one_int("some_label"), Some(11111));
        assert!(f.errors.is_empty());
    }

    #[test]
    fn register_names_are_not_labels() {
        let p = null_proc();
        let f = File::new(&p);
        assert!(!f.looks_like_label("r0"));
        assert!(!f.looks_like_label("pc"));
        assert!(!f.looks_like_label("sp"));
        assert!(!f.looks_like_label("lr"));
        assert!(f.looks_like_label("r10"));
        assert!(f.looks_like_label(".l.0"));
        assert!(f.looks_like_label("_start"));
    }

    #[test]
    fn string_escapes() {
        assert_eq!(parse_string("\"abc\""), Some("abc".to_string()));
        assert_eq!(parse_string("\"a\\nb\""), Some("a\nb".to_string()));
        assert_eq!(parse_string("\"a\\x41\""), Some("aA".to_string()));
        assert_eq!(parse_string("\"\\0\""), Some("\0".to_string()));
        assert_eq!(parse_string("\"bad\\q\""), None);
    }
}
