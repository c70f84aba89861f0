//! Error types for assembly and model compilation.

use std::fmt;

/// A single assembler diagnostic, tied to a source line.
///
/// Diagnostics are accumulated (up to a cap) rather than aborting on the
/// first problem, so one run surfaces several issues at once.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsmDiagnostic {
    /// 1-based source line number.
    pub line_no: u32,
    /// The offending source line text.
    pub line: String,
    /// The core error message.
    pub message: String,
    /// Optional hint text, e.g. the closest matching instruction templates
    /// and why each rejected the operands.
    pub hints: String,
}

impl fmt::Display for AsmDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {} ('{}'): {}",
            self.line_no,
            self.line.trim(),
            self.message
        )?;
        if !self.hints.is_empty() {
            write!(f, "\n{}", self.hints.trim_end())?;
        }
        Ok(())
    }
}

/// Assembly failure: the accumulated diagnostics of one assembly unit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AsmError {
    /// Diagnostics in source order, capped during accumulation.
    pub diagnostics: Vec<AsmDiagnostic>,
}

impl AsmError {
    /// The first diagnostic — every `AsmError` carries at least one.
    #[must_use]
    pub fn first(&self) -> &AsmDiagnostic {
        &self.diagnostics[0]
    }
}

impl fmt::Display for AsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", d)?;
        }
        Ok(())
    }
}

impl std::error::Error for AsmError {}

/// A single output/reference mismatch found during validation.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Mismatch {
    /// Flat output index.
    pub index: usize,
    /// Expected (reference) value.
    pub expected: f32,
    /// Actual value produced by the compiled artifact.
    pub actual: f32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {}: {} - {} = {}",
            self.index,
            self.expected,
            self.actual,
            self.expected - self.actual
        )
    }
}

/// Model compilation error.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CompileError {
    /// A layer kind or configuration the compiler cannot lower.
    UnsupportedLayer {
        /// Name of the offending layer.
        layer: String,
        /// What about the configuration is unsupported.
        detail: String,
    },

    /// An activation function the compiler cannot lower.
    UnsupportedActivation {
        /// Name of the offending layer.
        layer: String,
        /// The activation name as configured.
        activation: String,
    },

    /// Weight or bias tensors do not match the declared layer shapes.
    InvalidWeights {
        /// Name of the offending layer.
        layer: String,
        /// Description of the shape mismatch.
        detail: String,
    },

    /// Half-precision pool reads straddle the even/odd lane boundary
    /// inconsistently across iterations of a fixed-count loop.
    HalfLaneParity {
        /// The trip count of the offending loop.
        trip_count: usize,
    },

    /// The produced image exceeds the configured flash budget.
    ProgramTooBig {
        /// Image size in bytes.
        size: u32,
        /// Configured flash budget in bytes.
        limit: u32,
    },

    /// The assembler rejected the rendered program.
    Assembly(AsmError),

    /// Compiled output disagrees with the floating-point reference.
    ValidationMismatch {
        /// First few mismatching indices (at most 6).
        mismatches: Vec<Mismatch>,
        /// Tolerance used for the comparison.
        eps: f32,
    },

    /// An input vector of the wrong length was passed to the simulator.
    InvalidInputSize {
        /// Number of values provided.
        got: usize,
        /// Number of values the model input shape requires.
        expected: usize,
    },

    /// Internal invariant violation — a compiler defect, not bad input.
    Internal {
        /// What went wrong.
        detail: String,
    },
}

impl CompileError {
    pub(crate) fn internal(detail: impl Into<String>) -> Self {
        CompileError::Internal {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::UnsupportedLayer { layer, detail } => {
                write!(f, "layer '{}': unsupported configuration: {}", layer, detail)
            }
            CompileError::UnsupportedActivation { layer, activation } => {
                write!(f, "layer '{}': unsupported activation: {}", layer, activation)
            }
            CompileError::InvalidWeights { layer, detail } => {
                write!(f, "layer '{}': invalid weights: {}", layer, detail)
            }
            CompileError::HalfLaneParity { trip_count } => {
                write!(
                    f,
                    "half-precision lane parity flips across a fixed-count loop (trip count {})",
                    trip_count
                )
            }
            CompileError::ProgramTooBig { size, limit } => {
                write!(f, "program too big by {} bytes!", size - limit)
            }
            CompileError::Assembly(e) => write!(f, "assembly failed: {}", e.first()),
            CompileError::ValidationMismatch { mismatches, eps } => {
                write!(f, "output mismatch (eps={})", eps)?;
                for m in mismatches {
                    write!(f, "\n  {}", m)?;
                }
                Ok(())
            }
            CompileError::InvalidInputSize { got, expected } => {
                write!(f, "invalid input size: got {}, expected {}", got, expected)
            }
            CompileError::Internal { detail } => {
                write!(f, "internal compiler error: {}", detail)
            }
        }
    }
}

impl std::error::Error for CompileError {}

impl From<AsmError> for CompileError {
    fn from(e: AsmError) -> Self {
        CompileError::Assembly(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display() {
        let d = AsmDiagnostic {
            line_no: 12,
            line: "    push {r0".into(),
            message: "assembly error".into(),
            hints: String::new(),
        };
        assert_eq!(format!("{}", d), "line 12 ('push {r0'): assembly error");
    }

    #[test]
    fn diagnostic_display_with_hints() {
        let d = AsmDiagnostic {
            line_no: 3,
            line: "movs r14, #100".into(),
            message: "assembly error".into(),
            hints: "   Maybe: movs R0-7, #0-255 (expecting register name at 'r14')\n".into(),
        };
        let s = format!("{}", d);
        assert!(s.contains("line 3"));
        assert!(s.contains("Maybe: movs"));
    }

    #[test]
    fn asm_error_display_joins_diagnostics() {
        let e = AsmError {
            diagnostics: vec![
                AsmDiagnostic {
                    line_no: 1,
                    line: "a".into(),
                    message: "first".into(),
                    hints: String::new(),
                },
                AsmDiagnostic {
                    line_no: 2,
                    line: "b".into(),
                    message: "second".into(),
                    hints: String::new(),
                },
            ],
        };
        let s = format!("{}", e);
        assert!(s.contains("first"));
        assert!(s.contains("second"));
    }

    #[test]
    fn unsupported_activation_display() {
        let e = CompileError::UnsupportedActivation {
            layer: "dense_3".into(),
            activation: "tanh".into(),
        };
        assert_eq!(
            format!("{}", e),
            "layer 'dense_3': unsupported activation: tanh"
        );
    }

    #[test]
    fn program_too_big_display() {
        let e = CompileError::ProgramTooBig {
            size: 131_072 + 40,
            limit: 131_072,
        };
        assert_eq!(format!("{}", e), "program too big by 40 bytes!");
    }

    #[test]
    fn mismatch_display() {
        let e = CompileError::ValidationMismatch {
            mismatches: vec![Mismatch {
                index: 2,
                expected: 1.0,
                actual: 0.5,
            }],
            eps: 0.00002,
        };
        let s = format!("{}", e);
        assert!(s.contains("at 2"));
        assert!(s.contains("eps=0.00002"));
    }
}
