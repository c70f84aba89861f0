//! Ahead-of-time compiler turning trained feed-forward networks into ARM
//! Thumb machine code.
//!
//! A [`Model`] — a sequential stack of dense, convolution, pooling and
//! activation layers with concrete weights — is lowered to a small loop IR,
//! optimized, rendered to Cortex-M4F assembly and assembled into a
//! self-contained binary image: header, code, runtime helpers, weight pool
//! and optional embedded test vectors. The image needs no runtime library;
//! the caller hands it a RAM arena and an input vector and reads the output
//! back out of the arena.
//!
//! ```no_run
//! use thumbnet::{compile_model, CompileOptions, Layer, LayerKind, Model};
//! use thumbnet::Activation;
//!
//! # fn main() -> Result<(), thumbnet::CompileError> {
//! let model = Model::new(
//!     vec![4],
//!     vec![Layer::new(
//!         "out",
//!         LayerKind::Dense {
//!             units: 2,
//!             use_bias: true,
//!             activation: Activation::Softmax,
//!             weights: vec![vec![0.1, 0.2]; 4],
//!             bias: vec![0.0, 0.0],
//!         },
//!     )],
//! );
//! let compiled = compile_model(&model, &CompileOptions::default())?;
//! std::fs::write("model.bin", &compiled.machine_code).ok();
//! println!("{}", compiled.thumb_text);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
// ── Pedantic lint policy ─────────────────────────────────────────────────
// An assembler performs many narrowing / sign-changing casts between
// integer widths and uses dense hex literals without separators. The lints
// below are expected and acceptable in this context.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::unreadable_literal,
    clippy::match_same_arms,
    clippy::wildcard_imports,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::doc_markdown,
    clippy::similar_names,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

pub mod asm;
mod compile;
pub mod error;
pub mod float16;
pub mod image;
pub mod ir;
pub mod model;
mod optimize;
pub mod processor;
mod render;
pub mod sim;
pub mod thumb;

pub use compile::{LayerStats, ModelStats};
pub use error::{AsmError, CompileError, Mismatch};
pub use image::{compile_model, read_stats, validate, CompiledModel, MemoryStats};
pub use model::{
    Activation, CompileOptions, Layer, LayerKind, Model, Padding, Shape,
};
pub use sim::Simulator;
