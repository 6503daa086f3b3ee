//! # Kiln language model
//!
//! Values, symbols, scope descriptors and source positions shared by every
//! backend, plus a minimal AST and the depth-first driver that turns it into
//! a sequence of [`Compiler`](crate::codegen::Compiler) operations.
//!
//! ## Documentation conventions
//!
//! - Stack effects are written as `( before -- after )`.
//! - "Falsy" means `nil` or `false`; everything else is truthy.

pub mod node;
pub mod position;
pub mod scope;
pub mod symbol;
pub mod value;
pub mod walk;
