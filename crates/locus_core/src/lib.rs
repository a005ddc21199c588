//! The `locus_core` crate provides the mathematical engine behind Locus.
//! It turns a declarative simulation schema into plottable series without
//! ever executing user-supplied text as code.
//!
//! Key components:
//! - **Schema**: `SimulationSchema`, `VariableDef`, `OutputVariable` (the declarative model).
//! - **Formula Engine**: A tokenizer, recursive-descent parser, and bytecode VM for the formula language.
//! - **Simulation**: Domain sweeps over the primary variable producing row-per-sample datasets.
//! - **Intersection**: Pairwise sign-change detection between visible output series.

pub mod formula_engine;
pub mod intersection;
pub mod schema;
pub mod simulation;
