//! Function- and program-level analyses, cached on the `AnalysisMap`.

pub mod dominator;
pub mod propagation;

pub use self::dominator::DominatorAnalysis;
pub use self::propagation::{
    ConstantLattice, ConstantPropagator, DivergencePropagator, InterproceduralSimulation,
    SimulationAnalysis, WorkGroupDivergence,
};
