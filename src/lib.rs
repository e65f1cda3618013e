pub mod common;
pub mod engine;
pub mod partition;
pub mod pattern;
pub mod plan;
pub mod problem;
pub mod profile;
pub mod schedule;
pub mod source;
pub mod utils;

pub use engine::{ReduceTiling, Stage, StageFailure, TilingError};
pub use plan::{TilingOutput, TilingPlan};
pub use profile::{CompileInfo, CompileProfile, ProfileError};
pub use source::{GraphOp, OpInfo, ShapeSource};
