//! Domain model (identifiers, rotation index, retention policy, chunk plan).

pub mod chunk;
pub mod ids;
pub mod policy;
pub mod rotation;

pub use chunk::ChunkPlan;
pub use ids::ArtifactId;
pub use policy::RetentionPolicy;
pub use rotation::RotationIndex;
