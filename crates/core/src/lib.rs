pub mod clock;
pub mod crdt;
pub mod document;
pub mod entity;
pub mod error;
pub mod ids;
pub mod path;
pub mod schema;
pub mod state_vector;
pub mod timestamp;
pub mod triple;
pub mod value;

pub use clock::LogicalClock;
pub use crdt::{ChangeSet, CrdtOp, Write};
pub use document::Document;
pub use entity::{Entity, Leaf, TiePolicy};
pub use error::CoreError;
pub use ids::*;
pub use path::{AttributePath, PathSegment};
pub use schema::{Cardinality, DataType, RelationDef, Schema, SchemaResolver};
pub use state_vector::StateVector;
pub use timestamp::Timestamp;
pub use triple::Triple;
pub use value::Value;
