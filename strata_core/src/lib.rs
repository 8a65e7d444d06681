pub mod bitstream;
pub mod config;
pub mod cracker;
pub mod dom;
pub mod error;
pub mod expression;
pub mod fixup;
pub mod mutator;
pub mod pit;
pub mod registry;
pub mod relation;
pub mod schema;
pub mod transformer;
pub mod variant;

pub use bitstream::{BitStream, BitStreamError, ByteSource};
pub use config::{EngineConfig, FuzzerSettings, StrataConfig};
pub use cracker::DataCracker;
pub use dom::{DataModel, ElementId, ElementKind, ElementSnapshot, LengthType, MutateOverride};
pub use error::{CrackingFailure, StrataError, StrataResult};
pub use expression::{ExpressionEvaluator, ExpressionValue, Scope};
pub use fixup::Fixup;
pub use mutator::{ArrayCountMutator, ChoiceSwitchMutator, FlipBitsMutator, Mutator};
pub use relation::{RelationId, RelationKind};
pub use schema::ModelDef;
pub use transformer::Transformer;
pub use variant::{Variant, VariantError};
