pub mod category;
pub mod field;
pub mod money;
pub mod period;
pub mod record;
pub mod transaction;

pub use category::{CategoryVocabulary, DEFAULT_CATEGORIES, UNCATEGORIZED};
pub use field::CanonicalField;
pub use money::{Amount, AmountParseError};
pub use period::DateRange;
pub use record::{Provenance, RawRecord, RawTable};
pub use transaction::{Annotation, Transaction, TransactionId, TransactionType, NO_DESCRIPTION};
