pub mod classifier;
pub mod comparator;
pub mod engine;
pub mod quarantine;
pub mod scanner;
pub mod transfer;

pub use classifier::{Classification, CommonFile, SizeMismatch};
pub use comparator::{hash_file, CompareConfig, FileComparator, FileRecord, HASH_THRESHOLD};
pub use engine::{PreviewEntry, ScanPreview, SyncConfig, SyncEngine};
pub use quarantine::{QuarantineBatch, QuarantineKind, ORPHAN_DIR_NAME, SIZE_MISMATCH_DIR_NAME};
pub use scanner::{Selection, TreeScanner};
pub use transfer::{copy_file, CopyMode};
