//! Data models for objsync

mod commit;
mod condition;
mod device_state;
mod partner;
mod stat;

pub use commit::{CommitId, StreamKey};
pub use condition::{Combinator, Condition, Conditions, Operator, PARENT_FIELD};
pub use device_state::{DeviceState, StateKey, SyncKey};
pub use partner::{CollectionKind, CollectionRecord, CollectionSpec, InitState, Partner};
pub use stat::{
    ChangeAction, ChangedRow, ExportOrigin, ExportStat, ImportRecord, ImportStat, ManifestEntry,
};
