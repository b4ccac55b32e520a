//! Partner synchronization: registry, collections and stepwise export

mod cache;
mod collection;
mod exporter;
mod partner;

pub use cache::{head_key, MemoryRevisionCache, NoRevisionCache, RevisionCache};
pub use collection::SyncCollection;
pub use exporter::{ChangeSink, Exporter, Progress};
pub use partner::{PartnerRegistry, SqlitePartnerRegistry};
