// Data model: plain serializable records with no substrate or I/O
// dependencies, so they are equally usable from the reconciler, the
// allocation engine and the admission webhook.
pub mod allocation;
pub mod gameserver;
pub mod key;
pub mod pod;

pub use allocation::*;
pub use gameserver::*;
pub use key::*;
pub use pod::*;
