// Small controller-local helpers that don't belong in the shared `common`
// crate. Everything else that used to live here (recycling-index vectors,
// raw db object wrappers, blockchain-specific id types) moved out with the
// domain it served.
pub(crate) use self::auto_thread::*;

mod auto_thread;
