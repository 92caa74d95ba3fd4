// flatten everything under "basic_types" module.
pub use self::managed_vec::*;

mod managed_vec;
