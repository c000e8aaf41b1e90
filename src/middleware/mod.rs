mod caller;

pub use caller::{remember_caller, USER_ID_KEY};
