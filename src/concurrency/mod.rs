mod guard;

pub use guard::{GuardPermit, ReentrancyGuard};
