//! Client-side routing and retry machinery

pub mod router;

pub use router::{PutOutcome, RequestRouter, MAX_KEY_LEN, MAX_VALUE_LEN};
