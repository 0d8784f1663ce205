//! Shared pool of rotating anti-bot credentials
//!
//! Holds a fixed set of credential slots, each either empty or carrying an
//! opaque cookie value with an absolute expiry. Every polling task draws
//! from the same pool, so the pool guarantees freshness under concurrency:
//! a credential handed out by `acquire()` has not expired at hand-out time.
//!
//! Credential lifecycle:
//! 1. Startup seeds slots from configuration (optional), others start empty
//! 2. `acquire()` picks a random slot; an empty or expired slot is refreshed
//!    through the `CredentialSource` while that slot's lock is held
//! 3. A task that gets banned calls `force_refresh()` with the burned credential
//! 4. A background task refreshes slots approaching expiry

pub mod clock;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod source;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use pool::{Credential, Pool};
pub use refresh::spawn_refresh_task;
pub use source::CredentialSource;
