//! Wire constants shared by challenge submission and queue probing

/// Browser identity sent with challenge and probe requests.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/75.0.3770.100 Safari/537.36";

/// Header carrying the token-issuing service API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Form field name for the challenge solution.
pub const SOLUTION_FIELD: &str = "p";

/// Waiting-room marker cookie set while a client is held in the queue.
pub const QUEUE_MARKER_COOKIE: &str = "akavpwr_VP1";

/// Cookie issued once the waiting room lets the client through.
pub const QUEUE_PASS_COOKIE: &str = "akavpau_VP1";
