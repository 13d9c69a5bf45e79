pub mod errors;

use std::time::Duration;

/// Bucket every photo object lives under.
pub const PHOTOS_BUCKET: &str = "photos";

/// Per-invocation wall-clock bound for activities. A worker that exceeds it
/// loses the invocation; the queued task stays claimable for the next
/// attempt.
pub const ACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bounded retries: a structurally broken image cannot spin forever.
pub const MAX_ACTIVITY_ATTEMPTS: u32 = 6;

/// Claim lease on a queued task. Must outlast ACTIVITY_TIMEOUT so a live
/// worker never races its own lease.
pub const TASK_LEASE_MS: u64 = 60_000;

pub const VALID_IMAGE_EXTENSIONS: &'static [&'static str] = &[
    "jpg", "jpeg", "jfif", "jpe", "png", "tif", "tiff", "webp", "bmp",
];

/// Largest multipart request the upload endpoint accepts, in mebibytes.
pub const UPLOAD_LIMIT_MIB: u64 = 100;
