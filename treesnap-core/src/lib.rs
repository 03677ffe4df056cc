pub mod apply;
pub mod cheap_copy;
pub mod digest;
pub mod escape;
pub mod manifest;
pub mod minimize;
pub mod path_safety;
pub mod progress;
pub mod scan;
pub mod store;
pub mod verify;

pub use apply::{apply, ApplyOptions, ApplySummary};
pub use cheap_copy::{cheap_copy, CopyOptions, CopySummary};
pub use minimize::{minimize, MinimizeOptions, MinimizeSummary};
pub use scan::{generate, ScanOptions, ScanSummary};
pub use verify::{verify, VerifyReport};
