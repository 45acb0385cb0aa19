// OTA (Over-The-Air) update module
//
// Update flow, both entry points:
// 1. Begin a session against the next OTA partition
// 2. Stream the image in bounded chunks (HTTP PUT body or remote asset)
// 3. Finalize the partition (image validation)
// 4. Set the boot partition
//
// The device is NOT restarted here; that stays a user action.

pub mod manager;
pub mod pull;

pub use manager::OtaManager;
pub use pull::HttpSource;
