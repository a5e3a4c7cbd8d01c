//! Default configuration values for hvnode
//!
//! This module centralizes all default values to make them easy to find and modify.

use std::time::Duration;

// Image repository defaults
pub const DEFAULT_IMAGES_VERSION: &str = "0.1";
pub const DEFAULT_IMAGES_INDEX_FILE: &str = "driver-hyperv-images.json";
pub const DEFAULT_IMAGE_FILE_PREFIX: &str = "kutti-";
pub const DEFAULT_IMAGE_FILE_EXTENSION: &str = "vhdx";

// Directory names below the cache root
pub const DEFAULT_APP_DIR: &str = "hvnode";
pub const DEFAULT_IMAGE_CACHE_SUBDIR: &str = "driver-hyperv";
pub const DEFAULT_MACHINE_SUBDIR: &str = "driver-hyperv-machines";
pub const DEFAULT_DISK_SUBDIR: &str = "driver-hyperv-disks";

// Machine lifecycle defaults
pub const DEFAULT_STATE_WAIT_TIMEOUT_SECS: u64 = 25;
pub const DEFAULT_STATE_WAIT_GRACE_SECS: u64 = 15;
pub const DEFAULT_IP_ATTEMPTS: u32 = 3;
pub const DEFAULT_RENAME_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 10;
pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024; // 2GiB
pub const DEFAULT_PROCESSOR_COUNT: u32 = 2;
pub const DEFAULT_CHECKPOINT_TYPE: &str = "Disabled";
pub const DEFAULT_AWAIT_STOP_CONFIRMATION: bool = true;

// Backend defaults
pub const DEFAULT_POWERSHELL_CANDIDATES: &[&str] = &["powershell.exe", "pwsh.exe", "pwsh"];
pub const DEFAULT_SCRIPT_NAME: &str = "hypervmanage-0.1.ps1";

// Remote execution defaults
pub const DEFAULT_ADMIN_USER: &str = "kuttiadmin";
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;

pub fn default_images_source_url() -> String {
    format!(
        "https://github.com/kuttiproject/driver-hyperv-images/releases/download/v{}/{}",
        DEFAULT_IMAGES_VERSION, DEFAULT_IMAGES_INDEX_FILE
    )
}

pub fn default_rename_script(admin_user: &str) -> String {
    format!("/home/{}/kutti-installscripts/set-hostname.sh", admin_user)
}

// Helper functions for Duration creation
pub const fn duration_secs(secs: u64) -> Duration {
    Duration::from_secs(secs)
}
