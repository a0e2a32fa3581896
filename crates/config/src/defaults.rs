pub(crate) fn default_archive_target_size() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

pub(crate) fn default_archive_max_items() -> u64 {
    10_000
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_retention_days() -> u64 {
    180
}

pub(crate) fn default_strip_threshold_bytes() -> u64 {
    64 * 1024 * 1024 // 64 MiB
}

pub(crate) fn default_retry_attempts() -> u32 {
    5
}

pub(crate) fn default_retry_delay_ms() -> u64 {
    250
}
