/// Directory name used under XDG and system roots.
pub const APP_NAME: &str = "kiln";

/// Number of hex characters kept from a SHA-256 when naming store objects.
pub const OBJ_HASH_PREFIX_LEN: usize = 32;

/// Environment variable overriding the engine root directory.
pub const ROOT_ENV: &str = "KILN_ROOT";

/// Environment variable overriding the executor parallelism.
pub const PARALLELISM_ENV: &str = "KILN_PARALLELISM";

/// Environment variable setting the default exec timeout (humantime syntax).
pub const EXEC_TIMEOUT_ENV: &str = "KILN_EXEC_TIMEOUT";

/// `SOURCE_DATE_EPOCH` handed to every exec: 1980-01-01T00:00:00Z (ZIP epoch).
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// `PATH` used when an image config does not declare one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment variable telling a process where its private rootfs lives.
pub const ROOTFS_ENV: &str = "KILN_ROOTFS";
