//! Configuration for anvil

mod anvil;

pub use anvil::{
    AnvilConfig, DockerSettings, ExecSettings, IgnoreSyncSettings, InitHookSettings,
    PromptSettings, SshSettings, ANVIL_CONFIG_FILE, DEFAULT_IGNORE_SYNC_FILE, DEFAULT_INIT_HOOK,
};
