use once_cell::sync::OnceCell;

pub const ENV_STRICT_PULL: &str = "LUABRIDGE_STRICT_PULL";
pub const ENV_WARN_STDERR: &str = "LUABRIDGE_WARN_STDERR";
pub const ENV_MAX_DEPTH: &str = "LUABRIDGE_MAX_DEPTH";
pub const ENV_MAX_DIAGNOSTICS: &str = "LUABRIDGE_MAX_DIAGNOSTICS";

const DEFAULT_MAX_DEPTH: u32 = 64;
const DEFAULT_MAX_DIAGNOSTICS: u32 = 1024;

static CONFIG: OnceCell<BridgeConfig> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Read paths fail on values with no host representation instead of
    /// warning and substituting nil.
    pub strict_pull: bool,
    /// Echo recorded warnings to stderr.
    pub warn_to_stderr: bool,
    /// Maximum table nesting on push and pull. Guards against cyclic guest tables.
    pub max_depth: u32,
    /// Diagnostics kept in the sink before the oldest are dropped.
    pub max_diagnostics: u32,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            strict_pull: false,
            warn_to_stderr: true,
            max_depth: DEFAULT_MAX_DEPTH,
            max_diagnostics: DEFAULT_MAX_DIAGNOSTICS,
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            strict_pull: env_bool(ENV_STRICT_PULL, d.strict_pull),
            warn_to_stderr: env_bool(ENV_WARN_STDERR, d.warn_to_stderr),
            max_depth: env_u32_nonzero(ENV_MAX_DEPTH, d.max_depth),
            max_diagnostics: env_u32_nonzero(ENV_MAX_DIAGNOSTICS, d.max_diagnostics),
        }
    }

    /// Process-wide defaults, read from the environment once.
    pub fn global() -> &'static BridgeConfig {
        CONFIG.get_or_init(Self::from_env)
    }

    pub fn strict(mut self) -> Self {
        self.strict_pull = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.warn_to_stderr = false;
        self
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn env_u32_nonzero(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&v| v != 0)
        .unwrap_or(default)
}
