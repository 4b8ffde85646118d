//! A global store of flags that can impact procedure recovery.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different analysis sessions in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct AnalysisConfig {
    /// Rewrite references through registers loaded once right after the prologue into the cached
    /// literal or address. Without this, calls through cached address registers stay unresolved.
    pub enable_register_cache_rewrite: bool,
    /// Symbolically replay every block on an abstract operand stack to recover call arguments
    /// and string literals.
    pub enable_symbolic_replay: bool,
    /// Label recovered string literals in the image and comment the sites that build them.
    pub materialize_string_literals: bool,
    /// Report stack-touching instructions and loop/trap instructions left over after idiom
    /// matching.
    pub report_unrecognized_idioms: bool,
    /// Show the symbolic stack contents `{a|b|..}` next to each node in the rendered listing.
    pub annotate_stack_in_listing: bool,
    /// Safety bound on the outer discovery fixpoint. Not configurable from the command line.
    pub max_discovery_passes: usize,
}

impl AnalysisConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineAnalysisConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<AnalysisConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: AnalysisConfig = AnalysisConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Analysis configuration parameters
pub enum CommandLineAnalysisConfig {
    DisableRegisterCacheRewrite,
    DisableSymbolicReplay,
    DisableStringLiteralMaterialization,
    DisableUnrecognizedIdiomReports,
    DisableStackAnnotationInListing,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            enable_register_cache_rewrite: true,
            enable_symbolic_replay: true,
            materialize_string_literals: true,
            report_unrecognized_idioms: true,
            annotate_stack_in_listing: true,
            max_discovery_passes: 256,
        }
    }
}

impl From<Vec<CommandLineAnalysisConfig>> for AnalysisConfig {
    fn from(v: Vec<CommandLineAnalysisConfig>) -> Self {
        use CommandLineAnalysisConfig::*;
        let mut r = AnalysisConfig::default();
        for v in v {
            match v {
                DisableRegisterCacheRewrite => {
                    r.enable_register_cache_rewrite = false;
                }
                DisableSymbolicReplay => {
                    r.enable_symbolic_replay = false;
                }
                DisableStringLiteralMaterialization => {
                    r.materialize_string_literals = false;
                }
                DisableUnrecognizedIdiomReports => {
                    r.report_unrecognized_idioms = false;
                }
                DisableStackAnnotationInListing => {
                    r.annotate_stack_in_listing = false;
                }
            }
        }
        r
    }
}
