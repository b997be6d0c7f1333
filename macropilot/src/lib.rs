//! Macro execution runtime for desktop UI automation.
//!
//! A line-oriented DSL describes a sequence of UI actions; this crate
//! compiles it to a step list, interprets the steps against the live
//! screen through interchangeable target-detection strategies, keeps
//! every execution crash-resumable through durable session records, and
//! feeds every resolution outcome into an adaptive learning loop.
//!
//! The actual I/O surfaces (pointer injection, screen capture, browser
//! driver, OS shell, classifier inference, OCR, text generation) are
//! external collaborators behind the traits in [`collaborators`]; hosts
//! wire real implementations into a [`RuntimeContext`] and hand it to a
//! [`Runner`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod collaborators;
pub mod compiler;
pub mod config;
pub mod errors;
pub mod learning;
pub mod resolver;
pub mod runner;
pub mod session;

pub use collaborators::{
    BrowserDriver, Classifier, CommandOutput, Disconnected, InputInjector, OcrEngine, Point, Rect,
    ScreenCapture, Screenshot, ScrollDirection, SystemShell, TextGenerator,
};
pub use compiler::{
    compile, CompileOptions, MacroVariableDefinition, ParsedStep, TargetCatalog, VariableRegistry,
    ALLOWED_SYSTEM_COMMANDS,
};
pub use config::RuntimeConfig;
pub use errors::{AutomationError, CompileError};
pub use learning::{DriftVerdict, LearningStore, RetrainReport, TargetStats};
pub use resolver::{
    Resolution, ResolveOptions, ResolveReport, Resolver, StrategyKind, StrategyOutcome,
};
pub use runner::{substitute_runtime_vars, RunOutcome, Runner, StepResult};
pub use session::{RunSession, SessionId, SessionManager, SessionStatus};

/// The external collaborator handles for one execution context. Each
/// concurrent run should own its own set (notably its own browser
/// connection).
#[derive(Clone)]
pub struct Collaborators {
    pub injector: Arc<dyn InputInjector>,
    pub capture: Arc<dyn ScreenCapture>,
    pub browser: Arc<dyn BrowserDriver>,
    pub shell: Arc<dyn SystemShell>,
    pub classifier: Arc<dyn Classifier>,
    pub ocr: Arc<dyn OcrEngine>,
    pub textgen: Arc<dyn TextGenerator>,
}

impl Collaborators {
    /// Every handle wired to the null object; calls fail with
    /// `CollaboratorUnavailable`. Useful as a base to override in tests
    /// and for hosts that only exercise the compiler.
    pub fn disconnected() -> Self {
        let d = Arc::new(Disconnected);
        Self {
            injector: d.clone(),
            capture: d.clone(),
            browser: d.clone(),
            shell: d.clone(),
            classifier: d.clone(),
            ocr: d.clone(),
            textgen: d,
        }
    }
}

/// Everything a run needs, injected at construction: the state and
/// learning stores, the resolver, the collaborator handles, the config
/// and the fail-safe cancellation token. No process-wide singletons.
pub struct RuntimeContext {
    pub config: RuntimeConfig,
    pub sessions: Arc<SessionManager>,
    pub learning: Arc<LearningStore>,
    pub resolver: Arc<Resolver>,
    pub catalog: Arc<TargetCatalog>,
    pub injector: Arc<dyn InputInjector>,
    pub capture: Arc<dyn ScreenCapture>,
    pub browser: Arc<dyn BrowserDriver>,
    pub shell: Arc<dyn SystemShell>,
    pub ocr: Arc<dyn OcrEngine>,
    pub textgen: Arc<dyn TextGenerator>,
    pub cancellation: CancellationToken,
    browser_active: Arc<AtomicBool>,
}

impl RuntimeContext {
    pub fn new(config: RuntimeConfig, collab: Collaborators) -> Result<Self, AutomationError> {
        let sessions = Arc::new(SessionManager::new(&config.state_dir)?);
        let learning = Arc::new(LearningStore::new(
            &config.learning_dir,
            &config.template_dir,
            config.retrain_threshold,
            config.min_fresh_successes,
            config.drift_radius_px,
        )?);
        let catalog = Arc::new(TargetCatalog::scan(
            &config.template_dir,
            &config.selector_file,
        ));
        let browser_active = Arc::new(AtomicBool::new(false));
        let resolver = Arc::new(Resolver::new(
            catalog.clone(),
            collab.capture.clone(),
            collab.browser.clone(),
            collab.classifier.clone(),
            learning.clone(),
            config.template_dir.clone(),
            config.match_threshold,
            config.dedup_radius_px,
            browser_active.clone(),
        ));
        Ok(Self {
            config,
            sessions,
            learning,
            resolver,
            catalog,
            injector: collab.injector,
            capture: collab.capture,
            browser: collab.browser,
            shell: collab.shell,
            ocr: collab.ocr,
            textgen: collab.textgen,
            cancellation: CancellationToken::new(),
            browser_active,
        })
    }

    /// Replaces the fail-safe token, e.g. with one hooked to Ctrl-C.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Whether resolution currently runs in a browser context, enabling
    /// the DOM selector strategy.
    pub fn browser_active(&self) -> bool {
        self.browser_active.load(Ordering::Relaxed)
    }

    pub fn set_browser_active(&self, active: bool) {
        self.browser_active.store(active, Ordering::Relaxed);
    }
}
