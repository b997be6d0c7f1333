//! The step interpreter. Walks a compiled step list strictly in order,
//! dispatches each step to its handler, and implements control flow:
//! `Repeat` bodies re-enter sequentially, `TryCatch` routes body
//! failures into the recovery block, and every completed top-level step
//! checkpoints the session for resumability.

use crate::collaborators::Rect;
use crate::compiler::step::{ClickSpec, DomOp, ExternalOp, ParsedStep};
use crate::errors::AutomationError;
use crate::resolver::{crop_to_png, Resolution, ResolveOptions, StrategyKind};
use crate::session::{SessionId, SessionStatus};
use crate::RuntimeContext;
use regex::Regex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Application names whose launch switches resolution into browser
/// context, enabling the DOM strategy.
const BROWSER_APPS: &[&str] = &["chrome", "chromium", "firefox", "edge", "safari"];

/// Outcome of a single step. Failures travel as `Err(AutomationError)`;
/// `SkipRemaining` is an explicit variant the runner interprets
/// directly rather than a side-channel flag.
#[derive(Debug, Clone, PartialEq)]
pub enum StepResult {
    Completed {
        produced_variables: HashMap<String, String>,
    },
    SkipRemaining,
}

impl StepResult {
    fn done() -> Self {
        StepResult::Completed {
            produced_variables: HashMap::new(),
        }
    }

    fn with_variable(name: &str, value: String) -> Self {
        StepResult::Completed {
            produced_variables: HashMap::from([(name.to_string(), value)]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session_id: SessionId,
    pub executed_steps: usize,
    pub status: SessionStatus,
}

/// Substitutes `{{name}}` placeholders from the session's live variable
/// map. Unknown names stay in place.
pub fn substitute_runtime_vars(text: &str, vars: &HashMap<String, String>) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_.-]+)\}\}").unwrap());
    re.replace_all(text, |caps: &regex::Captures| {
        vars.get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

pub struct Runner {
    ctx: Arc<RuntimeContext>,
}

impl Runner {
    pub fn new(ctx: Arc<RuntimeContext>) -> Self {
        Self { ctx }
    }

    /// Executes the session's pending top-level steps in order. A fresh
    /// session has every index pending; a resumed one only the
    /// remainder. Ends with the session `Completed`, `Error` (failure
    /// outside any `try`), or `Paused` (fail-safe cancellation).
    #[instrument(skip(self, steps))]
    pub async fn run(
        &self,
        steps: &[ParsedStep],
        session_id: &str,
    ) -> Result<RunOutcome, AutomationError> {
        let session = self
            .ctx
            .sessions
            .get_session(session_id)
            .ok_or_else(|| AutomationError::SessionError(format!("unknown session '{session_id}'")))?;
        if session.status.is_terminal() {
            return Err(AutomationError::SessionError(format!(
                "session '{session_id}' is {:?}; restart it as a new session",
                session.status
            )));
        }
        if session.status == SessionStatus::Paused {
            self.ctx.sessions.resume(session_id)?;
        }

        let pending: Vec<usize> = session.pending_step_indices.iter().copied().collect();
        info!(pending = pending.len(), "run starting");
        let mut executed = 0usize;

        for index in pending {
            if self.ctx.cancellation.is_cancelled() {
                warn!(index, "fail-safe abort, pausing session");
                self.ctx.sessions.pause(session_id)?;
                return Ok(self.outcome(session_id, executed, SessionStatus::Paused));
            }
            let step = steps.get(index).ok_or_else(|| {
                AutomationError::SessionError(format!(
                    "session refers to step {index} beyond the script"
                ))
            })?;

            match self.execute_step(step, session_id).await {
                Ok(result) => {
                    let skip = matches!(result, StepResult::SkipRemaining);
                    self.ctx.sessions.save_step_result(session_id, index, &result)?;
                    executed += 1;
                    if skip {
                        debug!(index, "step requested skip of remaining steps");
                        self.ctx.sessions.skip_remaining(session_id)?;
                        break;
                    }
                }
                Err(AutomationError::Cancelled(reason)) => {
                    warn!(index, %reason, "cancelled mid-step, pausing session");
                    self.ctx.sessions.pause(session_id)?;
                    return Ok(self.outcome(session_id, executed, SessionStatus::Paused));
                }
                Err(e) => {
                    self.ctx.sessions.fail(session_id, &e.to_string())?;
                    return Err(e);
                }
            }
        }

        self.ctx.sessions.complete(session_id)?;
        info!(executed, "run completed");
        Ok(self.outcome(session_id, executed, SessionStatus::Completed))
    }

    fn outcome(&self, session_id: &str, executed_steps: usize, status: SessionStatus) -> RunOutcome {
        RunOutcome {
            session_id: session_id.to_string(),
            executed_steps,
            status,
        }
    }

    /// Dispatch is an exhaustive match over the step variants; recursion
    /// through `Repeat`/`TryCatch` bodies is boxed.
    fn execute_step<'a>(
        &'a self,
        step: &'a ParsedStep,
        session_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<StepResult, AutomationError>> + Send + 'a>> {
        Box::pin(async move {
            if self.ctx.cancellation.is_cancelled() {
                return Err(AutomationError::Cancelled("fail-safe abort".into()));
            }
            match step {
                ParsedStep::Click(spec) => self.do_click(spec, session_id).await,
                ParsedStep::Type { text } => {
                    let text = substitute_runtime_vars(text, &self.session_vars(session_id));
                    self.ctx.injector.type_text(&text).await?;
                    Ok(StepResult::done())
                }
                ParsedStep::Wait { duration } => {
                    self.cancellable_sleep(*duration).await?;
                    Ok(StepResult::done())
                }
                ParsedStep::Key { name } => {
                    self.ctx.injector.key(name).await?;
                    Ok(StepResult::done())
                }
                ParsedStep::Hotkey { keys } => {
                    self.ctx.injector.hotkey(keys).await?;
                    Ok(StepResult::done())
                }
                ParsedStep::Scroll {
                    direction,
                    amount,
                    repeat_count,
                } => {
                    for _ in 0..*repeat_count {
                        self.ctx.injector.scroll(*direction, *amount).await?;
                    }
                    Ok(StepResult::done())
                }
                ParsedStep::Repeat { count, body } => {
                    for iteration in 0..*count {
                        debug!(iteration, "repeat body");
                        for inner in body {
                            if let StepResult::SkipRemaining =
                                self.execute_step(inner, session_id).await?
                            {
                                return Ok(StepResult::SkipRemaining);
                            }
                        }
                    }
                    Ok(StepResult::done())
                }
                ParsedStep::TryCatch { body, recovery } => {
                    match self.execute_block(body, session_id).await {
                        Ok(result) => Ok(result),
                        Err(e @ AutomationError::Cancelled(_)) => Err(e),
                        Err(e) => {
                            warn!("try block failed, running recovery: {e}");
                            // Recovery must itself succeed or the failure
                            // propagates un-recovered.
                            self.execute_block(recovery, session_id).await
                        }
                    }
                }
                ParsedStep::SystemCommand { name, args } => {
                    self.do_system_command(name, args, session_id).await
                }
                ParsedStep::External(op) => self.do_external(op, session_id).await,
                ParsedStep::SkipRemaining => Ok(StepResult::SkipRemaining),
            }
        })
    }

    async fn execute_block(
        &self,
        steps: &[ParsedStep],
        session_id: &str,
    ) -> Result<StepResult, AutomationError> {
        for step in steps {
            if let StepResult::SkipRemaining = self.execute_step(step, session_id).await? {
                return Ok(StepResult::SkipRemaining);
            }
        }
        Ok(StepResult::done())
    }

    async fn do_click(
        &self,
        spec: &ClickSpec,
        session_id: &str,
    ) -> Result<StepResult, AutomationError> {
        let opts = ResolveOptions {
            threshold: spec.match_threshold,
            match_index: spec.match_index,
            context: session_id.to_string(),
            ..Default::default()
        };

        let resolution = if spec.wait_for_appear {
            self.poll_until_found(&spec.target, &opts, spec.timeout).await?
        } else {
            self.ctx.resolver.resolve(&spec.target, &opts).await?.resolution
        };

        match resolution {
            Resolution::Found {
                point, confidence, ..
            } => {
                debug!(target = %spec.target, confidence, "clicking at ({}, {})", point.x, point.y);
                for i in 0..spec.repeat_count {
                    self.ctx.injector.click(point.x, point.y).await?;
                    if i + 1 < spec.repeat_count {
                        self.cancellable_sleep(spec.interval).await?;
                    }
                }
                Ok(StepResult::done())
            }
            Resolution::NotFound { best_confidence } => Err(AutomationError::ResolutionFailed(
                format!(
                    "target '{}' not found (best confidence {best_confidence:.2})",
                    spec.target
                ),
            )),
        }
    }

    /// Bounded poll loop: one resolve per interval until the target
    /// appears or the timeout elapses. The cancellation token is
    /// checked every iteration.
    async fn poll_until_found(
        &self,
        target: &str,
        opts: &ResolveOptions,
        timeout: Duration,
    ) -> Result<Resolution, AutomationError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ctx.cancellation.is_cancelled() {
                return Err(AutomationError::Cancelled("fail-safe abort during poll".into()));
            }
            let report = self.ctx.resolver.resolve(target, opts).await?;
            if report.resolution.is_found() {
                return Ok(report.resolution);
            }
            if Instant::now() >= deadline {
                return Err(AutomationError::Timeout(format!(
                    "target '{target}' did not appear within {timeout:?}"
                )));
            }
            self.cancellable_sleep(self.ctx.config.poll_interval()).await?;
        }
    }

    async fn do_system_command(
        &self,
        name: &str,
        args: &[String],
        session_id: &str,
    ) -> Result<StepResult, AutomationError> {
        let vars = self.session_vars(session_id);
        let args: Vec<String> = args
            .iter()
            .map(|a| substitute_runtime_vars(a, &vars))
            .collect();

        if name == "open_app" {
            if let Some(app) = args.first() {
                let lowered = app.to_lowercase();
                if BROWSER_APPS.iter().any(|b| lowered.contains(b)) {
                    self.ctx.set_browser_active(true);
                }
            }
        }

        let output = self.ctx.shell.run(name, &args).await?;
        if let Some(code) = output.exit_status {
            if code != 0 {
                return Err(AutomationError::ActionFailed(format!(
                    "system command '{name}' exited with {code}: {}",
                    output.stderr.trim()
                )));
            }
        }
        let stdout = output.stdout.trim();
        if stdout.is_empty() {
            Ok(StepResult::done())
        } else {
            // Later steps can reference the output as {{last_output}}.
            self.ctx
                .sessions
                .set_variable(session_id, "last_output", stdout)?;
            Ok(StepResult::with_variable("last_output", stdout.to_string()))
        }
    }

    async fn do_external(
        &self,
        op: &ExternalOp,
        session_id: &str,
    ) -> Result<StepResult, AutomationError> {
        let vars = self.session_vars(session_id);
        match op {
            ExternalOp::Dom {
                op,
                selector,
                text,
                bind,
            } => {
                if !self.ctx.browser.is_connected() {
                    return Err(AutomationError::CollaboratorUnavailable(
                        "browser driver not connected".into(),
                    ));
                }
                self.ctx.set_browser_active(true);
                match op {
                    DomOp::Click => {
                        self.ctx.browser.click(selector).await?;
                        Ok(StepResult::done())
                    }
                    DomOp::Type => {
                        let payload = text.as_deref().unwrap_or_default();
                        let payload = substitute_runtime_vars(payload, &vars);
                        self.ctx.browser.type_text(selector, &payload).await?;
                        Ok(StepResult::done())
                    }
                    DomOp::Extract => {
                        let extracted = self.ctx.browser.extract_text(selector).await?;
                        let name = bind.as_deref().unwrap_or("extracted");
                        self.ctx.sessions.set_variable(session_id, name, &extracted)?;
                        Ok(StepResult::with_variable(name, extracted))
                    }
                }
            }
            ExternalOp::Ocr { target, bind } => {
                let opts = ResolveOptions {
                    context: session_id.to_string(),
                    ..Default::default()
                };
                let report = self.ctx.resolver.resolve(target, &opts).await?;
                let (region, strategy) = match report.resolution {
                    Resolution::Found {
                        region, strategy, ..
                    } => (region, strategy),
                    Resolution::NotFound { best_confidence } => {
                        return Err(AutomationError::ResolutionFailed(format!(
                            "OCR region '{target}' not found (best confidence {best_confidence:.2})"
                        )))
                    }
                };
                // DOM rects arrive in logical pixels; the crop is cut
                // from a device-pixel screenshot.
                let region = match strategy {
                    StrategyKind::DomSelector => {
                        let scale = self.ctx.capture.scale_factor();
                        Rect {
                            x: region.x * scale,
                            y: region.y * scale,
                            width: region.width * scale,
                            height: region.height * scale,
                        }
                    }
                    StrategyKind::TemplateMatch | StrategyKind::NeuralClassifier => region,
                };
                let shot = self.ctx.capture.capture().await?;
                let png = crop_to_png(&shot, &region).ok_or_else(|| {
                    AutomationError::ActionFailed(format!(
                        "OCR region for '{target}' is outside the captured screen"
                    ))
                })?;
                let recognized = self.ctx.ocr.recognize(&png).await?;
                self.ctx.sessions.set_variable(session_id, bind, &recognized)?;
                Ok(StepResult::with_variable(bind, recognized))
            }
            ExternalOp::Generate { prompt, bind } => {
                let prompt = substitute_runtime_vars(prompt, &vars);
                let generated = self.ctx.textgen.generate(&prompt).await?;
                self.ctx.sessions.set_variable(session_id, bind, &generated)?;
                Ok(StepResult::with_variable(bind, generated))
            }
        }
    }

    async fn cancellable_sleep(&self, duration: Duration) -> Result<(), AutomationError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.ctx.cancellation.cancelled() => {
                Err(AutomationError::Cancelled("fail-safe abort during wait".into()))
            }
        }
    }

    fn session_vars(&self, session_id: &str) -> HashMap<String, String> {
        self.ctx
            .sessions
            .get_session(session_id)
            .map(|s| s.variables)
            .unwrap_or_default()
    }
}
