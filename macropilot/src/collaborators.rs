//! Contracts for the external collaborators the runtime drives but does
//! not implement: input injection, screen capture, the browser driver,
//! the OS command shell, classifier inference, OCR and text generation.
//!
//! Every trait is object-safe and consumed behind `Arc<dyn …>` so a host
//! can swap implementations per run (each concurrent run owns its own
//! handles).

use crate::errors::AutomationError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A rectangle in device pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn center(&self) -> Point {
        Point {
            x: self.x + self.width / 2.0,
            y: self.y + self.height / 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScrollDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            "left" => Ok(ScrollDirection::Left),
            "right" => Ok(ScrollDirection::Right),
            other => Err(format!("unknown scroll direction '{other}'")),
        }
    }
}

/// Raw screen pixels as captured, plus the capture dimensions.
#[derive(Debug, Clone)]
pub struct Screenshot {
    /// RGBA8 pixel data, row-major.
    pub image_data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Output of a whitelisted OS command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Pointer and keyboard injection. Coordinates are logical, already
/// divided by the display scale factor.
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn click(&self, x: f64, y: f64) -> Result<(), AutomationError>;
    async fn type_text(&self, text: &str) -> Result<(), AutomationError>;
    /// Presses a single named key (`enter`, `escape`, `f5`).
    async fn key(&self, name: &str) -> Result<(), AutomationError>;
    /// Presses a chord. The default delivers it through [`Self::key`]
    /// as one `+`-joined name (`ctrl+s`); backends with native chord
    /// support should override.
    async fn hotkey(&self, keys: &[String]) -> Result<(), AutomationError> {
        self.key(&keys.join("+")).await
    }
    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> Result<(), AutomationError>;
}

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Screenshot, AutomationError>;
    /// Ratio of device pixels to logical input coordinates (1.0 on
    /// unscaled displays, 2.0 on typical HiDPI).
    fn scale_factor(&self) -> f64;
}

/// Browser automation driver. Rects are reported in logical pixels.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    fn is_connected(&self) -> bool;
    async fn find(&self, selector: &str) -> Result<Rect, AutomationError>;
    async fn click(&self, selector: &str) -> Result<(), AutomationError>;
    async fn type_text(&self, selector: &str, text: &str) -> Result<(), AutomationError>;
    async fn scroll(&self, selector: &str, direction: ScrollDirection, amount: i32)
        -> Result<(), AutomationError>;
    async fn extract_text(&self, selector: &str) -> Result<String, AutomationError>;
}

/// OS command shell restricted to the compiler's allow-list. The shell
/// itself must not widen that set; names arriving here already passed
/// compile-time validation.
#[async_trait]
pub trait SystemShell: Send + Sync {
    async fn run(&self, name: &str, args: &[String]) -> Result<CommandOutput, AutomationError>;
}

/// Trained-classifier inference. Training is out of scope; the runtime
/// only asks whether a model exists and what it thinks of a window.
#[async_trait]
pub trait Classifier: Send + Sync {
    fn has_model(&self, target_id: &str) -> bool;
    /// Confidence in `[0, 1]` that `window_png` contains the target.
    async fn classify(&self, window_png: &[u8], target_id: &str) -> Result<f64, AutomationError>;
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, region_png: &[u8]) -> Result<String, AutomationError>;
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AutomationError>;
}

/// Null-object collaborator used where a host wires no real backend.
/// Every call reports `CollaboratorUnavailable`, which the resolver
/// treats as a strategy fallback and the runner as a step failure.
pub struct Disconnected;

#[async_trait]
impl InputInjector for Disconnected {
    async fn click(&self, _x: f64, _y: f64) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no input injector wired".into(),
        ))
    }

    async fn type_text(&self, _text: &str) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no input injector wired".into(),
        ))
    }

    async fn key(&self, _name: &str) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no input injector wired".into(),
        ))
    }

    async fn scroll(
        &self,
        _direction: ScrollDirection,
        _amount: i32,
    ) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no input injector wired".into(),
        ))
    }
}

#[async_trait]
impl ScreenCapture for Disconnected {
    async fn capture(&self) -> Result<Screenshot, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no screen capture wired".into(),
        ))
    }

    fn scale_factor(&self) -> f64 {
        1.0
    }
}

#[async_trait]
impl BrowserDriver for Disconnected {
    fn is_connected(&self) -> bool {
        false
    }

    async fn find(&self, _selector: &str) -> Result<Rect, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "browser driver not connected".into(),
        ))
    }

    async fn click(&self, _selector: &str) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "browser driver not connected".into(),
        ))
    }

    async fn type_text(&self, _selector: &str, _text: &str) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "browser driver not connected".into(),
        ))
    }

    async fn scroll(
        &self,
        _selector: &str,
        _direction: ScrollDirection,
        _amount: i32,
    ) -> Result<(), AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "browser driver not connected".into(),
        ))
    }

    async fn extract_text(&self, _selector: &str) -> Result<String, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "browser driver not connected".into(),
        ))
    }
}

#[async_trait]
impl SystemShell for Disconnected {
    async fn run(&self, name: &str, _args: &[String]) -> Result<CommandOutput, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(format!(
            "no system shell wired for '{name}'"
        )))
    }
}

#[async_trait]
impl Classifier for Disconnected {
    fn has_model(&self, _target_id: &str) -> bool {
        false
    }

    async fn classify(&self, _window_png: &[u8], target_id: &str) -> Result<f64, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(format!(
            "no classifier model for '{target_id}'"
        )))
    }
}

#[async_trait]
impl OcrEngine for Disconnected {
    async fn recognize(&self, _region_png: &[u8]) -> Result<String, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no OCR engine wired".into(),
        ))
    }
}

#[async_trait]
impl TextGenerator for Disconnected {
    async fn generate(&self, _prompt: &str) -> Result<String, AutomationError> {
        Err(AutomationError::CollaboratorUnavailable(
            "no text generator wired".into(),
        ))
    }
}
