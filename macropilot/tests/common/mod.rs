//! Shared test fixtures: scripted collaborator mocks and a harness that
//! wires a full `RuntimeContext` over temp directories.

#![allow(dead_code)]

use async_trait::async_trait;
use image::{ImageFormat, RgbaImage};
use macropilot::{
    AutomationError, BrowserDriver, Classifier, Collaborators, CommandOutput, Disconnected,
    InputInjector, OcrEngine, Rect, RuntimeConfig, RuntimeContext, ScreenCapture, Screenshot,
    ScrollDirection, SystemShell, TextGenerator,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn test_config(root: &Path) -> RuntimeConfig {
    RuntimeConfig {
        state_dir: root.join("sessions"),
        template_dir: root.join("templates"),
        selector_file: root.join("selectors.json"),
        learning_dir: root.join("learning"),
        poll_interval_ms: 10,
        default_timeout_ms: 200,
        retrain_threshold: 1000,
        ..Default::default()
    }
}

/// A deterministic high-variance pattern; matches itself under NCC at
/// ~1.0 and a flat background near 0.
pub fn pattern_image(width: u32, height: u32) -> RgbaImage {
    let mut img = RgbaImage::new(width, height);
    for y in 0..height {
        for x in 0..width {
            let v = ((x * 31 + y * 17) % 200 + 40) as u8;
            img.put_pixel(x, y, image::Rgba([v, v, v, 255]));
        }
    }
    img
}

pub fn png_bytes(img: &RgbaImage) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(img.clone())
        .write_to(&mut out, ImageFormat::Png)
        .expect("png encode");
    out.into_inner()
}

/// A flat dark screen with `pattern` planted at `(px, py)`.
pub fn screen_with_pattern(
    width: u32,
    height: u32,
    px: u32,
    py: u32,
    pattern: &RgbaImage,
) -> Screenshot {
    let mut img = RgbaImage::from_pixel(width, height, image::Rgba([10, 10, 10, 255]));
    image::imageops::overlay(&mut img, pattern, px as i64, py as i64);
    Screenshot {
        width,
        height,
        image_data: img.into_raw(),
    }
}

pub fn blank_screen(width: u32, height: u32) -> Screenshot {
    let img = RgbaImage::from_pixel(width, height, image::Rgba([10, 10, 10, 255]));
    Screenshot {
        width,
        height,
        image_data: img.into_raw(),
    }
}

#[derive(Default)]
pub struct MockInjector {
    pub clicks: Mutex<Vec<(f64, f64)>>,
    pub typed: Mutex<Vec<String>>,
    pub keys: Mutex<Vec<String>>,
    pub scrolls: Mutex<Vec<(ScrollDirection, i32)>>,
}

#[async_trait]
impl InputInjector for MockInjector {
    async fn click(&self, x: f64, y: f64) -> Result<(), AutomationError> {
        self.clicks.lock().unwrap().push((x, y));
        Ok(())
    }

    async fn type_text(&self, text: &str) -> Result<(), AutomationError> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn key(&self, name: &str) -> Result<(), AutomationError> {
        self.keys.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn scroll(&self, direction: ScrollDirection, amount: i32) -> Result<(), AutomationError> {
        self.scrolls.lock().unwrap().push((direction, amount));
        Ok(())
    }
}

pub struct MockCapture {
    pub shot: Mutex<Screenshot>,
    pub scale: f64,
}

impl MockCapture {
    pub fn new(shot: Screenshot) -> Self {
        Self {
            shot: Mutex::new(shot),
            scale: 1.0,
        }
    }

    pub fn set_shot(&self, shot: Screenshot) {
        *self.shot.lock().unwrap() = shot;
    }
}

#[async_trait]
impl ScreenCapture for MockCapture {
    async fn capture(&self) -> Result<Screenshot, AutomationError> {
        Ok(self.shot.lock().unwrap().clone())
    }

    fn scale_factor(&self) -> f64 {
        self.scale
    }
}

/// Classifier whose confidence is scripted by the red channel of the
/// window's top-left pixel.
pub struct PixelClassifier {
    pub confidences: HashMap<u8, f64>,
}

#[async_trait]
impl Classifier for PixelClassifier {
    fn has_model(&self, _target_id: &str) -> bool {
        true
    }

    async fn classify(&self, window_png: &[u8], _target_id: &str) -> Result<f64, AutomationError> {
        let img = image::load_from_memory(window_png)
            .map_err(|e| AutomationError::Internal(format!("bad window png: {e}")))?
            .to_rgba8();
        let marker = img.get_pixel(0, 0).0[0];
        Ok(self.confidences.get(&marker).copied().unwrap_or(0.1))
    }
}

#[derive(Default)]
pub struct MockShell {
    pub invocations: Mutex<Vec<(String, Vec<String>)>>,
    pub stdout: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl SystemShell for MockShell {
    async fn run(&self, name: &str, args: &[String]) -> Result<CommandOutput, AutomationError> {
        self.invocations
            .lock()
            .unwrap()
            .push((name.to_string(), args.to_vec()));
        let stdout = self
            .stdout
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_status: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Browser driver backed by a selector -> (rect, text) table.
#[derive(Default)]
pub struct MockBrowser {
    pub connected: bool,
    pub elements: HashMap<String, (Rect, String)>,
    pub clicked: Mutex<Vec<String>>,
    pub typed: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl BrowserDriver for MockBrowser {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn find(&self, selector: &str) -> Result<Rect, AutomationError> {
        self.elements
            .get(selector)
            .map(|(rect, _)| *rect)
            .ok_or_else(|| AutomationError::ResolutionFailed(format!("no element '{selector}'")))
    }

    async fn click(&self, selector: &str) -> Result<(), AutomationError> {
        self.clicked.lock().unwrap().push(selector.to_string());
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<(), AutomationError> {
        self.typed
            .lock()
            .unwrap()
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }

    async fn scroll(
        &self,
        _selector: &str,
        _direction: ScrollDirection,
        _amount: i32,
    ) -> Result<(), AutomationError> {
        Ok(())
    }

    async fn extract_text(&self, selector: &str) -> Result<String, AutomationError> {
        self.elements
            .get(selector)
            .map(|(_, text)| text.clone())
            .ok_or_else(|| AutomationError::ResolutionFailed(format!("no element '{selector}'")))
    }
}

pub struct MockOcr {
    pub text: String,
    pub received: Mutex<Vec<Vec<u8>>>,
}

impl MockOcr {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            received: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl OcrEngine for MockOcr {
    async fn recognize(&self, region_png: &[u8]) -> Result<String, AutomationError> {
        self.received.lock().unwrap().push(region_png.to_vec());
        Ok(self.text.clone())
    }
}

pub struct MockTextGen;

#[async_trait]
impl TextGenerator for MockTextGen {
    async fn generate(&self, prompt: &str) -> Result<String, AutomationError> {
        Ok(format!("generated: {prompt}"))
    }
}

/// Optional overrides for the harness collaborators.
#[derive(Default)]
pub struct HarnessOptions {
    pub scale: Option<f64>,
    pub classifier: Option<Arc<dyn Classifier>>,
    pub browser: Option<Arc<dyn BrowserDriver>>,
    pub selectors_json: Option<String>,
}

/// A full runtime over temp dirs with recording mocks. The temp dir
/// lives as long as the harness.
pub struct Harness {
    pub dir: TempDir,
    pub ctx: Arc<RuntimeContext>,
    pub injector: Arc<MockInjector>,
    pub capture: Arc<MockCapture>,
    pub shell: Arc<MockShell>,
    pub ocr: Arc<MockOcr>,
}

impl Harness {
    /// Writes `templates` as reference images, then builds the runtime
    /// around `screen`.
    pub fn new(templates: &[(&str, &RgbaImage)], screen: Screenshot) -> Self {
        Self::with_options(templates, screen, HarnessOptions::default())
    }

    pub fn with_options(
        templates: &[(&str, &RgbaImage)],
        screen: Screenshot,
        options: HarnessOptions,
    ) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.template_dir).expect("template dir");
        for (name, img) in templates {
            img.save(config.template_dir.join(format!("{name}.png")))
                .expect("save template");
        }
        if let Some(json) = &options.selectors_json {
            std::fs::write(&config.selector_file, json).expect("write selectors");
        }

        let injector = Arc::new(MockInjector::default());
        let mut mock_capture = MockCapture::new(screen);
        if let Some(scale) = options.scale {
            mock_capture.scale = scale;
        }
        let capture = Arc::new(mock_capture);
        let shell = Arc::new(MockShell::default());
        let ocr = Arc::new(MockOcr::new("ocr text"));
        let collab = Collaborators {
            injector: injector.clone(),
            capture: capture.clone(),
            browser: options
                .browser
                .unwrap_or_else(|| Arc::new(MockBrowser::default())),
            shell: shell.clone(),
            classifier: options
                .classifier
                .unwrap_or_else(|| Arc::new(Disconnected)),
            ocr: ocr.clone(),
            textgen: Arc::new(MockTextGen),
        };
        let ctx = Arc::new(RuntimeContext::new(config, collab).expect("runtime context"));
        Harness {
            dir,
            ctx,
            injector,
            capture,
            shell,
            ocr,
        }
    }
}
