// =============================================================================
// MAIDENLESS - Deferred Vulkan renderer demo
// =============================================================================
//
// Opens a window, uploads a procedural level through push_map and orbits a
// camera around it.
//
// FRAME FLOW:
// 1. Build FrameState from the orbit camera
// 2. Renderer::draw (G-buffer pass, shading compute pass, blit, present)
// 3. Update FPS counter in the title
//
// KEYS: Escape quits, F11 toggles fullscreen.
//
// =============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use maidenless::config::Config;
use maidenless::scene::{Camera, FrameState};
use maidenless::{demo, error, Renderer, RendererDesc};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// COMMAND LINE
// =============================================================================

/// Command line overrides, applied on top of config.toml
#[derive(Debug, Parser)]
#[command(name = "maidenless", about = "Deferred Vulkan renderer demo")]
struct Args {
    /// Window width in pixels
    #[arg(short = 'w', long)]
    width: Option<u32>,

    /// Window height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Start in borderless fullscreen
    #[arg(long)]
    fullscreen: bool,

    /// Prefer the GPU whose name contains this string
    #[arg(long = "physical-device", visible_alias = "gpu")]
    physical_device: Option<String>,

    /// Path of the configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        if self.fullscreen {
            config.window.fullscreen = true;
        }
        if let Some(ref gpu) = self.physical_device {
            config.graphics.preferred_gpu = Some(gpu.clone());
        }
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();

    let (config, load_error) = load_config(&args);

    // Logging depends on the config, so load problems are reported after
    init_logging(&config);
    log::info!("Starting {}", config.window.title);
    match load_error {
        Some(e) => log::warn!("Failed to load {:?}: {:#}. Using defaults.", args.config, e),
        None if args.config.exists() => log::info!("Loaded configuration from {:?}", args.config),
        None => log::info!("Config file not found at {:?}, using defaults", args.config),
    }
    log::debug!("Config: {:?}", config);
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app).context("Event loop failed")?;

    if let Some(err) = app.fatal_error.take() {
        return Err(err);
    }
    Ok(())
}

/// Config file (or defaults) with the command line applied on top; a file
/// that fails to load is handed back to be logged once logging is up
fn load_config(args: &Args) -> (Config, Option<anyhow::Error>) {
    let (mut config, error) = match Config::load_from_path(&args.config) {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    args.apply(&mut config);
    (config, error)
}

/// env_logger with the configured level, optionally writing to a file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};

    let mut builder = Builder::from_default_env();
    builder.filter_level(config.log_level());

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Maidenless Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Failed to open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Orbit radius and eye height of the demo camera
const ORBIT_RADIUS: f32 = 8.0;
const ORBIT_HEIGHT: f32 = 4.0;

struct App {
    config: Config,

    // Renderer first: it must drop before the window it presents to
    renderer: Option<Renderer>,
    window: Option<Arc<Window>>,

    is_fullscreen: bool,
    fatal_error: Option<anyhow::Error>,

    // FPS tracking
    frame_count: u32,
    last_frame_time: Instant,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            is_fullscreen: config.window.fullscreen,
            config,
            renderer: None,
            window: None,
            fatal_error: None,
            frame_count: 0,
            last_frame_time: now,
            last_fps_update: now,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let desc = RendererDesc::from_config(&self.config);
        let mut renderer = Renderer::new(window, size.width, size.height, &desc)
            .context("Failed to create renderer")?;

        let (primitives, textures) = demo::level();
        renderer
            .push_map(&primitives, &textures)
            .context("Failed to upload the demo level")?;

        log::info!(
            "Renderer ready: {}x{}, {} bindless slots, validation {}",
            renderer.extent().width,
            renderer.extent().height,
            renderer.bindless_capacity(),
            if renderer.validation_enabled() { "on" } else { "off" }
        );
        self.renderer = Some(renderer);
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn render_frame(&mut self) -> Result<()> {
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        let extent = renderer.extent();
        let aspect = extent.width as f32 / extent.height.max(1) as f32;
        let frame = renderer.current_frame();

        let camera = Camera::orbit(frame, ORBIT_RADIUS, ORBIT_HEIGHT);
        let mut state = FrameState::from_camera(&camera, aspect);
        state.actors = demo::actors(frame);

        renderer.draw(&state)
    }

    /// Stop rendering for good; the error is returned from main
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        log::error!("Fatal render error: {:#}", err);
        self.renderer = None;
        self.fatal_error = Some(err);
        event_loop.exit();
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // The Resized event that follows recreates the swapchain
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }
            if let Some(ref renderer) = self.renderer {
                let stats = renderer.allocation_stats();
                log::debug!(
                    "{:.0} FPS, {} primitives, {} textures, {} allocations ({} bytes)",
                    fps,
                    renderer.primitive_count(),
                    renderer.texture_count(),
                    stats.allocations,
                    stats.bytes
                );
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is resumed (or started).
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            self.fail(event_loop, e);
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.resize(size.width, size.height) {
                        self.fail(event_loop, e);
                    }
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(()) => self.update_fps(),
                Err(e) if error::is_fatal(&e) => self.fail(event_loop, e),
                Err(e) => log::error!("Render error: {:#}", e),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        // Tear the renderer down while the window still exists
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn cli_overrides_config_file() {
        let args = Args::parse_from([
            "maidenless",
            "-w",
            "1920",
            "--height",
            "1080",
            "--fullscreen",
            "--gpu",
            "RTX",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);

        assert_eq!(config.window.width, 1920);
        assert_eq!(config.window.height, 1080);
        assert!(config.window.fullscreen);
        assert_eq!(config.graphics.preferred_gpu.as_deref(), Some("RTX"));
        assert_eq!(args.config, PathBuf::from("config.toml"));
    }

    #[test]
    fn missing_config_file_loads_defaults_silently() {
        let args = Args::parse_from(["maidenless", "--config", "definitely/not/here/config.toml"]);
        let (config, error) = load_config(&args);

        assert!(error.is_none());
        assert_eq!(config.window.width, Config::default().window.width);
    }

    #[test]
    fn malformed_config_error_is_kept_for_logging() {
        let path = std::env::temp_dir().join(format!(
            "maidenless-malformed-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[window\nwidth = ").unwrap();

        let args = Args::parse_from([
            OsStr::new("maidenless"),
            OsStr::new("--config"),
            path.as_os_str(),
            OsStr::new("--height"),
            OsStr::new("600"),
        ]);
        let (config, error) = load_config(&args);
        std::fs::remove_file(&path).unwrap();

        let error = error.expect("malformed file must be reported");
        assert!(format!("{:#}", error).contains("Failed to parse config file"));
        assert_eq!(config.window.width, Config::default().window.width);
        assert_eq!(config.window.height, 600);
    }

    #[test]
    fn absent_flags_keep_file_values() {
        let args = Args::parse_from(["maidenless", "--physical-device", "Radeon"]);
        let mut config = Config::default();
        config.window.width = 800;
        args.apply(&mut config);

        assert_eq!(config.window.width, 800);
        assert!(!config.window.fullscreen);
        assert_eq!(config.graphics.preferred_gpu.as_deref(), Some("Radeon"));
    }
}
