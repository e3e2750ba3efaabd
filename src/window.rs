//! Window management using winit

use std::time::Duration;

use glam::Vec2;
use winit::{
    dpi::PhysicalSize,
    event::{DeviceEvent, ElementState, Event, KeyEvent, MouseButton, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::backend::traits::{ExtentSource, RendererError, RendererResult};
use crate::scene::CameraInput;

/// Wrapper around winit window with additional state
pub struct Window {
    window: WinitWindow,
    resized: bool,
    close_requested: bool,
    input: CameraInput,
    /// Keys pressed since the last `take_pressed_keys`, in order, repeats excluded.
    pressed_keys: Vec<KeyCode>,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> RendererResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| RendererError::InitializationFailed(format!("Failed to create window: {}", e)))?;

        Ok(Self {
            window,
            resized: false,
            close_requested: false,
            input: CameraInput::new(),
            pressed_keys: Vec::new(),
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Current framebuffer size in pixels. Zero while minimized on most platforms.
    pub fn dimensions(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }

    /// Check if window was resized since the flag was last cleared
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Camera input gathered so far. Call [`CameraInput::reset_deltas`] after use.
    pub fn input(&mut self) -> &mut CameraInput {
        &mut self.input
    }

    pub fn take_pressed_keys(&mut self) -> Vec<KeyCode> {
        std::mem::take(&mut self.pressed_keys)
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(_) => {
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state,
                        repeat,
                        ..
                    },
                ..
            } => {
                let pressed = *state == ElementState::Pressed;
                if pressed && !repeat {
                    self.pressed_keys.push(*code);
                }
                self.apply_key(*code, pressed);
            }
            WindowEvent::MouseInput {
                button: MouseButton::Right,
                state,
                ..
            } => {
                self.input.mouse_look_active = *state == ElementState::Pressed;
            }
            WindowEvent::Focused(false) => {
                // Key releases are lost once focus goes elsewhere
                self.input = CameraInput::new();
            }
            _ => {}
        }
    }

    fn apply_key(&mut self, code: KeyCode, pressed: bool) {
        match code {
            KeyCode::KeyW => self.input.forward = pressed,
            KeyCode::KeyS => self.input.backward = pressed,
            KeyCode::KeyA => self.input.left = pressed,
            KeyCode::KeyD => self.input.right = pressed,
            KeyCode::Space => self.input.up = pressed,
            KeyCode::AltLeft | KeyCode::AltRight => self.input.down = pressed,
            KeyCode::ShiftLeft | KeyCode::ShiftRight => self.input.sprint = pressed,
            KeyCode::Escape if pressed => self.close_requested = true,
            _ => {}
        }
    }

    fn handle_device_event(&mut self, event: &DeviceEvent) {
        if let DeviceEvent::MouseMotion { delta } = event {
            self.input.mouse_delta += Vec2::new(delta.0 as f32, delta.1 as f32);
        }
    }

    /// Dispatch pending events, blocking up to `timeout` (`None` blocks until one arrives).
    pub fn pump(&mut self, event_loop: &mut EventLoop<()>, timeout: Option<Duration>) {
        let status = event_loop.pump_events(timeout, |event, _elwt| match event {
            Event::WindowEvent { event, .. } => self.handle_event(&event),
            Event::DeviceEvent { event, .. } => self.handle_device_event(&event),
            _ => {}
        });

        if let PumpStatus::Exit(code) = status {
            log::debug!("Event loop exited with code {}", code);
            self.close_requested = true;
        }
    }
}

/// A window borrowed together with its event loop, so the renderer can wait for
/// events while the window is minimized.
pub struct WindowEvents<'a> {
    pub event_loop: &'a mut EventLoop<()>,
    pub window: &'a mut Window,
}

impl<'a> WindowEvents<'a> {
    pub fn new(event_loop: &'a mut EventLoop<()>, window: &'a mut Window) -> Self {
        Self { event_loop, window }
    }
}

impl ExtentSource for WindowEvents<'_> {
    fn framebuffer_extent(&self) -> (u32, u32) {
        self.window.dimensions()
    }

    fn resize_pending(&self) -> bool {
        self.window.was_resized()
    }

    fn clear_resize(&mut self) {
        self.window.clear_resize_flag();
    }

    fn wait_events(&mut self) -> bool {
        self.window.pump(self.event_loop, None);
        !self.window.should_close()
    }
}
