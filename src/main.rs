mod config;
mod descriptor;
mod device;
mod error;
mod frame;
mod memory;
mod model;
mod render_target;
mod renderer;
mod swapchain;
mod teardown;
mod uniform;
mod upload;
mod vk_window;


use std::process::ExitCode;

use anyhow::Result;
use log::*;
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::config::{WINDOW_HEIGHT, WINDOW_TITLE, WINDOW_WIDTH};
use crate::renderer::Renderer;

//==================================================================================================
// SECTION: Winit Application Handler
//==================================================================================================

/// The renderer is declared before the window so it is always torn down first.
#[derive(Default)]
struct AppHandler {
    renderer: Option<Renderer>,
    window: Option<Window>,
    error: Option<anyhow::Error>,
}

impl AppHandler {
    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        error!("{:#}", error);
        self.error = Some(error);
        event_loop.exit();
    }
}

impl ApplicationHandler for AppHandler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = Window::default_attributes()
            .with_title(WINDOW_TITLE)
            .with_inner_size(LogicalSize::new(WINDOW_WIDTH, WINDOW_HEIGHT))
            .with_resizable(false);

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => window,
            Err(e) => return self.fail(event_loop, e.into()),
        };

        match Renderer::new(&window) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => return self.fail(event_loop, e),
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested.");
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                warn!(
                    "Window resized to {}x{}; the swapchain keeps its original extent.",
                    size.width, size.height
                );
            }
            WindowEvent::RedrawRequested => {
                if let Some(renderer) = self.renderer.as_mut() {
                    if let Err(e) = renderer.draw_frame() {
                        self.fail(event_loop, e);
                    }
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let (Some(window), None) = (self.window.as_ref(), self.error.as_ref()) {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(renderer) = self.renderer.take() {
            info!("Drew {} frames.", renderer.frames_drawn());
            renderer.destroy();
        }
        self.window = None;
    }
}

//==================================================================================================
// SECTION: Main Application Entry Point
//==================================================================================================

fn run() -> Result<()> {
    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app_handler = AppHandler::default();
    event_loop.run_app(&mut app_handler)?;

    match app_handler.error.take() {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn main() -> ExitCode {
    pretty_env_logger::init();
    info!("Starting {}.", WINDOW_TITLE);

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
