//! Window integration.

use std::ffi::CStr;

use anyhow::{anyhow, Result};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};

use crate::error::RendererError;

/// Gets the instance extensions needed to create a surface for `window`.
pub fn get_required_instance_extensions(
    window: &dyn HasWindowHandle,
) -> Result<&'static [&'static CStr]> {
    let handle = window
        .window_handle()
        .map_err(|e| anyhow!("Failed to obtain window handle: {}", e))?;

    match handle.as_raw() {
        #[cfg(target_os = "linux")]
        RawWindowHandle::Wayland(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_WAYLAND_SURFACE_NAME]),

        #[cfg(target_os = "linux")]
        RawWindowHandle::Xcb(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XCB_SURFACE_NAME]),

        #[cfg(target_os = "linux")]
        RawWindowHandle::Xlib(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_XLIB_SURFACE_NAME]),

        #[cfg(target_os = "windows")]
        RawWindowHandle::Win32(_) => Ok(&[vk::KHR_SURFACE_NAME, vk::KHR_WIN32_SURFACE_NAME]),

        _ => Err(anyhow!(RendererError::UnsupportedWindowHandle)),
    }
}

/// Creates a surface for a window.
///
/// # Safety
///
/// The returned `SurfaceKHR` will only be valid while the supplied window is
/// valid so the supplied window must not be destroyed before the returned
/// `SurfaceKHR` is destroyed.
pub unsafe fn create_surface(
    instance: &ash::Instance,
    entry: &ash::Entry,
    display: &dyn HasDisplayHandle,
    window: &dyn HasWindowHandle,
) -> Result<vk::SurfaceKHR> {
    let display = display
        .display_handle()
        .map_err(|e| anyhow!("Failed to obtain display handle: {}", e))?
        .as_raw();
    let window = window
        .window_handle()
        .map_err(|e| anyhow!("Failed to obtain window handle: {}", e))?
        .as_raw();

    let surface = match (display, window) {
        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Wayland(display), RawWindowHandle::Wayland(window)) => {
            let info = vk::WaylandSurfaceCreateInfoKHR::default()
                .display(display.display.as_ptr())
                .surface(window.surface.as_ptr());
            let wayland_instance = ash::khr::wayland_surface::Instance::new(entry, instance);
            unsafe { wayland_instance.create_wayland_surface(&info, None)? }
        }

        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Xcb(display), RawWindowHandle::Xcb(window)) => {
            let connection_ptr = display
                .connection
                .map(|connection| connection.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XcbSurfaceCreateInfoKHR::default()
                .connection(connection_ptr)
                .window(window.window.get());
            let xcb_instance = ash::khr::xcb_surface::Instance::new(entry, instance);
            unsafe { xcb_instance.create_xcb_surface(&info, None)? }
        }

        #[cfg(target_os = "linux")]
        (RawDisplayHandle::Xlib(display), RawWindowHandle::Xlib(window)) => {
            let display_ptr = display
                .display
                .map(|display| display.as_ptr())
                .unwrap_or(std::ptr::null_mut());
            let info = vk::XlibSurfaceCreateInfoKHR::default()
                .dpy(display_ptr as *mut _)
                .window(window.window);
            let xlib_instance = ash::khr::xlib_surface::Instance::new(entry, instance);
            unsafe { xlib_instance.create_xlib_surface(&info, None)? }
        }

        #[cfg(target_os = "windows")]
        (RawDisplayHandle::Windows(_), RawWindowHandle::Win32(window)) => {
            let info = vk::Win32SurfaceCreateInfoKHR::default()
                .hinstance(window.hinstance.map(|h| h.get()).unwrap_or(0))
                .hwnd(window.hwnd.get());
            let win32_instance = ash::khr::win32_surface::Instance::new(entry, instance);
            unsafe { win32_instance.create_win32_surface(&info, None)? }
        }

        _ => return Err(anyhow!(RendererError::UnsupportedWindowHandle)),
    };
    Ok(surface)
}
