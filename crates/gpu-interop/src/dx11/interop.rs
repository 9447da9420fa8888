//! GL-D3D11 shared render target via WGL_NV_DX_interop2.
//!
//! A single B8G8R8A8 D3D11 texture is registered with GL as a 2D texture and
//! attached to a GL framebuffer (plus an optional 24-bit depth renderbuffer).
//! GL draws into it between lock and unlock; `present` waits for D3D11 and
//! hands the texture to the presentation side.

use std::ffi::CStr;

use anyhow::{bail, Context as _, Result};
use gl::types::{GLenum, GLint, GLsizei, GLuint, GLvoid};
use offgl_core::Size;
use tracing::{debug, error, warn};
use windows::Win32::Graphics::Direct3D11::*;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Gdi::HDC;
use windows::Win32::Graphics::OpenGL::*;

use super::device::Dx11Device;
use crate::bridge::{PresentError, SharedHandle, SharedSurfaceBridge};

/// WGL_NV_DX_interop2 constants.
const WGL_ACCESS_READ_WRITE_NV: GLenum = 0x0001;

// ---------------------------------------------------------------------------
// WGL function pointer types
// ---------------------------------------------------------------------------

type WglDxOpenDeviceNv = unsafe extern "system" fn(dx_device: *mut GLvoid) -> *mut GLvoid;
type WglDxCloseDeviceNv = unsafe extern "system" fn(h_device: *mut GLvoid) -> i32;
type WglDxRegisterObjectNv = unsafe extern "system" fn(
    h_device: *mut GLvoid,
    dx_object: *mut GLvoid,
    name: GLuint,
    obj_type: GLenum,
    access: GLenum,
) -> *mut GLvoid;
type WglDxUnregisterObjectNv =
    unsafe extern "system" fn(h_device: *mut GLvoid, h_object: *mut GLvoid) -> i32;
type WglDxLockObjectsNv = unsafe extern "system" fn(
    h_device: *mut GLvoid,
    count: GLint,
    h_objects: *mut *mut GLvoid,
) -> i32;
type WglDxUnlockObjectsNv = unsafe extern "system" fn(
    h_device: *mut GLvoid,
    count: GLint,
    h_objects: *mut *mut GLvoid,
) -> i32;
type WglGetExtensionsStringArb = unsafe extern "system" fn(hdc: HDC) -> *const i8;

/// Loaded WGL_NV_DX_interop2 function pointers.
struct WglInteropFunctions {
    dx_open_device: WglDxOpenDeviceNv,
    dx_close_device: WglDxCloseDeviceNv,
    dx_register_object: WglDxRegisterObjectNv,
    dx_unregister_object: WglDxUnregisterObjectNv,
    dx_lock_objects: WglDxLockObjectsNv,
    dx_unlock_objects: WglDxUnlockObjectsNv,
}

impl WglInteropFunctions {
    /// Load all WGL_NV_DX_interop2 function pointers via wglGetProcAddress.
    fn load() -> Option<Self> {
        unsafe {
            let load = |name: &CStr| -> Option<*mut GLvoid> {
                let addr = wglGetProcAddress(windows::core::PCSTR(name.as_ptr() as *const u8))?;
                let ptr = addr as usize as *mut GLvoid;
                (!ptr.is_null()).then_some(ptr)
            };

            Some(Self {
                dx_open_device: std::mem::transmute::<*mut GLvoid, WglDxOpenDeviceNv>(load(
                    c"wglDXOpenDeviceNV",
                )?),
                dx_close_device: std::mem::transmute::<*mut GLvoid, WglDxCloseDeviceNv>(load(
                    c"wglDXCloseDeviceNV",
                )?),
                dx_register_object: std::mem::transmute::<*mut GLvoid, WglDxRegisterObjectNv>(
                    load(c"wglDXRegisterObjectNV")?,
                ),
                dx_unregister_object: std::mem::transmute::<*mut GLvoid, WglDxUnregisterObjectNv>(
                    load(c"wglDXUnregisterObjectNV")?,
                ),
                dx_lock_objects: std::mem::transmute::<*mut GLvoid, WglDxLockObjectsNv>(load(
                    c"wglDXLockObjectsNV",
                )?),
                dx_unlock_objects: std::mem::transmute::<*mut GLvoid, WglDxUnlockObjectsNv>(load(
                    c"wglDXUnlockObjectsNV",
                )?),
            })
        }
    }
}

/// A finished frame: the shared D3D11 texture and its size.
#[derive(Clone)]
pub struct Dx11Surface {
    pub texture: ID3D11Texture2D,
    pub size: Size,
}

// SAFETY: the device is created without D3D11_CREATE_DEVICE_SINGLETHREADED,
// so references to its resources may be released and used from any thread.
unsafe impl Send for Dx11Surface {}

impl std::fmt::Debug for Dx11Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dx11Surface").field("size", &self.size).finish()
    }
}

/// A D3D11 texture registered with GL.
struct SharedTarget {
    handle: SharedHandle,
    size: Size,
    d3d_texture: ID3D11Texture2D,
    gl_texture: GLuint,
    /// WGL interop handle returned by wglDXRegisterObjectNV.
    interop_handle: *mut GLvoid,
    depth_renderbuffer: GLuint,
    locked: bool,
}

/// Shared render target between OpenGL and D3D11.
///
/// Holds at most one registered target. GL function pointers must already
/// be loaded for the current context (see `offgl_readback::RawGl::load`).
pub struct GlDx11Bridge {
    device: Dx11Device,
    wgl_fns: WglInteropFunctions,
    /// WGL interop device handle from wglDXOpenDeviceNV.
    interop_device: *mut GLvoid,
    target: Option<SharedTarget>,
    framebuffer: GLuint,
    depth: bool,
    next_handle: u64,
}

impl GlDx11Bridge {
    /// Create a D3D11 device and open it for WGL interop. `depth` attaches a
    /// 24-bit depth renderbuffer to every registered target.
    pub fn new(depth: bool) -> Result<Self> {
        let wgl_fns =
            WglInteropFunctions::load().context("WGL_NV_DX_interop2 entry points unavailable")?;
        let device = Dx11Device::new()?;
        let interop_device = open_interop_device(&wgl_fns, &device)?;

        let mut framebuffer: GLuint = 0;
        unsafe { gl::GenFramebuffers(1, &mut framebuffer) };

        debug!("GL-D3D11 interop bridge initialized via WGL_NV_DX_interop2");

        Ok(Self {
            device,
            wgl_fns,
            interop_device,
            target: None,
            framebuffer,
            depth,
            next_handle: 1,
        })
    }

    /// Check if the WGL_NV_DX_interop2 extension is available in the current
    /// GL context.
    pub fn is_available() -> bool {
        unsafe {
            let get_ext: Option<WglGetExtensionsStringArb> = {
                let addr = wglGetProcAddress(windows::core::PCSTR(
                    c"wglGetExtensionsStringARB".as_ptr() as *const u8,
                ));
                addr.map(|a| {
                    std::mem::transmute::<
                        unsafe extern "system" fn() -> isize,
                        WglGetExtensionsStringArb,
                    >(a)
                })
            };

            let Some(ext_fn) = get_ext else {
                return false;
            };

            let ext_str = ext_fn(wglGetCurrentDC());
            if ext_str.is_null() {
                return false;
            }
            CStr::from_ptr(ext_str)
                .to_string_lossy()
                .contains("WGL_NV_DX_interop2")
        }
    }

    pub fn device(&self) -> &Dx11Device {
        &self.device
    }

    fn target_for(&mut self, handle: SharedHandle) -> Result<&mut SharedTarget> {
        match self.target.as_mut() {
            Some(target) if target.handle == handle => Ok(target),
            _ => bail!("shared handle {} is not registered", handle.id()),
        }
    }

    fn create_texture(&self, size: Size) -> Result<ID3D11Texture2D> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: size.width as u32,
            Height: size.height as u32,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_B8G8R8A8_UNORM,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: (D3D11_BIND_RENDER_TARGET.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32,
            CPUAccessFlags: 0,
            MiscFlags: D3D11_RESOURCE_MISC_SHARED.0 as u32,
        };
        let mut texture = None;
        unsafe {
            self.device
                .device()
                .CreateTexture2D(&desc, None, Some(&mut texture as *mut _))
        }
        .with_context(|| format!("CreateTexture2D failed for {size}"))?;
        texture.context("CreateTexture2D returned no texture")
    }

    /// Register, attach and verify a new target. On failure everything it
    /// created is released again.
    fn build_target(&mut self, size: Size) -> Result<SharedTarget> {
        let d3d_texture = self.create_texture(size)?;

        let mut gl_texture: GLuint = 0;
        unsafe { gl::GenTextures(1, &mut gl_texture) };
        if gl_texture == 0 {
            bail!("Failed to generate GL texture name for interop");
        }

        let interop_handle = unsafe {
            let d3d_raw: *mut GLvoid =
                windows::core::Interface::as_raw(&d3d_texture) as *mut GLvoid;
            (self.wgl_fns.dx_register_object)(
                self.interop_device,
                d3d_raw,
                gl_texture,
                gl::TEXTURE_2D,
                WGL_ACCESS_READ_WRITE_NV,
            )
        };
        if interop_handle.is_null() {
            unsafe { gl::DeleteTextures(1, &gl_texture) };
            bail!("wglDXRegisterObjectNV failed for texture {size}");
        }

        let mut target = SharedTarget {
            handle: SharedHandle::new(self.next_handle),
            size,
            d3d_texture,
            gl_texture,
            interop_handle,
            depth_renderbuffer: 0,
            locked: false,
        };
        self.next_handle += 1;

        if let Err(err) = self.attach(&mut target) {
            self.destroy_target(target);
            return Err(err);
        }
        Ok(target)
    }

    fn attach(&mut self, target: &mut SharedTarget) -> Result<()> {
        if self.framebuffer == 0 {
            unsafe { gl::GenFramebuffers(1, &mut self.framebuffer) };
        }
        let mut handles = [target.interop_handle];
        let locked = unsafe {
            (self.wgl_fns.dx_lock_objects)(self.interop_device, 1, handles.as_mut_ptr())
        };
        if locked == 0 {
            bail!("wglDXLockObjectsNV failed while attaching the shared target");
        }

        let status = unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.framebuffer);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                target.gl_texture,
                0,
            );
            if self.depth {
                gl::GenRenderbuffers(1, &mut target.depth_renderbuffer);
                gl::BindRenderbuffer(gl::RENDERBUFFER, target.depth_renderbuffer);
                gl::RenderbufferStorage(
                    gl::RENDERBUFFER,
                    gl::DEPTH_COMPONENT24,
                    target.size.width as GLsizei,
                    target.size.height as GLsizei,
                );
                gl::BindRenderbuffer(gl::RENDERBUFFER, 0);
                gl::FramebufferRenderbuffer(
                    gl::FRAMEBUFFER,
                    gl::DEPTH_ATTACHMENT,
                    gl::RENDERBUFFER,
                    target.depth_renderbuffer,
                );
            }
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            (self.wgl_fns.dx_unlock_objects)(self.interop_device, 1, handles.as_mut_ptr());
            status
        };

        if status != gl::FRAMEBUFFER_COMPLETE {
            bail!("shared framebuffer is incomplete (status 0x{status:04X})");
        }
        Ok(())
    }

    fn destroy_target(&mut self, mut target: SharedTarget) {
        unsafe {
            if target.locked {
                let mut handles = [target.interop_handle];
                (self.wgl_fns.dx_unlock_objects)(self.interop_device, 1, handles.as_mut_ptr());
                target.locked = false;
            }
            (self.wgl_fns.dx_unregister_object)(self.interop_device, target.interop_handle);
            gl::DeleteTextures(1, &target.gl_texture);
            if target.depth_renderbuffer != 0 {
                gl::DeleteRenderbuffers(1, &target.depth_renderbuffer);
            }
        }
        debug!(size = %target.size, handle = target.handle.id(), "shared target released");
    }

    /// Recreate the D3D11 device after it was removed. Every registered
    /// target is lost.
    fn reset_device(&mut self) -> Result<()> {
        if let Some(target) = self.target.take() {
            // The old registration dies with the device; unregistering may
            // fail, which is fine.
            self.destroy_target(target);
        }
        unsafe { (self.wgl_fns.dx_close_device)(self.interop_device) };
        self.interop_device = std::ptr::null_mut();

        self.device = Dx11Device::new()?;
        self.interop_device = open_interop_device(&self.wgl_fns, &self.device)?;
        debug!("D3D11 device recreated after device loss");
        Ok(())
    }
}

fn open_interop_device(wgl_fns: &WglInteropFunctions, device: &Dx11Device) -> Result<*mut GLvoid> {
    let interop_device = unsafe {
        let d3d_raw: *mut GLvoid = windows::core::Interface::as_raw(device.device()) as *mut GLvoid;
        (wgl_fns.dx_open_device)(d3d_raw)
    };
    if interop_device.is_null() {
        error!("wglDXOpenDeviceNV failed");
        bail!("wglDXOpenDeviceNV failed");
    }
    Ok(interop_device)
}

impl SharedSurfaceBridge for GlDx11Bridge {
    type Surface = Dx11Surface;

    fn register_shared_target(&mut self, size: Size) -> Result<SharedHandle> {
        if size.is_empty() {
            bail!("cannot register a shared target of {size}");
        }
        if let Some(existing) = &self.target {
            bail!(
                "shared target {} is still registered; resize it instead",
                existing.handle.id()
            );
        }
        let target = self.build_target(size)?;
        let handle = target.handle;
        debug!(%size, handle = handle.id(), "shared target registered");
        self.target = Some(target);
        Ok(handle)
    }

    fn lock(&mut self, handle: SharedHandle) -> Result<()> {
        let interop_device = self.interop_device;
        let lock_objects = self.wgl_fns.dx_lock_objects;
        let target = self.target_for(handle)?;
        let mut handles = [target.interop_handle];
        if unsafe { lock_objects(interop_device, 1, handles.as_mut_ptr()) } == 0 {
            bail!("wglDXLockObjectsNV failed for handle {}", handle.id());
        }
        target.locked = true;
        Ok(())
    }

    fn unlock(&mut self, handle: SharedHandle) -> Result<()> {
        let interop_device = self.interop_device;
        let unlock_objects = self.wgl_fns.dx_unlock_objects;
        let target = self.target_for(handle)?;
        let mut handles = [target.interop_handle];
        if unsafe { unlock_objects(interop_device, 1, handles.as_mut_ptr()) } == 0 {
            bail!("wglDXUnlockObjectsNV failed for handle {}", handle.id());
        }
        target.locked = false;
        Ok(())
    }

    fn unregister(&mut self, handle: SharedHandle) {
        match self.target.take() {
            Some(target) if target.handle == handle => self.destroy_target(target),
            other => {
                debug!(handle = handle.id(), "ignoring unregister of unknown shared handle");
                self.target = other;
            }
        }
    }

    fn framebuffer(&self) -> GLuint {
        self.framebuffer
    }

    fn present(&mut self) -> std::result::Result<Dx11Surface, PresentError> {
        self.device.wait_idle();

        if let Err(reason) = self.device.check_removed() {
            warn!("D3D11 device lost ({reason}), resetting");
            return match self.reset_device() {
                Ok(()) => Err(PresentError::DeviceReset),
                Err(err) => Err(PresentError::Failed(format!(
                    "device reset failed: {err:#}"
                ))),
            };
        }

        self.target
            .as_ref()
            .map(|target| Dx11Surface {
                texture: target.d3d_texture.clone(),
                size: target.size,
            })
            .ok_or_else(|| PresentError::Failed("no shared target is registered".into()))
    }

    fn dimensions(&self) -> Size {
        self.target
            .as_ref()
            .map_or_else(Size::default, |target| target.size)
    }

    fn cleanup(&mut self) {
        if let Some(target) = self.target.take() {
            self.destroy_target(target);
        }
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            if self.framebuffer != 0 {
                gl::DeleteFramebuffers(1, &self.framebuffer);
                self.framebuffer = 0;
            }
        }
    }
}

impl Drop for GlDx11Bridge {
    fn drop(&mut self) {
        self.cleanup();
        if !self.interop_device.is_null() {
            unsafe { (self.wgl_fns.dx_close_device)(self.interop_device) };
        }
    }
}
